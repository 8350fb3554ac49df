// Process-wide configuration, exposed as `clap::Args` and flattened into the binary's
// `Arguments` in main.rs.

use std::{net, num, path, time};

fn parse_duration(argument: &str) -> Result<time::Duration, num::ParseIntError> {
  Ok(time::Duration::from_secs(argument.parse()?))
}

#[derive(clap::Args, Debug, Clone)]
#[group(skip)]
pub struct Config {
  #[arg(long = "listen-address", help = "UDP listen address", default_value_t = net::Ipv4Addr::UNSPECIFIED)]
  pub listen_address: net::Ipv4Addr,
  #[arg(long = "listen-port", help = "UDP listen port", default_value_t = 62201)]
  pub listen_port: u16,

  #[arg(long = "access-file", help = "Path to the access.conf policy file")]
  pub access_file: path::PathBuf,
  #[arg(long = "digest-file", help = "Path to the persisted replay-digest store")]
  pub digest_file: path::PathBuf,

  #[arg(
    long = "enable-spa-over-http",
    help = "Accept SPA data wrapped in a single-line HTTP GET request",
    default_value_t = false
  )]
  pub enable_spa_over_http: bool,
  #[arg(
    long = "disable-sdp-mode",
    help = "Disable identifier-mode (SDP) client-ID lookup; fall back to source-IP scan",
    default_value_t = false
  )]
  pub disable_sdp_mode: bool,
  #[arg(
    long = "enable-packet-aging",
    help = "Reject packets whose embedded timestamp is too old",
    default_value_t = true
  )]
  pub enable_spa_packet_aging: bool,
  #[arg(
    long = "enable-digest-persistence",
    help = "Persist the replay-digest store to disk",
    default_value_t = true
  )]
  pub enable_digest_persistence: bool,
  #[arg(
    long = "allow-legacy-access-requests",
    help = "Permit the legacy ACCESS message type",
    default_value_t = false
  )]
  pub allow_legacy_access_requests: bool,
  #[arg(long = "enable-nat", help = "Compile-time/run-time NAT support", default_value_t = false)]
  pub enable_nat: bool,
  #[arg(
    long = "enable-local-nat",
    help = "Compile-time/run-time local-NAT support",
    default_value_t = false
  )]
  pub enable_local_nat: bool,
  #[arg(
    long = "enable-forwarding",
    help = "Allow the firewall back-end to forward NAT'd traffic",
    default_value_t = false
  )]
  pub enable_forwarding: bool,

  #[arg(
    long = "max-packet-age",
    help = "Maximum age (seconds) of an SPA packet's embedded timestamp",
    default_value_t = 120
  )]
  pub max_spa_packet_age: u32,
  #[arg(
    long = "select-timeout",
    help = "UDP receive-loop select/poll timeout",
    value_parser = parse_duration,
    default_value = "1"
  )]
  pub udpserv_select_timeout: time::Duration,
  #[arg(
    long = "rules-check-threshold",
    help = "Run a firewall rule sweep every N receive-loop iterations",
    default_value_t = 30
  )]
  pub rules_check_threshold: u32,

  #[arg(long = "sudo-exe", help = "Path to the sudo executable", default_value = "/usr/bin/sudo")]
  pub sudo_exe: path::PathBuf,

  #[arg(
    long = "test-mode",
    help = "Validate packets and log the decision but take no firewall/command action",
    default_value_t = false
  )]
  pub test_mode: bool,
}

impl Config {
  /// Builds a `Config` with every flag at its `clap` default, for tests that only care about a
  /// handful of fields.
  pub fn test_defaults() -> Self {
    Self {
      listen_address: net::Ipv4Addr::UNSPECIFIED,
      listen_port: 62201,
      access_file: "access.conf".into(),
      digest_file: "digest.db".into(),
      enable_spa_over_http: false,
      disable_sdp_mode: false,
      enable_spa_packet_aging: true,
      enable_digest_persistence: true,
      allow_legacy_access_requests: false,
      enable_nat: false,
      enable_local_nat: false,
      enable_forwarding: false,
      max_spa_packet_age: 120,
      udpserv_select_timeout: time::Duration::from_secs(1),
      rules_check_threshold: 30,
      sudo_exe: "/usr/bin/sudo".into(),
      test_mode: false,
    }
  }
}
