// https://github.com/mrash/fwknop -- the protocol this daemon implements the core of: a Single
// Packet Authorization listener that silently authenticates one UDP datagram at a time and, on
// success, grants access as a side effect -- never a reply.

pub mod action;
pub mod command;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod evaluator;
pub mod firewall;
pub mod message;
pub mod packet;
pub mod pipeline;
pub mod policy;
pub mod server;

use anyhow::Context as _;

/// Loads the access file and digest store, picks the firewall back-end, and runs the receive
/// loop until shutdown.
pub fn run(config: &config::Config) -> anyhow::Result<()> {
  let policy = policy::Policy::load(&config.access_file)
    .with_context(|| format!("couldn't load access file {:?}", config.access_file))?;
  let digests = if config.enable_digest_persistence {
    digest::Store::open(Some(&config.digest_file))
      .with_context(|| format!("couldn't open digest store {:?}", config.digest_file))?
  } else {
    digest::Store::disabled()
  };

  if config.test_mode {
    log::warn!(target: "spad", "test-mode: no firewall rule or command will actually run");
    let backend = firewall::Null::default();
    server::run(config, &policy, &digests, &backend)
  } else {
    let backend = firewall::Iptables::new(std::path::PathBuf::from("/usr/sbin/iptables"), config.enable_nat, config.enable_forwarding);
    server::run(config, &policy, &digests, &backend)
  }
}
