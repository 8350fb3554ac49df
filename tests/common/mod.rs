// Shared fixture builder for the integration tests: a `Runner` that assembles a policy, config,
// and digest store the way `spad::run` does, minus the real UDP socket and firewall backend.

use base64::Engine as _;
use spad::{config, crypto, digest, firewall, packet, pipeline, policy};

pub const DEFAULT_ACCESS_CONF: &str = "SOURCE 192.168.1.0/24\n\
  KEY_BASE64 dGVzdF9rZXlfMTIzNDU=\n\
  HMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\n\
  OPEN_PORTS tcp/22\n";

#[derive(Clone)]
pub struct Runner {
  access_conf: String,
  test_mode: bool,
  disable_sdp_mode: bool,
  enable_spa_over_http: bool,
  enable_spa_packet_aging: bool,
  enable_nat: bool,
  enable_local_nat: bool,
  persist_digests: bool,
}

impl Runner {
  pub fn new() -> Self {
    Self {
      access_conf: DEFAULT_ACCESS_CONF.to_string(),
      test_mode: false,
      disable_sdp_mode: true,
      enable_spa_over_http: false,
      enable_spa_packet_aging: true,
      enable_nat: false,
      enable_local_nat: false,
      persist_digests: true,
    }
  }

  pub fn with_access_conf(&self, contents: &str) -> Self {
    Self {
      access_conf: contents.to_string(),
      ..self.clone()
    }
  }

  pub fn with_test_mode(&self, enabled: bool) -> Self {
    Self { test_mode: enabled, ..self.clone() }
  }

  pub fn with_sdp_mode(&self, enabled: bool) -> Self {
    Self { disable_sdp_mode: !enabled, ..self.clone() }
  }

  pub fn with_spa_over_http(&self, enabled: bool) -> Self {
    Self { enable_spa_over_http: enabled, ..self.clone() }
  }

  pub fn with_packet_aging(&self, enabled: bool) -> Self {
    Self { enable_spa_packet_aging: enabled, ..self.clone() }
  }

  pub fn with_nat(&self, enabled: bool) -> Self {
    Self { enable_nat: enabled, ..self.clone() }
  }

  pub fn with_local_nat(&self, enabled: bool) -> Self {
    Self { enable_local_nat: enabled, ..self.clone() }
  }

  /// `false` builds a true no-op digest store (`Store::disabled()`): the same ciphertext sent
  /// twice produces the same side effect twice. `true` (the default) builds an active
  /// in-memory store that dedups but never touches disk.
  pub fn with_replay_suppression(&self, enabled: bool) -> Self {
    Self { persist_digests: enabled, ..self.clone() }
  }

  pub fn build(&self) -> Fixture {
    let stanzas = policy::parse(&self.access_conf).expect("invalid access.conf fixture");
    let policy = policy::Policy::from_stanzas(stanzas).expect("duplicate CLIENT_ID fixture");
    let mut config = config::Config::test_defaults();
    config.test_mode = self.test_mode;
    config.disable_sdp_mode = self.disable_sdp_mode;
    config.enable_spa_over_http = self.enable_spa_over_http;
    config.enable_spa_packet_aging = self.enable_spa_packet_aging;
    config.enable_nat = self.enable_nat;
    config.enable_local_nat = self.enable_local_nat;
    let digests = if self.persist_digests {
      digest::Store::in_memory()
    } else {
      digest::Store::disabled()
    };
    Fixture {
      policy,
      config,
      digests,
      backend: firewall::Null::default(),
    }
  }
}

impl Default for Runner {
  fn default() -> Self {
    Self::new()
  }
}

pub struct Fixture {
  pub policy: policy::Policy,
  pub config: config::Config,
  pub digests: digest::Store,
  pub backend: firewall::Null,
}

impl Fixture {
  /// Encrypts `plaintext` under the fixture policy's first stanza, wire-framed and base64'd the
  /// way a real client would send it.
  pub fn encode_symmetric(&self, salt: [u8; 8], plaintext: &[u8]) -> String {
    let guard = self.policy.read();
    let key = guard[0].symmetric.as_ref().expect("fixture stanza has no KEY_BASE64");
    let wire = crypto::symmetric::encrypt(key, salt, plaintext);
    base64::engine::general_purpose::STANDARD.encode(&wire)
  }

  pub fn send(&self, raw: &[u8], now: i64) -> pipeline::Disposition {
    pipeline::handle(raw, recv(), &self.config, &self.policy, &self.digests, &self.backend, now)
  }

  pub fn grant_count(&self) -> usize {
    self.backend.grants.lock().unwrap().len()
  }
}

pub fn recv() -> packet::RecvMeta {
  packet::RecvMeta {
    src_ip: "192.168.1.7".parse().unwrap(),
    dst_ip: "192.168.1.1".parse().unwrap(),
    src_port: 44123,
    dst_port: 62201,
  }
}

pub const NOW: i64 = 1_700_000_000;
