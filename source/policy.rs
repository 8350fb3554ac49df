// Access stanza data model, the access.conf parser (covering exactly the stanza fields this
// daemon needs), and C3 -- Policy Resolver.

use anyhow::Context as _;
use std::{
  collections, fs, net, path,
  sync::{self, atomic},
};
use zeroize::Zeroize as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgorithm {
  Md5,
  Sha1,
  Sha256,
  Sha384,
  Sha512,
}

impl HmacAlgorithm {
  fn parse(value: &str) -> anyhow::Result<Self> {
    match value.to_ascii_lowercase().as_str() {
      "md5" => Ok(HmacAlgorithm::Md5),
      "sha1" => Ok(HmacAlgorithm::Sha1),
      "sha256" => Ok(HmacAlgorithm::Sha256),
      "sha384" => Ok(HmacAlgorithm::Sha384),
      "sha512" => Ok(HmacAlgorithm::Sha512),
      other => anyhow::bail!("unknown HMAC_DIGEST_TYPE {other:?}"),
    }
  }
}

/// Symmetric key material for a stanza. Zeroed on drop: this is key material living in
/// long-lived, shared state, not per-packet scratch, but it still must never linger past the
/// life of the stanza list (e.g. across a policy reload).
#[derive(Debug, zeroize::ZeroizeOnDrop)]
pub struct SymmetricKey {
  pub key: Vec<u8>,
  #[zeroize(skip)]
  pub hmac_algorithm: HmacAlgorithm,
  pub hmac_key: Vec<u8>,
}

#[derive(Debug, zeroize::ZeroizeOnDrop)]
pub struct AsymmetricSettings {
  #[zeroize(skip)]
  pub gpg_exe: path::PathBuf,
  #[zeroize(skip)]
  pub gpg_home: path::PathBuf,
  pub decrypt_passphrase: Option<String>,
  #[zeroize(skip)]
  pub allow_no_passphrase: bool,
  #[zeroize(skip)]
  pub allowed_signer_ids: Vec<String>,
  #[zeroize(skip)]
  pub allowed_signer_fingerprints: Vec<String>,
  #[zeroize(skip)]
  pub require_signature: bool,
  #[zeroize(skip)]
  pub ignore_verify_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  Tcp,
  Udp,
}

impl Protocol {
  fn parse(value: &str) -> anyhow::Result<Self> {
    match value.to_ascii_lowercase().as_str() {
      "tcp" => Ok(Protocol::Tcp),
      "udp" => Ok(Protocol::Udp),
      other => anyhow::bail!("unknown protocol {other:?}"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortProto {
  pub protocol: Protocol,
  pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CommandCycle {
  pub open: String,
  pub close: String,
}

#[derive(Debug)]
pub struct Stanza {
  /// 1-based position in the access file, used only for log lines.
  pub number: usize,
  pub source: Vec<ipnet::Ipv4Net>,
  pub destination: Option<Vec<ipnet::Ipv4Net>>,
  pub symmetric: Option<SymmetricKey>,
  pub asymmetric: Option<AsymmetricSettings>,
  pub permitted_ports: Vec<PortProto>,
  pub permitted_services: Vec<String>,
  pub required_username: Option<String>,
  pub require_source_address: bool,
  pub access_timeout: u32,
  pub expiration: Option<i64>,
  expired: atomic::AtomicBool,
  pub enable_cmd_exec: bool,
  pub enable_cmd_sudo_exec: bool,
  pub cmd_exec_user: Option<String>,
  pub cmd_exec_group: Option<String>,
  pub cmd_sudo_exec_user: Option<String>,
  pub cmd_sudo_exec_group: Option<String>,
  pub cmd_exec_uid: Option<u32>,
  pub cmd_exec_gid: Option<u32>,
  pub command_cycle: Option<CommandCycle>,
  /// Present when this stanza is addressable by identifier (SDP) mode.
  pub client_id: Option<String>,
}

impl Stanza {
  /// Sticky-marks the stanza expired on first observation past `expiration`.
  pub fn is_expired(&self, now: i64) -> bool {
    if self.expired.load(atomic::Ordering::Relaxed) {
      return true;
    }
    match self.expiration {
      Some(expiration) if now > expiration => {
        self.expired.store(true, atomic::Ordering::Relaxed);
        true
      }
      _ => false,
    }
  }

  pub fn matches_source(&self, ip: net::Ipv4Addr) -> bool {
    self.source.iter().any(|net| net.contains(&ip))
  }

  pub fn matches_destination(&self, ip: net::Ipv4Addr) -> bool {
    match &self.destination {
      Some(list) => list.iter().any(|net| net.contains(&ip)),
      None => true,
    }
  }
}

peg::parser! {
  grammar line() for str {
    rule ws() = quiet!{[' ' | '\t']*}
    rule key() -> &'input str = s:$(['A'..='Z' | '0'..='9' | '_']+) { s }
    pub rule directive() -> (&'input str, &'input str)
      = ws() k:key() ws() v:$([_]*) { (k, v.trim()) }
  }
}

fn split_list(value: &str) -> Vec<String> {
  value
    .split(',')
    .map(|item| item.trim().to_string())
    .filter(|item| !item.is_empty())
    .collect()
}

fn parse_bool(value: &str) -> bool {
  matches!(value.to_ascii_uppercase().as_str(), "Y" | "YES" | "1" | "TRUE")
}

fn parse_nets(value: &str) -> anyhow::Result<Vec<ipnet::Ipv4Net>> {
  split_list(value)
    .iter()
    .map(|item| {
      if item.contains('/') {
        item.parse::<ipnet::Ipv4Net>().with_context(|| format!("invalid CIDR {item:?}"))
      } else {
        item
          .parse::<net::Ipv4Addr>()
          .map(|ip| ipnet::Ipv4Net::new(ip, 32).unwrap())
          .with_context(|| format!("invalid IPv4 address {item:?}"))
      }
    })
    .collect()
}

fn parse_ports(value: &str) -> anyhow::Result<Vec<PortProto>> {
  split_list(value)
    .iter()
    .map(|item| {
      let (proto, port) = item
        .split_once('/')
        .with_context(|| format!("invalid proto/port {item:?}"))?;
      Ok(PortProto {
        protocol: Protocol::parse(proto)?,
        port: port.parse().with_context(|| format!("invalid port in {item:?}"))?,
      })
    })
    .collect()
}

#[derive(Default)]
struct Builder {
  number: usize,
  source: Vec<ipnet::Ipv4Net>,
  destination: Option<Vec<ipnet::Ipv4Net>>,
  key_b64: Option<String>,
  hmac_key_b64: Option<String>,
  hmac_digest_type: Option<String>,
  gpg_exe: Option<path::PathBuf>,
  gpg_home: Option<path::PathBuf>,
  gpg_decrypt_pw: Option<String>,
  gpg_allow_no_pw: bool,
  gpg_require_sig: bool,
  gpg_ignore_sig_verify_error: bool,
  gpg_remote_id: Vec<String>,
  gpg_remote_fpr: Vec<String>,
  permitted_ports: Vec<PortProto>,
  permitted_services: Vec<String>,
  required_username: Option<String>,
  require_source_address: bool,
  access_timeout: u32,
  expiration: Option<i64>,
  enable_cmd_exec: bool,
  enable_cmd_sudo_exec: bool,
  cmd_exec_user: Option<String>,
  cmd_exec_group: Option<String>,
  cmd_sudo_exec_user: Option<String>,
  cmd_sudo_exec_group: Option<String>,
  cmd_exec_uid: Option<u32>,
  cmd_exec_gid: Option<u32>,
  cmd_cycle_open: Option<String>,
  cmd_cycle_close: Option<String>,
  client_id: Option<String>,
}

impl Builder {
  fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
    match key {
      "SOURCE" => self.source = parse_nets(value)?,
      "DESTINATION" => self.destination = Some(parse_nets(value)?),
      "KEY_BASE64" => self.key_b64 = Some(value.to_string()),
      "HMAC_KEY_BASE64" => self.hmac_key_b64 = Some(value.to_string()),
      "HMAC_DIGEST_TYPE" => self.hmac_digest_type = Some(value.to_string()),
      "GPG_EXE" => self.gpg_exe = Some(value.into()),
      "GPG_HOME_DIR" => self.gpg_home = Some(value.into()),
      "GPG_DECRYPT_PW" => self.gpg_decrypt_pw = Some(value.to_string()),
      "GPG_ALLOW_NO_PW" => self.gpg_allow_no_pw = parse_bool(value),
      "GPG_REQUIRE_SIG" => self.gpg_require_sig = parse_bool(value),
      "GPG_IGNORE_SIG_VERIFY_ERROR" => self.gpg_ignore_sig_verify_error = parse_bool(value),
      "GPG_REMOTE_ID" => self.gpg_remote_id = split_list(value),
      "GPG_REMOTE_FPR" => self.gpg_remote_fpr = split_list(value),
      "OPEN_PORTS" => self.permitted_ports = parse_ports(value)?,
      "PERMIT_SERVICE" => self.permitted_services = split_list(value),
      "REQUIRE_USERNAME" => self.required_username = Some(value.to_string()),
      "REQUIRE_SOURCE_ADDRESS" => self.require_source_address = parse_bool(value),
      "ACCESS_TIMEOUT" => self.access_timeout = value.parse().with_context(|| "invalid ACCESS_TIMEOUT")?,
      "EXPIRE" => self.expiration = Some(value.parse().with_context(|| "invalid EXPIRE")?),
      "ENABLE_CMD_EXEC" => self.enable_cmd_exec = parse_bool(value),
      "ENABLE_CMD_SUDO_EXEC" => self.enable_cmd_sudo_exec = parse_bool(value),
      "CMD_EXEC_USER" => self.cmd_exec_user = Some(value.to_string()),
      "CMD_EXEC_GROUP" => self.cmd_exec_group = Some(value.to_string()),
      "CMD_SUDO_EXEC_USER" => self.cmd_sudo_exec_user = Some(value.to_string()),
      "CMD_SUDO_EXEC_GROUP" => self.cmd_sudo_exec_group = Some(value.to_string()),
      "CMD_EXEC_UID" => self.cmd_exec_uid = Some(value.parse().with_context(|| "invalid CMD_EXEC_UID")?),
      "CMD_EXEC_GID" => self.cmd_exec_gid = Some(value.parse().with_context(|| "invalid CMD_EXEC_GID")?),
      "CMD_CYCLE_OPEN" => self.cmd_cycle_open = Some(value.to_string()),
      "CMD_CYCLE_CLOSE" => self.cmd_cycle_close = Some(value.to_string()),
      "CLIENT_ID" => self.client_id = Some(value.to_string()),
      other => anyhow::bail!("unknown directive {other:?}"),
    }
    Ok(())
  }

  fn finish(mut self) -> anyhow::Result<Stanza> {
    anyhow::ensure!(!self.source.is_empty(), "stanza {} has no SOURCE", self.number);
    use base64::Engine as _;
    let b64 = base64::engine::general_purpose::STANDARD;
    let symmetric = match (self.key_b64.take(), self.hmac_key_b64.take()) {
      (Some(key), Some(hmac_key)) => Some(SymmetricKey {
        key: b64.decode(key).with_context(|| "invalid KEY_BASE64")?,
        hmac_key: b64.decode(hmac_key).with_context(|| "invalid HMAC_KEY_BASE64")?,
        hmac_algorithm: match self.hmac_digest_type {
          Some(name) => HmacAlgorithm::parse(&name)?,
          None => HmacAlgorithm::Sha256,
        },
      }),
      (None, None) => None,
      _ => anyhow::bail!("stanza {} has KEY_BASE64 without HMAC_KEY_BASE64 or vice versa", self.number),
    };
    let asymmetric = if self.gpg_home.is_some() || self.gpg_exe.is_some() {
      Some(AsymmetricSettings {
        gpg_exe: self.gpg_exe.unwrap_or_else(|| "/usr/bin/gpg".into()),
        gpg_home: self
          .gpg_home
          .with_context(|| format!("stanza {} has GPG_EXE without GPG_HOME_DIR", self.number))?,
        decrypt_passphrase: self.gpg_decrypt_pw,
        allow_no_passphrase: self.gpg_allow_no_pw,
        allowed_signer_ids: self.gpg_remote_id,
        allowed_signer_fingerprints: self.gpg_remote_fpr,
        require_signature: self.gpg_require_sig,
        ignore_verify_error: self.gpg_ignore_sig_verify_error,
      })
    } else {
      None
    };
    anyhow::ensure!(
      symmetric.is_some() || asymmetric.is_some(),
      "stanza {} has neither a symmetric key nor asymmetric settings",
      self.number
    );
    if self.enable_cmd_sudo_exec {
      anyhow::ensure!(
        self.cmd_sudo_exec_group.is_some() || self.cmd_sudo_exec_user.is_some(),
        "stanza {} enables sudo command execution without a user or group",
        self.number
      );
    }
    Ok(Stanza {
      number: self.number,
      source: self.source,
      destination: self.destination,
      symmetric,
      asymmetric,
      permitted_ports: self.permitted_ports,
      permitted_services: self.permitted_services,
      required_username: self.required_username,
      require_source_address: self.require_source_address,
      access_timeout: self.access_timeout,
      expiration: self.expiration,
      expired: atomic::AtomicBool::new(false),
      enable_cmd_exec: self.enable_cmd_exec,
      enable_cmd_sudo_exec: self.enable_cmd_sudo_exec,
      cmd_exec_user: self.cmd_exec_user,
      cmd_exec_group: self.cmd_exec_group,
      cmd_sudo_exec_user: self.cmd_sudo_exec_user,
      cmd_sudo_exec_group: self.cmd_sudo_exec_group,
      cmd_exec_uid: self.cmd_exec_uid,
      cmd_exec_gid: self.cmd_exec_gid,
      command_cycle: match (self.cmd_cycle_open, self.cmd_cycle_close) {
        (Some(open), Some(close)) => Some(CommandCycle { open, close }),
        _ => None,
      },
      client_id: self.client_id,
    })
  }
}

pub fn parse(contents: &str) -> anyhow::Result<Vec<Stanza>> {
  let mut stanzas = Vec::new();
  let mut current: Option<Builder> = None;
  for (lineno, raw_line) in contents.lines().enumerate() {
    let trimmed = raw_line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
      continue;
    }
    let (key, value) = line::directive(trimmed)
      .map_err(|error| anyhow::anyhow!("line {}: {error}", lineno + 1))?;
    if key == "SOURCE" {
      if let Some(builder) = current.take() {
        stanzas.push(builder.finish()?);
      }
      current = Some(Builder {
        number: stanzas.len() + 1,
        ..Builder::default()
      });
    }
    current
      .as_mut()
      .with_context(|| format!("line {}: directive before any SOURCE stanza", lineno + 1))?
      .apply(key, value)
      .with_context(|| format!("line {}", lineno + 1))?;
  }
  if let Some(builder) = current {
    stanzas.push(builder.finish()?);
  }
  Ok(stanzas)
}

/// Long-lived, server-owned stanza list plus the identifier-mode lookup index.
pub struct Policy {
  stanzas: sync::RwLock<Vec<Stanza>>,
  by_client_id: sync::Mutex<collections::HashMap<String, usize>>,
}

impl Policy {
  pub fn load(path: &path::Path) -> anyhow::Result<Self> {
    let contents =
      fs::read_to_string(path).with_context(|| format!("couldn't read access file {path:?}"))?;
    Self::from_stanzas(parse(&contents)?)
  }

  pub fn from_stanzas(stanzas: Vec<Stanza>) -> anyhow::Result<Self> {
    let mut by_client_id = collections::HashMap::new();
    for (index, stanza) in stanzas.iter().enumerate() {
      if let Some(id) = &stanza.client_id {
        anyhow::ensure!(
          by_client_id.insert(id.clone(), index).is_none(),
          "duplicate CLIENT_ID {id:?} in access file"
        );
      }
    }
    Ok(Self {
      stanzas: sync::RwLock::new(stanzas),
      by_client_id: sync::Mutex::new(by_client_id),
    })
  }

  pub fn read(&self) -> sync::RwLockReadGuard<'_, Vec<Stanza>> {
    self.stanzas.read().unwrap()
  }

  /// Identifier-mode lookup: the hash table is guarded by a mutex taken across `get` only (spec
  /// §5), so the lock is released before the caller does anything with the returned index.
  fn lookup_identifier(&self, client_id_str: &str) -> Option<usize> {
    self.by_client_id.lock().unwrap().get(client_id_str).copied()
  }
}

/// C3 -- lazily yields the candidate stanzas a packet should be tried against. In identifier mode this yields at most one stanza.
pub enum StanzaSelector<'a> {
  Identifier(std::iter::Once<Option<&'a Stanza>>),
  SourceScan {
    stanzas: &'a [Stanza],
    src_ip: net::Ipv4Addr,
    dst_ip: net::Ipv4Addr,
    index: usize,
  },
}

impl<'a> Iterator for StanzaSelector<'a> {
  type Item = &'a Stanza;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      StanzaSelector::Identifier(once) => once.next().flatten(),
      StanzaSelector::SourceScan {
        stanzas,
        src_ip,
        dst_ip,
        index,
      } => {
        while *index < stanzas.len() {
          let candidate = &stanzas[*index];
          *index += 1;
          if candidate.matches_source(*src_ip) && candidate.matches_destination(*dst_ip) {
            return Some(candidate);
          }
        }
        None
      }
    }
  }
}

pub fn resolve<'a>(
  policy: &Policy,
  stanzas: &'a [Stanza],
  disable_sdp_mode: bool,
  client_id_str: &str,
  src_ip: net::Ipv4Addr,
  dst_ip: net::Ipv4Addr,
) -> StanzaSelector<'a> {
  if disable_sdp_mode {
    StanzaSelector::SourceScan {
      stanzas,
      src_ip,
      dst_ip,
      index: 0,
    }
  } else {
    let found = policy
      .lookup_identifier(client_id_str)
      .map(|index| &stanzas[index]);
    if found.is_none() {
      log::warn!(target: "spad::policy", "no stanza for client identifier {client_id_str:?}");
    }
    StanzaSelector::Identifier(std::iter::once(found))
  }
}
