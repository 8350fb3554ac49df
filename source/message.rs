// C5 -- Message Parser. Decodes the decrypted SPA plaintext into typed fields.
// Extraction of any field failing produces a drop (`Error::DecryptFailed`, treated identically
// to a crypto failure since a malformed plaintext is indistinguishable from a corrupted key by
// the time we get here).

use crate::{constants, error::Error};
use std::net;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
  Command,
  Access,
  ClientTimeoutAccess,
  NatAccess,
  ClientTimeoutNatAccess,
  LocalNatAccess,
  ClientTimeoutLocalNatAccess,
  ServiceAccess,
  ClientTimeoutServiceAccess,
  LegacyAccess,
}

impl MessageType {
  fn from_code(code: u8) -> Option<Self> {
    Some(match code {
      0 => MessageType::Command,
      1 => MessageType::Access,
      2 => MessageType::ClientTimeoutAccess,
      3 => MessageType::NatAccess,
      4 => MessageType::ClientTimeoutNatAccess,
      5 => MessageType::LocalNatAccess,
      6 => MessageType::ClientTimeoutLocalNatAccess,
      7 => MessageType::ServiceAccess,
      8 => MessageType::ClientTimeoutServiceAccess,
      9 => MessageType::LegacyAccess,
      _ => return None,
    })
  }

  pub fn is_nat(&self) -> bool {
    matches!(
      self,
      MessageType::NatAccess | MessageType::ClientTimeoutNatAccess
    )
  }

  pub fn is_local_nat(&self) -> bool {
    matches!(
      self,
      MessageType::LocalNatAccess | MessageType::ClientTimeoutLocalNatAccess
    )
  }

  pub fn is_service(&self) -> bool {
    matches!(
      self,
      MessageType::ServiceAccess | MessageType::ClientTimeoutServiceAccess
    )
  }

  pub fn is_legacy(&self) -> bool {
    matches!(self, MessageType::LegacyAccess)
  }

  pub fn has_client_timeout_semantics(&self) -> bool {
    matches!(
      self,
      MessageType::ClientTimeoutAccess
        | MessageType::ClientTimeoutNatAccess
        | MessageType::ClientTimeoutLocalNatAccess
        | MessageType::ClientTimeoutServiceAccess
    )
  }
}

#[derive(Debug)]
pub struct Message {
  /// Carried through from the classifier, not re-encoded in the plaintext; zero when identifier
  /// mode is disabled.
  pub client_id: u32,
  pub username: String,
  pub timestamp: i64,
  pub version: String,
  pub msg_type: MessageType,
  pub source_ip: net::Ipv4Addr,
  /// Everything after the first comma in the message body, bounded to `MAX_DECRYPTED_SPA_LEN`.
  pub request: String,
  pub nat_access: Option<String>,
  pub server_auth: Option<String>,
  pub client_timeout: Option<u32>,
}

peg::parser! {
  grammar fields() for str {
    rule not_colon() -> &'input str = s:$([^ ':']*) { s }
    pub rule line() -> Vec<&'input str>
      = parts:(not_colon() ** ":") { parts }
  }
}

fn parse_body(body: &str) -> Result<(net::Ipv4Addr, String), Error> {
  let comma = memchr::memchr(b',', body.as_bytes()).ok_or(Error::DecryptFailed)?;
  let (ip_str, rest) = body.split_at(comma);
  let rest = &rest[1..]; // skip the comma itself
  if ip_str.len() < constants::MIN_IPV4_STR_LEN - 1 || ip_str.len() > constants::MAX_IPV4_STR_LEN {
    return Err(Error::DecryptFailed);
  }
  let source_ip: net::Ipv4Addr = ip_str.parse().map_err(|_| Error::DecryptFailed)?;
  if rest.len() > constants::MAX_DECRYPTED_SPA_LEN {
    return Err(Error::DecryptFailed);
  }
  Ok((source_ip, rest.to_string()))
}

pub fn parse(plaintext: &[u8], client_id: u32) -> Result<Message, Error> {
  let text = std::str::from_utf8(plaintext).map_err(|_| Error::DecryptFailed)?;
  let parts = fields::line(text).map_err(|_| Error::DecryptFailed)?;
  // random:user:timestamp:version:msg_type:msg_body[:nat_access][:server_auth][:client_timeout]
  if parts.len() < 6 || parts.len() > 9 {
    return Err(Error::DecryptFailed);
  }
  let username = parts[1].to_string();
  if username.is_empty() {
    return Err(Error::DecryptFailed);
  }
  let timestamp: i64 = parts[2].parse().map_err(|_| Error::DecryptFailed)?;
  let version = parts[3].to_string();
  let msg_type_code: u8 = parts[4].parse().map_err(|_| Error::DecryptFailed)?;
  let msg_type = MessageType::from_code(msg_type_code).ok_or(Error::DecryptFailed)?;
  let (source_ip, request) = parse_body(parts[5])?;

  let mut optional = parts[6..].iter();
  let nat_access = optional.next().map(|s| s.to_string()).filter(|s| !s.is_empty());
  let server_auth = optional.next().map(|s| s.to_string()).filter(|s| !s.is_empty());
  let client_timeout = optional
    .next()
    .map(|s| s.parse::<u32>())
    .transpose()
    .map_err(|_| Error::DecryptFailed)?;

  Ok(Message {
    client_id,
    username,
    timestamp,
    version,
    msg_type,
    source_ip,
    request,
    nat_access,
    server_auth,
    client_timeout,
  })
}
