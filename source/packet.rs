// C1 -- Packet Classifier. Cheap structural checks on raw bytes; never decrypts,
// never allocates unbounded memory.

use crate::{config, constants, error::Error};
use std::net;
use subtle::ConstantTimeEq as _;

#[derive(Debug, Clone, Copy)]
pub struct RecvMeta {
  pub src_ip: net::Ipv4Addr,
  pub dst_ip: net::Ipv4Addr,
  pub src_port: u16,
  pub dst_port: u16,
}

/// Per-datagram scratch record. Dropped at the end of the pipeline.
#[derive(Debug)]
pub struct Packet {
  /// Normalized base64 ciphertext, after HTTP-unwrap (if any) -- this is the buffer the rest of
  /// the pipeline, including the replay digest, operates on.
  pub data: Vec<u8>,
  pub recv: RecvMeta,
  /// Zero when identifier mode is disabled or the config said not to try it.
  pub client_id: u32,
  pub client_id_str: String,
}

/// Constant-time "does `haystack` start with `needle`" -- length-dependent timing is acceptable
/// , the comparison itself is not.
fn starts_with_constant_time(haystack: &[u8], needle: &[u8]) -> bool {
  if haystack.len() < needle.len() {
    return false;
  }
  haystack[..needle.len()].ct_eq(needle).into()
}

fn is_base64_byte(b: u8) -> bool {
  b.is_ascii_alphanumeric() || b == b'+' || b == b'/'
}

fn validate_base64(buf: &[u8]) -> bool {
  if buf.is_empty() {
    return false;
  }
  let mut end = buf.len();
  while end > 0 && buf[end - 1] == b'=' {
    end -= 1;
  }
  if buf.len() - end > 2 {
    return false;
  }
  if end == 0 {
    return false;
  }
  buf[..end].iter().all(|&b| is_base64_byte(b))
}

/// Strips a single-line HTTP GET wrapper  and undoes base64-url substitution.
fn strip_http_wrapper(buf: &[u8]) -> Option<Vec<u8>> {
  let prefix = constants::HTTP_GET_PREFIX.as_bytes();
  if !buf.starts_with(prefix) {
    return None;
  }
  if !memchr::memmem::find(buf, constants::HTTP_USER_AGENT_MARKER.as_bytes()).is_some() {
    return None;
  }
  let after_prefix = &buf[prefix.len()..];
  let end = memchr::memchr3(b' ', b'\r', b'\n', after_prefix).unwrap_or(after_prefix.len());
  let mut data = after_prefix[..end].to_vec();
  for byte in data.iter_mut() {
    match *byte {
      b'-' => *byte = b'+',
      b'_' => *byte = b'/',
      _ => (),
    }
  }
  Some(data)
}

fn decode_client_id(data: &[u8]) -> Result<u32, Error> {
  if data.len() < constants::B64_SDP_ID_STR_LEN {
    return Err(Error::NotSpaData);
  }
  let engine = base64::engine::general_purpose::STANDARD;
  use base64::Engine as _;
  let decoded = engine
    .decode(&data[..constants::B64_SDP_ID_STR_LEN])
    .map_err(|_| Error::NotSpaData)?;
  if decoded.len() < 4 {
    return Err(Error::NotSpaData);
  }
  let id = u32::from_le_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]);
  if id == 0 {
    return Err(Error::NotSpaData);
  }
  Ok(id)
}

pub fn classify(raw: &[u8], recv: RecvMeta, config: &config::Config) -> Result<Packet, Error> {
  if raw.len() < constants::MIN_SPA_DATA_SIZE || raw.len() > constants::MAX_SPA_PACKET_LEN {
    return Err(Error::BadData);
  }

  if starts_with_constant_time(raw, constants::SALT_PREFIX_B64.as_bytes()) {
    return Err(Error::BadData);
  }
  if raw.len() > constants::ASYM_HEADER_LEN_THRESHOLD
    && starts_with_constant_time(raw, constants::ASYM_HEADER_PREFIX_B64.as_bytes())
  {
    return Err(Error::BadData);
  }

  let data = if config.enable_spa_over_http {
    match strip_http_wrapper(raw) {
      Some(unwrapped) => {
        if unwrapped.len() < constants::MIN_SPA_DATA_SIZE {
          return Err(Error::BadData);
        }
        unwrapped
      }
      None => raw.to_vec(),
    }
  } else {
    raw.to_vec()
  };

  if !validate_base64(&data) {
    return Err(Error::NotSpaData);
  }

  let (client_id, client_id_str) = if config.disable_sdp_mode {
    (0, String::new())
  } else {
    let id = decode_client_id(&data)?;
    (id, id.to_string())
  };

  Ok(Packet {
    data,
    recv,
    client_id,
    client_id_str,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use base64::Engine as _;

  fn recv() -> RecvMeta {
    RecvMeta {
      src_ip: "192.168.1.7".parse().unwrap(),
      dst_ip: "192.168.1.1".parse().unwrap(),
      src_port: 44123,
      dst_port: 62201,
    }
  }

  fn config(disable_sdp: bool, http: bool) -> config::Config {
    config::Config {
      listen_address: net::Ipv4Addr::UNSPECIFIED,
      listen_port: 62201,
      access_file: "access.conf".into(),
      digest_file: "digest.cache".into(),
      enable_spa_over_http: http,
      disable_sdp_mode: disable_sdp,
      enable_spa_packet_aging: true,
      enable_digest_persistence: true,
      allow_legacy_access_requests: false,
      enable_nat: false,
      enable_local_nat: false,
      enable_forwarding: false,
      max_spa_packet_age: 120,
      udpserv_select_timeout: std::time::Duration::from_secs(1),
      rules_check_threshold: 30,
      sudo_exe: "/usr/bin/sudo".into(),
      test_mode: false,
    }
  }

  #[test]
  fn rejects_too_short() {
    let result = classify(b"short", recv(), &config(true, false));
    assert_eq!(result.unwrap_err(), Error::BadData);
  }

  #[test]
  fn rejects_salt_prefix_poisoning() {
    let payload = format!("{}{}", constants::SALT_PREFIX_B64, "A".repeat(40));
    let result = classify(payload.as_bytes(), recv(), &config(true, false));
    assert_eq!(result.unwrap_err(), Error::BadData);
  }

  #[test]
  fn rejects_asym_prefix_poisoning() {
    let payload = format!("{}{}", constants::ASYM_HEADER_PREFIX_B64, "A".repeat(60));
    let result = classify(payload.as_bytes(), recv(), &config(true, false));
    assert_eq!(result.unwrap_err(), Error::BadData);
  }

  #[test]
  fn rejects_non_base64() {
    let payload = "!!!not base64 at all and long enough???";
    let result = classify(payload.as_bytes(), recv(), &config(true, false));
    assert_eq!(result.unwrap_err(), Error::NotSpaData);
  }

  #[test]
  fn accepts_plain_base64_without_identifier_mode() {
    let payload = base64::engine::general_purpose::STANDARD.encode(b"this is a plaintext message");
    let packet = classify(payload.as_bytes(), recv(), &config(true, false)).unwrap();
    assert_eq!(packet.client_id, 0);
  }

  #[test]
  fn decodes_identifier_when_sdp_mode_enabled() {
    let mut plaintext = 42u32.to_le_bytes().to_vec();
    plaintext.extend_from_slice(b"the rest of the ciphertext padding data");
    let payload = base64::engine::general_purpose::STANDARD.encode(&plaintext);
    let packet = classify(payload.as_bytes(), recv(), &config(false, false)).unwrap();
    assert_eq!(packet.client_id, 42);
    assert_eq!(packet.client_id_str, "42");
  }

  #[test]
  fn rejects_zero_identifier() {
    let mut plaintext = 0u32.to_le_bytes().to_vec();
    plaintext.extend_from_slice(b"the rest of the ciphertext padding data");
    let payload = base64::engine::general_purpose::STANDARD.encode(&plaintext);
    let result = classify(payload.as_bytes(), recv(), &config(false, false));
    assert_eq!(result.unwrap_err(), Error::NotSpaData);
  }

  #[test]
  fn unwraps_http_get_with_fwknop_user_agent() {
    let inner = base64::engine::general_purpose::STANDARD.encode(b"this is a plaintext message");
    let wrapped = format!("GET /{inner} HTTP/1.1\r\nUser-Agent: Fwknop/2.0\r\n\r\n");
    let packet = classify(wrapped.as_bytes(), recv(), &config(true, true)).unwrap();
    assert_eq!(packet.data, inner.as_bytes());
  }

  #[test]
  fn http_wrap_rejected_when_disabled() {
    let inner = base64::engine::general_purpose::STANDARD.encode(b"this is a plaintext message");
    let wrapped = format!("GET /{inner} HTTP/1.1\r\nUser-Agent: Fwknop/2.0\r\n\r\n");
    let result = classify(wrapped.as_bytes(), recv(), &config(true, false));
    assert_eq!(result.unwrap_err(), Error::NotSpaData);
  }
}
