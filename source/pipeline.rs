// C8 -- Pipeline Coordinator. Wires C1 through C7 together for one received
// datagram: classify, fast-reject an already-seen ciphertext, then walk the candidate stanzas,
// trying a crypto attempt against each, committing the digest durably only once a stanza's
// crypto attempt actually succeeds, and evaluating the result, stopping or continuing the search
// per the evaluator's own verdict.

use crate::{action, config, crypto, digest, error::Error, evaluator, firewall, message, packet, policy};

pub enum Disposition {
  Dispatched(action::Dispatched),
  /// Carries the stanza number the denial happened against, when the packet made it far enough
  /// to be tried against one.
  Denied(Error, Option<usize>),
}

impl Disposition {
  pub fn reason(&self) -> Option<Error> {
    match self {
      Disposition::Denied(reason, _) => Some(*reason),
      Disposition::Dispatched(_) => None,
    }
  }

  pub fn stanza_number(&self) -> Option<usize> {
    match self {
      Disposition::Denied(_, number) => *number,
      Disposition::Dispatched(_) => None,
    }
  }
}

#[allow(clippy::too_many_arguments)]
pub fn handle(
  raw: &[u8],
  recv: packet::RecvMeta,
  config: &config::Config,
  policy: &policy::Policy,
  digests: &digest::Store,
  backend: &dyn firewall::Backend,
  now: i64,
) -> Disposition {
  let packet = match packet::classify(raw, recv, config) {
    Ok(packet) => packet,
    Err(error) => return Disposition::Denied(error, None),
  };

  // The digest covers the still-encrypted ciphertext. This is a read-only fast-reject: a packet
  // that never decrypts against any stanza must never get durably recorded, or a later resend of
  // the same noise would be misreported as a replay instead of the access denial it actually is.
  let digest = digest::ReplayDigest::of(&packet.data);
  if digests.contains(&digest) {
    return Disposition::Denied(Error::Replay, None);
  }

  let stanzas = policy.read();
  let selector = policy::resolve(
    policy,
    &stanzas,
    config.disable_sdp_mode,
    &packet.client_id_str,
    packet.recv.src_ip,
    packet.recv.dst_ip,
  );

  let mut last_denial = (Error::AccessDenied, None);
  let mut last_test_mode_noop: Option<action::Dispatched> = None;
  for stanza in selector {
    if stanza.is_expired(now) {
      continue;
    }

    let outcome = match crypto::attempt(stanza, &packet.data) {
      Ok(outcome) => outcome,
      Err(Error::DecryptFailed) => continue,
      Err(other) => return Disposition::Denied(other, Some(stanza.number)),
    };

    let parsed = match message::parse(&outcome.plaintext.0, packet.client_id) {
      Ok(message) => message,
      // A message that decrypted cleanly but doesn't parse is an unambiguous protocol error, not
      // a "wrong stanza" signal: searching further candidates won't fix malformed content.
      Err(error) => return Disposition::Denied(error, Some(stanza.number)),
    };

    // The ciphertext has now proven itself against this stanza's key (and decoded to a
    // well-formed message), so it must become durable before the evaluator's predicates run --
    // a crash between this point and a firewall grant must never leave a replay window open.
    match digests.insert(digest) {
      Ok(true) => (),
      // A replay is a policy mismatch against this stanza attempt, not an unambiguous protocol
      // error: another candidate stanza hasn't been tried yet and must still get its turn.
      Ok(false) => {
        last_denial = (Error::Replay, Some(stanza.number));
        continue;
      }
      Err(error) => {
        log::error!(target: "spad::pipeline", "digest store insert failed: {error:#}");
        return Disposition::Denied(Error::DigestError, Some(stanza.number));
      }
    }

    match evaluator::evaluate(stanza, parsed, config, packet.recv.src_ip, now, outcome.signer.as_ref()) {
      evaluator::Verdict::Grant(grant) => {
        match action::dispatch(grant, config, backend) {
          // Test mode never installs a real side effect, so it can't settle the search either --
          // keep walking the remaining candidate stanzas for coverage, remembering that at least
          // one would have matched in case nothing else does.
          Ok(action::Dispatched::TestModeNoop) => {
            last_test_mode_noop.get_or_insert(action::Dispatched::TestModeNoop);
            continue;
          }
          Ok(dispatched) => return Disposition::Dispatched(dispatched),
          Err(error) => return Disposition::Denied(error, Some(stanza.number)),
        }
      }
      evaluator::Verdict::Reject(rejection) => {
        last_denial = (rejection.reason, Some(stanza.number));
        match rejection.control {
          evaluator::SearchControl::Stop => return Disposition::Denied(rejection.reason, Some(stanza.number)),
          evaluator::SearchControl::Keep => continue,
        }
      }
    }
  }

  match last_test_mode_noop {
    Some(dispatched) => Disposition::Dispatched(dispatched),
    None => Disposition::Denied(last_denial.0, last_denial.1),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use base64::Engine as _;

  fn recv() -> packet::RecvMeta {
    packet::RecvMeta {
      src_ip: "192.168.1.7".parse().unwrap(),
      dst_ip: "192.168.1.1".parse().unwrap(),
      src_port: 44123,
      dst_port: 62201,
    }
  }

  #[test]
  fn grants_access_for_a_valid_symmetric_packet() {
    // Symmetric-key stanza; OPEN_PORTS is manually re-parsed here rather than pulled out of
    // `stanza_conf` to keep the policy parser's own unknown-directive check strict elsewhere.
    let stanzas = policy::parse(
      "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/22\n",
    )
    .unwrap();
    let policy = policy::Policy::from_stanzas(stanzas).unwrap();
    let guard = policy.read();
    let key = &guard[0].symmetric.as_ref().unwrap();
    let plaintext = b"1234:alice:1700000000:2.0.3:1:192.168.1.7,tcp/22";
    let wire = crypto::symmetric::encrypt(key, [5u8; 8], plaintext);
    drop(guard);

    let mut config = config::Config::test_defaults();
    config.disable_sdp_mode = true;
    let raw = base64::engine::general_purpose::STANDARD.encode(&wire);
    let digests = digest::Store::in_memory();
    let backend = firewall::Null::default();

    let disposition = handle(raw.as_bytes(), recv(), &config, &policy, &digests, &backend, 1_700_000_000);
    assert!(matches!(disposition, Disposition::Dispatched(action::Dispatched::FirewallGrant(_))));
  }

  #[test]
  fn replays_the_same_ciphertext_are_denied() {
    let stanzas = policy::parse(
      "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/22\n",
    )
    .unwrap();
    let policy = policy::Policy::from_stanzas(stanzas).unwrap();
    let guard = policy.read();
    let key = &guard[0].symmetric.as_ref().unwrap();
    let plaintext = b"1234:alice:1700000000:2.0.3:1:192.168.1.7,tcp/22";
    let wire = crypto::symmetric::encrypt(key, [5u8; 8], plaintext);
    drop(guard);

    let mut config = config::Config::test_defaults();
    config.disable_sdp_mode = true;
    let raw = base64::engine::general_purpose::STANDARD.encode(&wire);
    let digests = digest::Store::in_memory();
    let backend = firewall::Null::default();

    let first = handle(raw.as_bytes(), recv(), &config, &policy, &digests, &backend, 1_700_000_000);
    assert!(matches!(first, Disposition::Dispatched(_)));
    let second = handle(raw.as_bytes(), recv(), &config, &policy, &digests, &backend, 1_700_000_000);
    assert_eq!(second.reason(), Some(Error::Replay));
  }

  #[test]
  fn replay_suppression_disabled_allows_the_same_side_effect_twice() {
    let stanzas = policy::parse(
      "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/22\n",
    )
    .unwrap();
    let policy = policy::Policy::from_stanzas(stanzas).unwrap();
    let guard = policy.read();
    let key = &guard[0].symmetric.as_ref().unwrap();
    let plaintext = b"1234:alice:1700000000:2.0.3:1:192.168.1.7,tcp/22";
    let wire = crypto::symmetric::encrypt(key, [5u8; 8], plaintext);
    drop(guard);

    let mut config = config::Config::test_defaults();
    config.disable_sdp_mode = true;
    let raw = base64::engine::general_purpose::STANDARD.encode(&wire);
    let digests = digest::Store::disabled();
    let backend = firewall::Null::default();

    let first = handle(raw.as_bytes(), recv(), &config, &policy, &digests, &backend, 1_700_000_000);
    assert!(matches!(first, Disposition::Dispatched(_)));
    let second = handle(raw.as_bytes(), recv(), &config, &policy, &digests, &backend, 1_700_000_000);
    assert!(matches!(second, Disposition::Dispatched(_)));
  }

  #[test]
  fn ciphertext_that_decrypts_against_no_stanza_is_never_committed_to_the_replay_store() {
    let stanzas = policy::parse(
      "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/22\n",
    )
    .unwrap();
    let policy = policy::Policy::from_stanzas(stanzas).unwrap();
    let config = config::Config::test_defaults();
    let digests = digest::Store::in_memory();
    let backend = firewall::Null::default();

    let noise = base64::engine::general_purpose::STANDARD.encode(b"not a real ciphertext, but long enough to pass length checks");
    let first = handle(noise.as_bytes(), recv(), &config, &policy, &digests, &backend, 1_700_000_000);
    assert_eq!(first.reason(), Some(Error::AccessDenied));
    let second = handle(noise.as_bytes(), recv(), &config, &policy, &digests, &backend, 1_700_000_000);
    // Still a plain access denial, not a replay: nothing ever decrypted, so nothing was inserted.
    assert_eq!(second.reason(), Some(Error::AccessDenied));
  }

  #[test]
  fn test_mode_keeps_searching_past_a_matching_stanza() {
    let stanzas = policy::parse(
      "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/22\n",
    )
    .unwrap();
    let policy = policy::Policy::from_stanzas(stanzas).unwrap();
    let guard = policy.read();
    let key = &guard[0].symmetric.as_ref().unwrap();
    let plaintext = b"1234:alice:1700000000:2.0.3:1:192.168.1.7,tcp/22";
    let wire = crypto::symmetric::encrypt(key, [5u8; 8], plaintext);
    drop(guard);

    let mut config = config::Config::test_defaults();
    config.disable_sdp_mode = true;
    config.test_mode = true;
    let raw = base64::engine::general_purpose::STANDARD.encode(&wire);
    let digests = digest::Store::in_memory();
    let backend = firewall::Null::default();

    let disposition = handle(raw.as_bytes(), recv(), &config, &policy, &digests, &backend, 1_700_000_000);
    assert!(matches!(disposition, Disposition::Dispatched(action::Dispatched::TestModeNoop)));
    // No stanza after the matching one, so the search exhausts the selector and falls back to
    // the remembered test-mode match instead of reporting a denial.
    assert!(backend.grants.lock().unwrap().is_empty());
  }
}
