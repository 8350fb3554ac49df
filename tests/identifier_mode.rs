// SDP (identifier-mode) client-ID lookup, as opposed to the source-IP scan the other scenario
// groups exercise.

mod common;

use common::Runner;
use pretty_assertions::assert_eq;
use spad::error::Error;
use test_log::test;

#[test]
fn identifier_mode_with_no_matching_stanza_is_denied() {
  // SDP mode enabled, no CLIENT_ID in the fixture stanza, so no stanza can ever match the
  // embedded identifier.
  let fixture = Runner::new().with_sdp_mode(true).with_replay_suppression(false).build();

  let mut plaintext = 99u32.to_le_bytes().to_vec();
  plaintext.extend_from_slice(b"the rest of the ciphertext padding data");
  let wire = {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(&plaintext)
  };

  let disposition = fixture.send(wire.as_bytes(), common::NOW);
  assert_eq!(disposition.reason(), Some(Error::AccessDenied));
  assert_eq!(fixture.grant_count(), 0);
}
