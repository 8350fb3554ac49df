// `--test-mode`: every matching stanza is logged, not acted on, and the search keeps going past
// the first match instead of stopping like a real grant would.

mod common;

use common::Runner;
use pretty_assertions::assert_eq;
use spad::{action, pipeline};
use test_log::test;

const TWO_STANZAS: &str = "SOURCE 192.168.1.0/24\n\
  KEY_BASE64 dGVzdF9rZXlfMTIzNDU=\n\
  HMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\n\
  OPEN_PORTS tcp/22\n\
  \n\
  SOURCE 192.168.1.0/24\n\
  KEY_BASE64 b3RoZXJfa2V5XzEyMzQ1\n\
  HMAC_KEY_BASE64 b3RoZXJfaG1hY18xMjM0\n\
  OPEN_PORTS tcp/22\n";

#[test]
fn test_mode_keeps_searching_past_a_matching_stanza_and_installs_nothing() {
  let fixture = Runner::new().with_access_conf(TWO_STANZAS).with_test_mode(true).build();
  let wire = fixture.encode_symmetric([11u8; 8], b"1234:alice:1700000000:2.0.3:1:192.168.1.7,tcp/22");

  let disposition = fixture.send(wire.as_bytes(), common::NOW);
  assert!(matches!(disposition, pipeline::Disposition::Dispatched(action::Dispatched::TestModeNoop)));
  assert_eq!(fixture.grant_count(), 0, "test mode must never install a real firewall rule");
}
