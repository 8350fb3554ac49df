// Packet-age enforcement, independent of replay suppression.

mod common;

use common::Runner;
use pretty_assertions::assert_eq;
use spad::error::Error;
use test_log::test;

#[test]
fn an_aged_out_packet_is_denied() {
  // Packet aging on by default, 120s window.
  let fixture = Runner::new().with_replay_suppression(false).build();
  let wire = fixture.encode_symmetric([11u8; 8], b"1234:alice:1700000000:2.0.3:1:192.168.1.7,tcp/22");

  let far_future = common::NOW + 10_000;
  let disposition = fixture.send(wire.as_bytes(), far_future);
  assert_eq!(disposition.reason(), Some(Error::AccessDenied));
}
