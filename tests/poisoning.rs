// Prefix-poisoned packets never make it past C1, so they must never reach the replay store.

mod common;

use common::Runner;
use pretty_assertions::assert_eq;
use spad::{digest, error::Error};
use test_log::test;

#[test]
fn a_prefix_poisoned_packet_never_reaches_the_replay_store() {
  let fixture = Runner::new().with_replay_suppression(false).build();

  let poisoned = format!("{}{}", spad::constants::SALT_PREFIX_B64, "A".repeat(40));
  let disposition = fixture.send(poisoned.as_bytes(), common::NOW);
  assert_eq!(disposition.reason(), Some(Error::BadData));
  assert!(!fixture.digests.contains(&digest::ReplayDigest::of(poisoned.as_bytes())));
}
