// Wire-format constants. Values chosen to match the documented fwknop wire format: the base64
// encodings below are computed over fixed magic byte strings, not guessed.

/// Smallest base64 blob that could plausibly decode to a full SPA plaintext.
pub const MIN_SPA_DATA_SIZE: usize = 20;
/// Largest UDP payload we're willing to look at.
pub const MAX_SPA_PACKET_LEN: usize = 1500;
/// Bound on the copied `ipv4,request` remainder.
pub const MAX_DECRYPTED_SPA_LEN: usize = 1500;

/// `"1.1.1.1"`.
pub const MIN_IPV4_STR_LEN: usize = 7;
/// `"255.255.255.255"`.
pub const MAX_IPV4_STR_LEN: usize = 15;

/// base64 of OpenSSL's `"Salted__"` magic, used to detect prefix-poisoned replays.
pub const SALT_PREFIX_B64: &str = "U2FsdGVkX1";
/// base64 of the new-format OpenPGP Public-Key Encrypted Session Key packet tag byte (`0x85`),
/// used to detect prefix-poisoned asymmetric replays.
pub const ASYM_HEADER_PREFIX_B64: &str = "hQ";
/// Below this length an asymmetric-prefix match is noise, not a poisoning attempt.
pub const ASYM_HEADER_LEN_THRESHOLD: usize = 32;

/// Exactly this many base64 characters encode the 4-byte client identifier.
pub const B64_SDP_ID_STR_LEN: usize = 8;

pub const HTTP_GET_PREFIX: &str = "GET /";
pub const HTTP_USER_AGENT_MARKER: &str = "User-Agent: Fwknop";

/// Default access-grant timeout when neither the client nor the stanza supplies one.
pub const DEFAULT_FW_ACCESS_TIMEOUT: u32 = 30;

/// Bound on command execution run directly (as root).
pub const CMD_DIRECT_TIMEOUT_SECS: u64 = 5;
/// Even the setuid path gets a hard ceiling rather than running unbounded.
pub const CMD_SETUID_TIMEOUT_SECS: u64 = 30;

/// A full firewall-rule sweep reconciles against the kernel's actual rule set instead of just the
/// in-memory ledger, so it runs less often than the cheap per-threshold check.
pub const FULL_SWEEP_EVERY_N_CHECKS: u32 = 10;
