// Error kinds are kept stable across the pipeline: every drop is attributable to
// exactly one of these, and none of them carry plaintext, key material, or digest bytes.

use std::{error, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  /// Structural rejection: bad length, poisoned prefix, invalid HTTP wrap.
  BadData,
  /// Plausibly not an SPA datagram: base64 failure, identifier decode failure, zero identifier.
  NotSpaData,
  /// Crypto context construction failed before any decrypt attempt was made.
  CtxError,
  /// Digest compute or store operation failed.
  DigestError,
  /// HMAC mismatch, bad padding, or decrypt failure. Never subdivided further.
  DecryptFailed,
  /// The digest was already present in the replay store.
  Replay,
  /// An access-evaluator predicate failed.
  AccessDenied,
  /// The dispatched command exited non-zero or failed to run.
  CommandError,
}

impl Error {
  pub fn as_str(&self) -> &'static str {
    match self {
      Error::BadData => "BAD_DATA",
      Error::NotSpaData => "NOT_SPA_DATA",
      Error::CtxError => "FKO_CTX_ERROR",
      Error::DigestError => "DIGEST_ERROR",
      Error::DecryptFailed => "DECRYPT_FAILED",
      Error::Replay => "REPLAY",
      Error::AccessDenied => "ACCESS_DENIED",
      Error::CommandError => "COMMAND_ERROR",
    }
  }
}

impl fmt::Display for Error {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(formatter, "{}", self.as_str())
  }
}

impl error::Error for Error {}
