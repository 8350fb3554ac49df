// C4 -- Crypto Engine. Determines encryption type by prefix inspection, tries
// symmetric first, then asymmetric (only if the stanza enables it and symmetric didn't already
// succeed), and hands back a zeroizing `Plaintext` handle.

pub mod asymmetric;
pub mod symmetric;

use crate::{error::Error, policy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
  RijndaelSymmetric,
  AsymmetricSigned,
}

/// Inspects the base64-decoded ciphertext's own prefix (as opposed to `packet::classify`, which
/// inspects the still-base64-encoded text for prefix poisoning).
pub fn detect(wire: &[u8]) -> Option<EncryptionType> {
  if wire.starts_with(b"Salted__") {
    return Some(EncryptionType::RijndaelSymmetric);
  }
  if wire.first() == Some(&0x85) {
    return Some(EncryptionType::AsymmetricSigned);
  }
  None
}

pub struct Outcome {
  pub plaintext: symmetric::Plaintext,
  pub signer: Option<asymmetric::Signer>,
}

/// Owns the decrypt attempt's sensitive state for exactly one stanza try. The pipeline
/// coordinator drops this (zeroing the plaintext) before moving on to the next candidate stanza.
pub fn attempt(stanza: &policy::Stanza, wire_b64: &[u8]) -> Result<Outcome, Error> {
  use base64::Engine as _;
  let wire = base64::engine::general_purpose::STANDARD
    .decode(wire_b64)
    .map_err(|_| Error::CtxError)?;

  // Symmetric is attempted first whenever the stanza has a key, or whenever the stanza enables
  // command execution regardless of encryption type.
  if let Some(symmetric_key) = &stanza.symmetric {
    if matches!(detect(&wire), Some(EncryptionType::RijndaelSymmetric)) || stanza.enable_cmd_exec {
      match symmetric::decrypt(symmetric_key, &wire) {
        Ok(plaintext) => {
          return Ok(Outcome {
            plaintext,
            signer: None,
          })
        }
        Err(Error::DecryptFailed) => (), // fall through to asymmetric, if any
        Err(other) => return Err(other),
      }
    }
  }

  if let Some(asymmetric_settings) = &stanza.asymmetric {
    if matches!(detect(&wire), Some(EncryptionType::AsymmetricSigned)) {
      let (plaintext, signer) = asymmetric::decrypt(asymmetric_settings, &wire)?;
      return Ok(Outcome {
        plaintext: symmetric::Plaintext(plaintext),
        signer: Some(signer),
      });
    }
  }

  Err(Error::DecryptFailed)
}
