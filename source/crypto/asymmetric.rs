// Asymmetric leg of C4: ASCII-armored, GPG-compatible messages with a detached
// signer identity. Attempted only when the symmetric leg didn't already succeed and the stanza
// enables asymmetric decryption.

use crate::{error::Error, policy};
use sequoia_openpgp::{
  self as openpgp,
  crypto::SessionKey,
  packet::{PKESK, SKESK},
  parse::{
    stream::{
      DecryptionHelper, DecryptorBuilder, MessageStructure, VerificationHelper, VerificationResult,
    },
    Parse as _,
  },
  policy::StandardPolicy,
  types::SymmetricAlgorithm,
  Cert, KeyHandle,
};
use std::io::Read as _;

pub struct Signer {
  pub key_id: Option<String>,
  pub fingerprint: Option<String>,
}

struct Helper<'a> {
  settings: &'a policy::AsymmetricSettings,
  keyring: &'a [Cert],
  signer: Signer,
}

impl<'a> VerificationHelper for Helper<'a> {
  fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
    Ok(self.keyring.to_vec())
  }

  fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
    for layer in structure.into_iter() {
      if let sequoia_openpgp::parse::stream::MessageLayer::SignatureGroup { results } = layer {
        for result in results {
          if let VerificationResult::GoodChecksum { ka, .. } = result {
            self.signer.key_id = Some(ka.key().keyid().to_hex());
            self.signer.fingerprint = Some(ka.key().fingerprint().to_hex());
          }
        }
      }
    }
    if self.signer.key_id.is_none() && self.settings.require_signature && !self.settings.ignore_verify_error {
      anyhow::bail!("no good signature found");
    }
    Ok(())
  }
}

impl<'a> DecryptionHelper for Helper<'a> {
  fn decrypt(
    &mut self,
    _pkesks: &[PKESK],
    skesks: &[SKESK],
    sym_algo: Option<SymmetricAlgorithm>,
    decrypt: &mut dyn FnMut(Option<SymmetricAlgorithm>, &SessionKey) -> bool,
  ) -> openpgp::Result<Option<openpgp::Fingerprint>> {
    let passphrase = self
      .settings
      .decrypt_passphrase
      .as_deref()
      .unwrap_or("");
    if passphrase.is_empty() && !self.settings.allow_no_passphrase {
      anyhow::bail!("no decrypt passphrase configured");
    }
    for skesk in skesks {
      if let Ok((algo, session_key)) = skesk.decrypt(&passphrase.into()) {
        if decrypt(sym_algo.or(Some(algo)), &session_key) {
          return Ok(None);
        }
      }
    }
    anyhow::bail!("no SKESK packet decrypted with the configured passphrase")
  }
}

pub fn decrypt(settings: &policy::AsymmetricSettings, wire: &[u8]) -> Result<(Vec<u8>, Signer), Error> {
  let policy = StandardPolicy::new();
  let keyring = load_keyring(settings).map_err(|_| Error::CtxError)?;
  let helper = Helper {
    settings,
    keyring: &keyring,
    signer: Signer {
      key_id: None,
      fingerprint: None,
    },
  };
  let mut decryptor = DecryptorBuilder::from_bytes(wire)
    .map_err(|_| Error::CtxError)?
    .with_policy(&policy, None, helper)
    .map_err(|_| Error::DecryptFailed)?;
  let mut plaintext = Vec::new();
  decryptor
    .read_to_end(&mut plaintext)
    .map_err(|_| Error::DecryptFailed)?;
  let helper = decryptor.into_helper();
  Ok((plaintext, helper.signer))
}

fn load_keyring(settings: &policy::AsymmetricSettings) -> anyhow::Result<Vec<Cert>> {
  let pubring = settings.gpg_home.join("pubring.gpg");
  if !pubring.exists() {
    return Ok(Vec::new());
  }
  Ok(openpgp::cert::CertParser::from_file(pubring)?.filter_map(Result::ok).collect())
}

/// Checks the decrypted signer against the stanza's allow-lists: a non-empty fingerprint list and
/// a non-empty ID list are each required to contain a match when set, so a signer must satisfy
/// both lists at once if the stanza configures both.
pub fn check_signer(settings: &policy::AsymmetricSettings, signer: &Signer) -> bool {
  if !settings.require_signature {
    return true;
  }
  let fpr_ok = settings.allowed_signer_fingerprints.is_empty()
    || signer
      .fingerprint
      .as_deref()
      .map(|fpr| settings.allowed_signer_fingerprints.iter().any(|allowed| allowed.eq_ignore_ascii_case(fpr)))
      .unwrap_or(false);
  let id_ok = settings.allowed_signer_ids.is_empty()
    || signer
      .key_id
      .as_deref()
      .map(|id| settings.allowed_signer_ids.iter().any(|allowed| allowed.eq_ignore_ascii_case(id)))
      .unwrap_or(false);
  fpr_ok && id_ok
}
