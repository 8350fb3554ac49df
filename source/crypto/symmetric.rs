// Symmetric leg of C4. Wire format: base64("Salted__" + 8-byte salt +
// Rijndael-CBC(plaintext)) + "||" + hex(HMAC(key, salt || ciphertext)) -- the HMAC excludes the
// "Salted__" magic, which is wire framing rather than authenticated data. HMAC is verified
// before any plaintext is exposed to the caller.

use crate::{error::Error, policy};
use aes::cipher::{BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _};
use zeroize::Zeroize as _;

const SALT_MAGIC: &[u8] = b"Salted__";
const SALT_LEN: usize = 8;
const HMAC_SEPARATOR: &[u8] = b"||";
const AES_KEY_LEN: usize = 16;
const AES_BLOCK_LEN: usize = 16;

/// OpenSSL's EVP_BytesToKey with MD5, one iteration -- the scheme fwknop's wire format relies on
/// to turn the stanza's passphrase-shaped key into an AES key + IV from the random salt.
fn bytes_to_key(passphrase: &[u8], salt: &[u8; SALT_LEN]) -> ([u8; AES_KEY_LEN], [u8; AES_BLOCK_LEN]) {
  let mut key = [0u8; AES_KEY_LEN];
  let mut iv = [0u8; AES_BLOCK_LEN];
  let mut previous: Vec<u8> = Vec::new();
  let mut generated: Vec<u8> = Vec::new();
  while generated.len() < AES_KEY_LEN + AES_BLOCK_LEN {
    let mut hasher = md5::Md5::new();
    use md5::Digest as _;
    hasher.update(&previous);
    hasher.update(passphrase);
    hasher.update(salt);
    let digest = hasher.finalize();
    generated.extend_from_slice(&digest);
    previous = digest.to_vec();
  }
  key.copy_from_slice(&generated[..AES_KEY_LEN]);
  iv.copy_from_slice(&generated[AES_KEY_LEN..AES_KEY_LEN + AES_BLOCK_LEN]);
  generated.zeroize();
  (key, iv)
}

fn verify_hmac(
  stanza: &policy::SymmetricKey,
  salt_and_ciphertext: &[u8],
  tag: &[u8],
) -> Result<(), Error> {
  // hmac::Mac::verify_slice does the constant-time comparison for us -- no subtle needed here.
  macro_rules! verify {
    ($digest:ty) => {{
      let mut mac = <hmac::Hmac<$digest> as hmac::Mac>::new_from_slice(&stanza.hmac_key)
        .map_err(|_| Error::CtxError)?;
      hmac::Mac::update(&mut mac, salt_and_ciphertext);
      hmac::Mac::verify_slice(mac, tag).map_err(|_| Error::DecryptFailed)
    }};
  }
  match stanza.hmac_algorithm {
    policy::HmacAlgorithm::Md5 => verify!(md5::Md5),
    policy::HmacAlgorithm::Sha1 => verify!(sha1::Sha1),
    policy::HmacAlgorithm::Sha256 => verify!(sha2::Sha256),
    policy::HmacAlgorithm::Sha384 => verify!(sha2::Sha384),
    policy::HmacAlgorithm::Sha512 => verify!(sha2::Sha512),
  }
}

/// Zeroizing handle over the decrypted plaintext. Scoped so the pipeline coordinator can't
/// forget to wipe it.
#[derive(zeroize::ZeroizeOnDrop)]
pub struct Plaintext(pub Vec<u8>);

pub fn decrypt(stanza: &policy::SymmetricKey, wire: &[u8]) -> Result<Plaintext, Error> {
  let wire_str = std::str::from_utf8(wire).map_err(|_| Error::DecryptFailed)?;
  let (body, tag_hex) = wire_str
    .rsplit_once(std::str::from_utf8(HMAC_SEPARATOR).unwrap())
    .ok_or(Error::DecryptFailed)?;
  if !body.starts_with(std::str::from_utf8(SALT_MAGIC).unwrap()) {
    return Err(Error::DecryptFailed);
  }
  let tag = hex_decode(tag_hex).ok_or(Error::DecryptFailed)?;
  let body_bytes = body.as_bytes();
  if body_bytes.len() < SALT_MAGIC.len() + SALT_LEN + AES_BLOCK_LEN {
    return Err(Error::DecryptFailed);
  }
  // The MAC covers salt||ciphertext only -- the "Salted__" magic is wire framing, not data the
  // sender authenticated -- so it must match what a real fwknop-compatible client computes.
  verify_hmac(stanza, &body_bytes[SALT_MAGIC.len()..], &tag)?;

  let mut salt = [0u8; SALT_LEN];
  salt.copy_from_slice(&body_bytes[SALT_MAGIC.len()..SALT_MAGIC.len() + SALT_LEN]);
  let ciphertext = &body_bytes[SALT_MAGIC.len() + SALT_LEN..];
  if ciphertext.len() % AES_BLOCK_LEN != 0 || ciphertext.is_empty() {
    return Err(Error::DecryptFailed);
  }

  let (mut key, mut iv) = bytes_to_key(&stanza.key, &salt);
  let decryptor = cbc::Decryptor::<aes::Aes128>::new(&key.into(), &iv.into());
  let mut buffer = ciphertext.to_vec();
  let plaintext = decryptor
    .decrypt_padded_mut::<aes::cipher::block_padding::Pkcs7>(&mut buffer)
    .map_err(|_| Error::DecryptFailed)?;
  let plaintext = plaintext.to_vec();
  key.zeroize();
  iv.zeroize();
  buffer.zeroize();
  Ok(Plaintext(plaintext))
}

/// Encrypts in the same wire format. Exposed (not `#[cfg(test)]`-gated) so both unit tests and
/// the crate's own integration tests can build fixtures without a real client.
pub fn encrypt(stanza: &policy::SymmetricKey, salt: [u8; SALT_LEN], plaintext: &[u8]) -> Vec<u8> {
  let (mut key, mut iv) = bytes_to_key(&stanza.key, &salt);
  let encryptor = cbc::Encryptor::<aes::Aes128>::new(&key.into(), &iv.into());
  let mut buffer = plaintext.to_vec();
  buffer.resize(plaintext.len() + AES_BLOCK_LEN, 0);
  let len = plaintext.len();
  let ciphertext = encryptor
    .encrypt_padded_mut::<aes::cipher::block_padding::Pkcs7>(&mut buffer, len)
    .unwrap();
  let mut body = Vec::new();
  body.extend_from_slice(SALT_MAGIC);
  body.extend_from_slice(&salt);
  body.extend_from_slice(ciphertext);
  key.zeroize();
  iv.zeroize();

  macro_rules! tag {
    ($digest:ty) => {{
      let mut mac = <hmac::Hmac<$digest> as hmac::Mac>::new_from_slice(&stanza.hmac_key).unwrap();
      hmac::Mac::update(&mut mac, &body[SALT_MAGIC.len()..]);
      hmac::Mac::finalize(mac).into_bytes().to_vec()
    }};
  }
  let tag = match stanza.hmac_algorithm {
    policy::HmacAlgorithm::Md5 => tag!(md5::Md5),
    policy::HmacAlgorithm::Sha1 => tag!(sha1::Sha1),
    policy::HmacAlgorithm::Sha256 => tag!(sha2::Sha256),
    policy::HmacAlgorithm::Sha384 => tag!(sha2::Sha384),
    policy::HmacAlgorithm::Sha512 => tag!(sha2::Sha512),
  };
  let mut wire = body;
  wire.extend_from_slice(HMAC_SEPARATOR);
  wire.extend_from_slice(hex_encode(&tag).as_bytes());
  wire
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
  if hex.len() % 2 != 0 {
    return None;
  }
  hex
    .as_bytes()
    .chunks(2)
    .map(|chunk| u8::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok())
    .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
  bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
