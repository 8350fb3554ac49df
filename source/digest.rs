// C2 -- Digest & Replay Store. The digest is computed over the post-classification base64
// ciphertext, before any decryption is attempted, so undecryptable replays are still suppressed.
// The store persists durably: `insert` must hit disk before the caller is allowed to treat the
// packet as accepted.

use anyhow::Context as _;
use sha2::Digest as _;
use std::{
  collections, fs,
  io::Write as _,
  path, str, sync,
};

pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplayDigest(pub [u8; DIGEST_LEN]);

impl ReplayDigest {
  pub fn of(ciphertext: &[u8]) -> Self {
    let mut hasher = sha2::Sha256::new();
    hasher.update(ciphertext);
    ReplayDigest(hasher.finalize().into())
  }

  pub fn to_hex(self) -> String {
    self.0.iter().map(|byte| format!("{byte:02x}")).collect()
  }

  fn from_hex(hex: &str) -> Option<Self> {
    if hex.len() != DIGEST_LEN * 2 {
      return None;
    }
    let mut bytes = [0u8; DIGEST_LEN];
    for (index, chunk) in hex.as_bytes().chunks(2).enumerate() {
      let chunk = str::from_utf8(chunk).ok()?;
      bytes[index] = u8::from_str_radix(chunk, 16).ok()?;
    }
    Some(ReplayDigest(bytes))
  }
}

struct Inner {
  seen: collections::HashSet<ReplayDigest>,
  file: Option<fs::File>,
}

/// Persistent, concurrent-safe set of accepted ciphertext digests. May be disabled by
/// configuration, in which case `contains` always reports false and `insert` is a true no-op --
/// it neither dedups nor persists, so the same ciphertext replayed twice produces the same side
/// effect twice.
pub struct Store {
  inner: sync::Mutex<Inner>,
  path: Option<path::PathBuf>,
  /// `false` only for the configuration-disabled store; an in-memory-only store (no `path`, used
  /// by tests and by digest-persistence-disabled-but-replay-suppression-on deployments) is still
  /// active.
  active: bool,
}

impl Store {
  /// Loads any digests already on disk at `path`, or starts empty when `path` is `None` (digest
  /// persistence disabled).
  pub fn open(path: Option<&path::Path>) -> anyhow::Result<Self> {
    let mut seen = collections::HashSet::new();
    let file = match path {
      Some(path) => {
        if path.exists() {
          let contents = fs::read_to_string(path)
            .with_context(|| format!("couldn't read digest store {path:?}"))?;
          for line in contents.lines() {
            if let Some(digest) = ReplayDigest::from_hex(line.trim()) {
              seen.insert(digest);
            } else if !line.trim().is_empty() {
              log::warn!(target: "spad::digest", "ignoring malformed digest-store line");
            }
          }
        }
        Some(
          fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("couldn't open digest store {path:?} for appending"))?,
        )
      }
      None => None,
    };
    Ok(Self {
      inner: sync::Mutex::new(Inner { seen, file }),
      path: path.map(path::Path::to_path_buf),
      active: true,
    })
  }

  /// The "disabled by configuration" store: `contains` always reports false and `insert` always
  /// succeeds without recording anything, so replay suppression is fully off.
  pub fn disabled() -> Self {
    Self {
      inner: sync::Mutex::new(Inner {
        seen: collections::HashSet::new(),
        file: None,
      }),
      path: None,
      active: false,
    }
  }

  /// An active, non-persistent store: dedups in memory but never touches disk. Used by tests
  /// that need replay suppression without a scratch file.
  pub fn in_memory() -> Self {
    Self {
      inner: sync::Mutex::new(Inner {
        seen: collections::HashSet::new(),
        file: None,
      }),
      path: None,
      active: true,
    }
  }

  pub fn contains(&self, digest: &ReplayDigest) -> bool {
    if !self.active {
      return false;
    }
    self.inner.lock().unwrap().seen.contains(digest)
  }

  /// Adds `digest` if absent. The critical section covers both the presence check and the
  /// durable write so that two concurrent copies of the same ciphertext can't both pass.
  pub fn insert(&self, digest: ReplayDigest) -> anyhow::Result<bool> {
    if !self.active {
      return Ok(true);
    }
    let mut inner = self.inner.lock().unwrap();
    if inner.seen.contains(&digest) {
      return Ok(false);
    }
    if let Some(file) = inner.file.as_mut() {
      file
        .write_all(format!("{}\n", digest.to_hex()).as_bytes())
        .with_context(|| "couldn't append digest to store")?;
      file.sync_data().with_context(|| "couldn't fsync digest store")?;
    }
    inner.seen.insert(digest);
    Ok(true)
  }

  pub fn flush(&self) -> anyhow::Result<()> {
    let mut inner = self.inner.lock().unwrap();
    if let Some(file) = inner.file.as_mut() {
      file.flush()?;
      file.sync_all()?;
    }
    Ok(())
  }

  /// Atomically rewrites the on-disk store as a single compacted snapshot: a scratch file next
  /// to the real one (random suffix so concurrent compactions can't collide), fsync'd, then
  /// renamed over the original. Used periodically so the append-only file doesn't grow forever.
  pub fn compact(&self) -> anyhow::Result<()> {
    let Some(path) = self.path.as_ref() else {
      return Ok(());
    };
    let inner = self.inner.lock().unwrap();
    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
    {
      let mut tmp = fs::File::create(&tmp_path)
        .with_context(|| format!("couldn't create {tmp_path:?}"))?;
      for digest in &inner.seen {
        tmp.write_all(format!("{}\n", digest.to_hex()).as_bytes())?;
      }
      tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)
      .with_context(|| format!("couldn't rename {tmp_path:?} to {path:?}"))?;
    Ok(())
  }
}
