//! Content cache for expensive transforms, and the destructive clean of the
//! output tree.
//!
//! Cache entries are keyed by the identity of the transform (which includes
//! its settings) and by the fingerprint of the input. A changed input yields a
//! new key, so stale entries are never read, they simply stop being used until
//! [`Cache::clear_all`] removes them.

use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::utils::{as_overhead, hex};

/// 32 bytes length content hash, used as the identity proxy of a file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl From<blake3::Hash> for Fingerprint {
    fn from(value: blake3::Hash) -> Self {
        Fingerprint(value.into())
    }
}

impl Fingerprint {
    pub fn of(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        hex(&self.0)
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Cache key: (transform identity, input fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub identity: String,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    pub fn new(identity: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            identity: identity.into(),
            fingerprint,
        }
    }

    fn file_stem(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.identity.as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.fingerprint.0);
        Fingerprint::from(hasher.finalize()).to_hex()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
    key: CacheKey,
    size: u64,
}

/// A persistent key-value store on disk.
#[derive(Debug, Clone)]
pub struct Cache {
    dir: Utf8PathBuf,
}

impl Cache {
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn paths(&self, key: &CacheKey) -> (Utf8PathBuf, Utf8PathBuf) {
        let stem = key.file_stem();
        let data = self.dir.join(&stem);
        let meta = self.dir.join(format!("{stem}.meta.cbor"));
        (data, meta)
    }

    /// Returns the cached bytes for `key`, if a valid entry exists. Entries
    /// whose metadata doesn't match the key or the stored size are treated as
    /// missing.
    pub fn lookup(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let (path_data, path_meta) = self.paths(key);

        let file = File::open(&path_meta).ok()?;
        let meta: EntryMetadata = ciborium::from_reader(BufReader::new(file)).ok()?;

        if &meta.key != key {
            return None;
        }

        let data = fs::read(&path_data).ok()?;
        if data.len() as u64 != meta.size {
            return None;
        }

        Some(data)
    }

    pub fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), BuildError> {
        let (path_data, path_meta) = self.paths(key);

        fs::create_dir_all(&self.dir).map_err(|e| BuildError::io(&self.dir, e))?;
        fs::write(&path_data, bytes).map_err(|e| BuildError::io(&path_data, e))?;

        let meta = EntryMetadata {
            key: key.clone(),
            size: bytes.len() as u64,
        };

        let file = File::create(&path_meta).map_err(|e| BuildError::io(&path_meta, e))?;
        ciborium::into_writer(&meta, file)
            .map_err(|e| BuildError::io(&path_meta, std::io::Error::other(e)))?;

        Ok(())
    }

    /// Removes every entry.
    pub fn clear_all(&self) -> Result<(), BuildError> {
        let s = Instant::now();

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(BuildError::io(&self.dir, e)),
        }

        tracing::info!("cleared the cache in {} {}", self.dir, as_overhead(s));
        Ok(())
    }
}

/// Deletes the entire output tree and recreates it empty.
pub fn clean(output_root: &Utf8Path) -> Result<(), BuildError> {
    let s = Instant::now();

    if fs::metadata(output_root).is_ok() {
        fs::remove_dir_all(output_root) //
            .map_err(|e| BuildError::io(output_root, e))?;
    }

    fs::create_dir_all(output_root) //
        .map_err(|e| BuildError::io(output_root, e))?;

    tracing::info!("cleaned {} {}", output_root, as_overhead(s));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        assert_eq!(Fingerprint::of(b"abc"), Fingerprint::of(b"abc"));
        assert_ne!(Fingerprint::of(b"abc"), Fingerprint::of(b"abd"));
        assert_eq!(Fingerprint::of(b"").to_hex().len(), 64);
    }

    #[test]
    fn test_store_and_lookup() {
        let (_guard, root) = tmp();
        let cache = Cache::open(root.join("cache"));
        let key = CacheKey::new("png:best", Fingerprint::of(b"input"));

        assert_eq!(cache.lookup(&key), None);
        cache.store(&key, b"output").unwrap();
        assert_eq!(cache.lookup(&key).as_deref(), Some(&b"output"[..]));
    }

    #[test]
    fn test_identity_is_part_of_the_key() {
        let (_guard, root) = tmp();
        let cache = Cache::open(root.join("cache"));
        let fingerprint = Fingerprint::of(b"input");

        cache
            .store(&CacheKey::new("jpeg:q75", fingerprint), b"75")
            .unwrap();

        assert_eq!(cache.lookup(&CacheKey::new("jpeg:q90", fingerprint)), None);
    }

    #[test]
    fn test_truncated_entry_is_a_miss() {
        let (_guard, root) = tmp();
        let cache = Cache::open(root.join("cache"));
        let key = CacheKey::new("svg", Fingerprint::of(b"<svg/>"));
        cache.store(&key, b"<svg/>").unwrap();

        let (data, _) = cache.paths(&key);
        fs::write(data, b"<sv").unwrap();

        assert_eq!(cache.lookup(&key), None);
    }

    #[test]
    fn test_clear_all() {
        let (_guard, root) = tmp();
        let cache = Cache::open(root.join("cache"));
        let key = CacheKey::new("gif", Fingerprint::of(b"gif"));
        cache.store(&key, b"gif").unwrap();

        cache.clear_all().unwrap();
        assert_eq!(cache.lookup(&key), None);

        // clearing an absent cache is not an error
        cache.clear_all().unwrap();
    }

    #[test]
    fn test_clean_removes_stale_files() {
        let (_guard, root) = tmp();
        let out = root.join("build");
        fs::create_dir_all(out.join("css")).unwrap();
        fs::write(out.join("css/old.css"), "a{}").unwrap();

        clean(&out).unwrap();

        assert!(out.is_dir());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_clean_fails_when_root_is_a_file() {
        let (_guard, root) = tmp();
        let out = root.join("build");
        fs::write(&out, "not a directory").unwrap();

        assert!(matches!(clean(&out), Err(BuildError::Io { .. })));
    }
}
