//! Directory-backed cache backend.
//!
//! Each snapshot is a JSON document at `{dir}/{encoded key}.json`. Writes go
//! to a temporary file first and are renamed into place, so a crash mid-write
//! leaves the previous snapshot intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{CacheBackend, CacheKey, CacheSnapshot};
use crate::error::CacheResult;

const EXTENSION: &str = "json";

/// Cache backend that persists one JSON file per key.
#[derive(Debug, Clone)]
pub struct FileCacheBackend {
    dir: PathBuf,
}

impl FileCacheBackend {
    /// Open (and create if needed) a cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), EXTENSION))
    }
}

/// Make a key safe to use as a file name.
///
/// `:` and path separators are not portable, so everything outside
/// `[A-Za-z0-9_-]` is percent-encoded.
fn encode_key(key: &CacheKey) -> String {
    let mut out = String::new();
    for byte in key.to_string().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

impl CacheBackend for FileCacheBackend {
    fn load(&self, key: &CacheKey) -> CacheResult<Option<CacheSnapshot>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, snapshot: &CacheSnapshot) -> CacheResult<()> {
        let path = self.path_for(&snapshot.key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> CacheResult<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            // The key is read from the document rather than decoded from the name.
            match fs::read(&path)
                .map_err(crate::error::CacheError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CacheSnapshot>(&bytes)?))
            {
                Ok(snapshot) => keys.push(snapshot.key),
                Err(e) => log::warn!(
                    "[FileCacheBackend] Skipping unreadable snapshot {}: {}",
                    path.display(),
                    e
                ),
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReferenceCategory;

    #[test]
    fn test_encoded_key_is_a_plain_file_name() {
        assert_eq!(encode_key(&CacheKey::session("case/1")), "session%3Acase%2F1");
        assert_eq!(
            encode_key(&CacheKey::reference(ReferenceCategory::Hospitals)),
            "reference%3Ahospitals"
        );
    }
}
