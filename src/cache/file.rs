// SPDX-License-Identifier: MIT

//! File-backed draft cache
//!
//! Each key maps to `<dir>/<encoded key>.json`. Writes go to a temporary
//! sibling file that is then renamed over the target, so readers observe
//! either the old record or the new one.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::DraftCache;
use crate::error::CacheError;

pub struct FileDraftCache {
    dir: PathBuf,
    quota: usize,
}

impl FileDraftCache {
    /// Open (and create) a cache directory
    pub fn open<P: AsRef<Path>>(dir: P, quota: usize) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, quota })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

/// File-name-safe, reversible key encoding: any byte other than an ASCII
/// alphanumeric or `-` becomes `_xx`
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}

impl DraftCache for FileDraftCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        if value.len() > self.quota {
            return Err(CacheError::QuotaExceeded {
                key: key.to_string(),
                size: value.len(),
                limit: self.quota,
            });
        }

        let target = self.path_for(key);
        let tmp = target.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, value)?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        log::debug!("Cached {} bytes under '{}'", value.len(), key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
