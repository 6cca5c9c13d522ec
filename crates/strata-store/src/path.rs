use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Bucket for keys too short to be split into nesting levels.
pub const SHORT_KEY_DIR: &str = "000";

/// Maps storage keys to filesystem paths under a root directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathStrategy {
    /// `root/key`.
    Flat { dir: PathBuf },
    /// `depth` levels of two-character prefix directories, then the key.
    SubDirs { dir: PathBuf, depth: usize },
}

impl PathStrategy {
    pub fn flat(dir: impl Into<PathBuf>) -> Self {
        Self::Flat { dir: dir.into() }
    }

    /// Nested layout; `depth` must be at least 1.
    pub fn subdirs(dir: impl Into<PathBuf>, depth: usize) -> StoreResult<Self> {
        if depth == 0 {
            return Err(StoreError::config("sub-directory depth must be at least 1"));
        }
        Ok(Self::SubDirs {
            dir: dir.into(),
            depth,
        })
    }

    pub fn dir(&self) -> &Path {
        match self {
            Self::Flat { dir } | Self::SubDirs { dir, .. } => dir,
        }
    }

    /// Returns `true` if `key` can be mapped by this strategy.
    pub fn is_valid_key(&self, key: &str) -> bool {
        match self {
            Self::Flat { .. } => !key.is_empty(),
            Self::SubDirs { .. } => is_safe_key(key),
        }
    }

    /// Filesystem location of `key`. No directory is listed or created.
    pub fn path_for_key(&self, key: &str) -> StoreResult<PathBuf> {
        match self {
            Self::Flat { dir } => Ok(dir.join(key)),
            Self::SubDirs { dir, depth } => {
                if !is_safe_key(key) {
                    return Err(StoreError::InvalidKey {
                        key: key.to_string(),
                        reason: "must match [a-zA-Z0-9]+".into(),
                    });
                }
                let mut path = dir.clone();
                if key.len() < 2 * depth {
                    path.push(SHORT_KEY_DIR);
                } else {
                    for level in 0..*depth {
                        path.push(&key[2 * level..2 * level + 2]);
                    }
                }
                path.push(key);
                Ok(path)
            }
        }
    }
}

fn is_safe_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric())
}
