use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_crypto::{DigestAlgorithm, KeySource, Keystore};
use tracing::debug;

use crate::aes::AesBlobStore;
use crate::caching::{CacheConfig, CachingBlobStore};
use crate::error::{StoreError, StoreResult};
use crate::key::KeyStrategy;
use crate::local::LocalBlobStore;
use crate::memory::InMemoryBlobStore;
use crate::path::PathStrategy;
use crate::traits::BlobStore;

/// Named string properties describing one store, with typed accessors.
///
/// Loaded from TOML, nested tables flatten to dotted names:
/// ```toml
/// store = "local"
/// digest = "SHA-256"
///
/// [path]
/// root = "/var/lib/strata"
/// depth = 3
///
/// [cache]
/// path = "/var/cache/strata"
/// maxSize = "512MB"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreConfig {
    properties: BTreeMap<String, String>,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| StoreError::config(format!("invalid store config: {e}")))?;
        let mut config = Self::new();
        flatten("", &table, &mut config.properties);
        Ok(config)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Value of `name`; blank values count as unset.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_string(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or(default).to_string()
    }

    pub fn require_string(&self, name: &str) -> StoreResult<&str> {
        self.get(name)
            .ok_or_else(|| StoreError::config(format!("missing required property {name:?}")))
    }

    pub fn get_long(&self, name: &str, default: i64) -> StoreResult<i64> {
        self.parse_with(name, default)
    }

    pub fn get_int(&self, name: &str, default: i32) -> StoreResult<i32> {
        self.parse_with(name, default)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> StoreResult<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
            Some(v) => Err(malformed(name, v)),
        }
    }

    /// Byte size such as `1024`, `100KB`, `512 MB`, or `1GB` (binary multiples).
    pub fn get_size(&self, name: &str, default: u64) -> StoreResult<u64> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => parse_size(v).ok_or_else(|| malformed(name, v)),
        }
    }

    fn parse_with<T: std::str::FromStr>(&self, name: &str, default: T) -> StoreResult<T> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| malformed(name, v)),
        }
    }
}

fn malformed(name: &str, value: &str) -> StoreError {
    StoreError::config(format!("malformed value {value:?} for property {name:?}"))
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (key, value) in table {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten(&name, inner, out),
            toml::Value::String(s) => {
                out.insert(name, s.clone());
            }
            other => {
                out.insert(name, other.to_string());
            }
        }
    }
}

fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the store stack described by `config`:
///
/// ```text
/// local | memory        `store`, `path.root`, `path.strategy`, `path.depth`, `versioning`
///   -> cache            when `cache.path` is set
///   -> aes              when `encryption = "aes"`
/// ```
///
/// The cache sits below the encryption layer and only holds ciphertext.
pub fn open_store(name: &str, config: &StoreConfig) -> StoreResult<Arc<dyn BlobStore>> {
    let key_strategy = key_strategy(config)?;
    let versioning = config.get_bool("versioning", false)?;

    let mut store: Arc<dyn BlobStore> = match config.get_string("store", "local").as_str() {
        "memory" => {
            if versioning {
                Arc::new(InMemoryBlobStore::with_versioning(name, key_strategy.clone()))
            } else {
                Arc::new(InMemoryBlobStore::new(name, key_strategy.clone()))
            }
        }
        "local" => {
            if versioning {
                return Err(StoreError::config("local store does not support versioning"));
            }
            let root = local_root(config)?;
            let paths = path_strategy(config, &root)?;
            Arc::new(LocalBlobStore::with_path_strategy(name, &root, key_strategy.clone(), paths)?)
        }
        other => return Err(StoreError::config(format!("unknown store type {other:?}"))),
    };

    if let Some(cache_path) = config.get("cache.path") {
        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            max_size: config.get_size("cache.maxSize", defaults.max_size)?,
            max_count: usize::try_from(config.get_long("cache.maxCount", defaults.max_count as i64)?)
                .map_err(|_| malformed("cache.maxCount", "negative"))?,
            min_age: Duration::from_secs(
                u64::try_from(config.get_long("cache.minAge", defaults.min_age.as_secs() as i64)?)
                    .map_err(|_| malformed("cache.minAge", "negative"))?,
            ),
        };
        store = Arc::new(CachingBlobStore::new(name, store, Path::new(cache_path), cache)?);
    }

    match config.get("encryption") {
        None => {}
        Some(v) if v.eq_ignore_ascii_case("aes") => {
            store = Arc::new(AesBlobStore::new(name, store, key_source(config)?, key_strategy));
        }
        Some(other) => return Err(StoreError::config(format!("unknown encryption {other:?}"))),
    }

    debug!(store = name, stack = ?store, "opened store");
    Ok(store)
}

fn key_strategy(config: &StoreConfig) -> StoreResult<KeyStrategy> {
    let digest: DigestAlgorithm = config
        .get_string("digest", DigestAlgorithm::default().name())
        .parse()
        .map_err(|e| StoreError::config(format!("{e}")))?;
    match config.get_string("key.strategy", "digest").as_str() {
        "digest" => Ok(KeyStrategy::digest(digest)),
        "docid" => Ok(KeyStrategy::DocId),
        "managed" => Ok(KeyStrategy::managed(KeyStrategy::digest(digest))),
        other => Err(StoreError::config(format!("unknown key strategy {other:?}"))),
    }
}

/// `path.root`, or a plain `path` when no other `path.*` property is needed.
fn local_root(config: &StoreConfig) -> StoreResult<PathBuf> {
    config
        .get("path.root")
        .or_else(|| config.get("path"))
        .map(PathBuf::from)
        .ok_or_else(|| StoreError::config("local store requires path.root"))
}

fn path_strategy(config: &StoreConfig, root: &Path) -> StoreResult<PathStrategy> {
    let data = root.join("data");
    match config.get_string("path.strategy", "subdirs").as_str() {
        "flat" => Ok(PathStrategy::flat(data)),
        "subdirs" => {
            let depth = config.get_int("path.depth", 2)?;
            let depth = usize::try_from(depth).map_err(|_| malformed("path.depth", &depth.to_string()))?;
            PathStrategy::subdirs(data, depth)
        }
        other => Err(StoreError::config(format!("unknown path strategy {other:?}"))),
    }
}

fn key_source(config: &StoreConfig) -> StoreResult<KeySource> {
    match (config.get("aes.password"), config.get("aes.keystore.path")) {
        (Some(_), Some(_)) => Err(StoreError::config(
            "aes.password and aes.keystore.path are mutually exclusive",
        )),
        (Some(password), None) => Ok(KeySource::password(password)),
        (None, Some(path)) => {
            let alias = config.require_string("aes.keystore.alias")?;
            let keystore = Keystore::load(Path::new(path))?;
            Ok(KeySource::Keystore(keystore.key(alias)?))
        }
        (None, None) => Err(StoreError::config(
            "aes encryption requires aes.password or aes.keystore.path",
        )),
    }
}
