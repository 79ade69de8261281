//! TTL-Bounded File Cache
//!
//! Memoizes keyed results across process invocations:
//! - One manifest file per cache, binary encoded
//! - Whole-file staleness from the manifest's modification time
//! - A null variant so callers never branch on "is caching enabled"
//!
//! The cache is single-writer per process. Concurrent processes sharing a
//! manifest are not coordinated.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::error::{ReportError, Result};

/// Serialized key → JSON-encoded value
type Manifest = HashMap<String, Vec<u8>>;

/// Cache hit/miss counters
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache settings, usually taken from the command line
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Manifest location; `~` and `$VAR` are expanded
    pub path: Option<String>,
    /// Minutes a manifest stays fresh after it was written
    pub period_minutes: u64,
}

impl CacheConfig {
    pub fn new(path: impl Into<String>, period_minutes: u64) -> Self {
        Self {
            path: Some(path.into()),
            period_minutes,
        }
    }
}

/// Object-safe cache contract over pre-serialized keys and values
pub trait CacheStore: Send + Sync {
    /// Read the manifest into the working set.
    ///
    /// Returns `Ok(false)` when the manifest is missing or older than the
    /// TTL, and an error when it exists but cannot be decoded.
    fn load(&mut self) -> Result<bool>;

    /// Look up a serialized key in the working set; never touches disk
    fn get_raw(&self, key: &str) -> Option<Vec<u8>>;

    /// Overwrite the manifest with a single `{key: value}` entry
    fn save_raw(&mut self, key: String, value: Vec<u8>) -> Result<()>;

    fn stats(&self) -> CacheStats;
}

/// Typed access for any [`CacheStore`]
pub trait CacheStoreExt: CacheStore {
    fn get<K, V>(&self, key: &K) -> Option<V>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let key = serialize_key(key).ok()?;
        self.get_raw(&key)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn save<K, V>(&mut self, key: &K, value: &V) -> Result<()>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = serialize_key(key)?;
        let value = serde_json::to_vec(value).map_err(|e| ReportError::CacheEncode(e.to_string()))?;
        self.save_raw(key, value)
    }
}

impl<T: CacheStore + ?Sized> CacheStoreExt for T {}

/// Structural key encoding; equal keys must serialize identically
fn serialize_key<K: Serialize + ?Sized>(key: &K) -> Result<String> {
    serde_json::to_string(key).map_err(|e| ReportError::CacheEncode(format!("key: {}", e)))
}

/// Build the cache selected by `config`
pub fn cache_from_config(config: Option<&CacheConfig>) -> Box<dyn CacheStore> {
    let Some(config) = config else {
        return Box::new(NullCache::default());
    };

    match config.path.as_deref() {
        Some(path) if !path.is_empty() && config.period_minutes > 0 => {
            Box::new(FileCache::new(path, config.period_minutes))
        }
        _ => {
            info!("Disabling cache");
            Box::new(NullCache::default())
        }
    }
}

/// Cache that never holds anything
#[derive(Debug, Default)]
pub struct NullCache {
    misses: Mutex<u64>,
}

impl CacheStore for NullCache {
    fn load(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn get_raw(&self, _key: &str) -> Option<Vec<u8>> {
        *self.misses.lock() += 1;
        None
    }

    fn save_raw(&mut self, _key: String, _value: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: 0,
            misses: *self.misses.lock(),
        }
    }
}

/// Cache persisted to one manifest file
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    ttl: Duration,
    data: Manifest,
    stats: Mutex<CacheStats>,
}

impl FileCache {
    pub fn new(path: impl AsRef<str>, ttl_minutes: u64) -> Self {
        Self {
            path: expand_path(path.as_ref()),
            ttl: Duration::from_secs(ttl_minutes.saturating_mul(60)),
            data: Manifest::new(),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_stale(&self, modified: SystemTime) -> bool {
        // mtime in the future counts as age zero
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        age > self.ttl
    }

    /// Sibling the manifest is written to before the rename
    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_error(&self, source: io::Error) -> ReportError {
        ReportError::CacheIo {
            path: self.path.clone(),
            source,
        }
    }
}

impl CacheStore for FileCache {
    fn load(&mut self) -> Result<bool> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.io_error(e)),
        };

        let modified = metadata.modified().map_err(|e| self.io_error(e))?;
        if self.is_stale(modified) {
            debug!(path = %self.path.display(), "Cache manifest expired");
            return Ok(false);
        }

        let bytes = fs::read(&self.path).map_err(|e| self.io_error(e))?;
        self.data = bincode::deserialize(&bytes).map_err(|e| ReportError::CacheCorrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        info!(path = %self.path.display(), entries = self.data.len(), "Using cache file");
        Ok(true)
    }

    fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        let found = self.data.get(key).cloned();
        let mut stats = self.stats.lock();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    fn save_raw(&mut self, key: String, value: Vec<u8>) -> Result<()> {
        let mut manifest = Manifest::new();
        manifest.insert(key, value);

        let bytes = bincode::serialize(&manifest).map_err(|e| ReportError::CacheEncode(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        // Whole-file replace: readers see the old manifest or the new one
        let tmp = self.temp_path();
        fs::write(&tmp, &bytes).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "Saved cache manifest");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}

/// Expand `~` and `$VAR`/`${VAR}`, then make the path absolute
pub fn expand_path(raw: &str) -> PathBuf {
    let vars_expanded = expand_vars(raw);

    let home_expanded = match vars_expanded.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match std::env::var("HOME") {
            Ok(home) => format!("{}{}", home, rest),
            Err(_) => vars_expanded.clone(),
        },
        _ => vars_expanded.clone(),
    };

    let path = PathBuf::from(home_expanded);
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Unknown variables are left untouched
fn expand_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }

        let closed = !braced || chars.peek() == Some(&'}');
        if braced && closed {
            chars.next();
        }

        match std::env::var(&name) {
            Ok(value) if !name.is_empty() && closed => out.push_str(&value),
            _ => {
                out.push('$');
                if braced {
                    out.push('{');
                }
                out.push_str(&name);
                if braced && closed {
                    out.push('}');
                }
            }
        }
    }

    out
}
