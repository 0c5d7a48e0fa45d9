//! SQLite-backed environment snapshot cache.
//!
//! Building an [`Environment`] from a large model is repeated work, so a
//! built environment can be stored as JSON keyed by a hash of its source.
//!
//! # Design
//!
//! - Simple key-value store with JSON values
//! - No TTL, entries persist until cleared
//! - Each payload is stored with its checksum; an entry that fails the check
//!   is dropped and reads as a miss
//! - Versioned: a stored version different from the running one clears every
//!   entry on open, never a subset
//!
//! # Key Format
//!
//! ```text
//! env:{fingerprint}     -> Environment
//! ```

mod hash;
pub use hash::{checksum, fingerprint};

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::CacheSettings;
use crate::environment::Environment;

/// Cache schema version. Bump when the stored layout changes.
const SCHEMA_VERSION: u32 = 1;

/// The version a cache must carry to be reused: schema plus crate version.
pub fn cache_version() -> String {
    format!("{}-{}", SCHEMA_VERSION, env!("CARGO_PKG_VERSION"))
}

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to determine cache directory")]
    NoCacheDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Entry count and payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: usize,
}

/// Persistent store of environment snapshots.
pub struct EnvironmentCache {
    conn: Connection,
    version: String,
}

impl EnvironmentCache {
    /// Open or create the cache database at `path`.
    ///
    /// If the stored version doesn't match, the cache is cleared.
    pub fn open(path: &Path) -> CacheResult<Self> {
        Self::open_with_version(path, &cache_version())
    }

    /// Open the cache at `path`, stamped with a caller-chosen `version`.
    pub fn open_with_version(path: &Path, version: &str) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?, version.to_string())
    }

    /// Open the cache at the default location under the user cache directory.
    pub fn open_default() -> CacheResult<Self> {
        Self::open(&Self::default_path()?)
    }

    /// Open the cache configured by `settings`, or `None` when disabled.
    pub fn from_settings(settings: &CacheSettings) -> crate::Result<Option<Self>> {
        match settings.resolved_path()? {
            Some(path) => Ok(Some(Self::open(&path)?)),
            None => Ok(None),
        }
    }

    /// Open an in-memory cache (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        Self::init(Connection::open_in_memory()?, cache_version())
    }

    /// Open an in-memory cache stamped with `version`.
    pub fn open_in_memory_with_version(version: &str) -> CacheResult<Self> {
        Self::init(Connection::open_in_memory()?, version.to_string())
    }

    pub fn default_path() -> CacheResult<PathBuf> {
        let base = dirs::cache_dir().ok_or(CacheError::NoCacheDir)?;
        Ok(base.join("grainql").join("environments.sqlite"))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn init(conn: Connection, version: String) -> CacheResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                checksum TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        let cache = Self { conn, version };
        cache.check_version()?;
        Ok(cache)
    }

    fn check_version(&self) -> CacheResult<()> {
        let stored: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .optional()?;

        match stored {
            Some(v) if v == self.version => {}
            Some(v) => {
                log::info!(
                    "cache version {} does not match {}, clearing",
                    v,
                    self.version
                );
                self.clear_all()?;
                self.set_version()?;
            }
            None => self.set_version()?,
        }
        Ok(())
    }

    fn set_version(&self) -> CacheResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
            params![self.version],
        )?;
        Ok(())
    }

    /// Get a value from the cache.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let stored: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT value, checksum FROM cache WHERE key = ?",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match stored {
            Some((json, sum)) if checksum(&json) == sum => Ok(Some(serde_json::from_str(&json)?)),
            Some(_) => {
                log::warn!("cache entry {} failed its checksum, dropping it", key);
                self.delete(key)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Set a value in the cache.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> CacheResult<()> {
        let json = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO cache (key, value, checksum) VALUES (?, ?, ?)",
            params![key, json, checksum(&json)],
        )?;
        Ok(())
    }

    /// Delete a value from the cache.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM cache WHERE key = ?", params![key])?;
        Ok(rows > 0)
    }

    /// Clear all cache entries (but keep metadata).
    pub fn clear_all(&self) -> CacheResult<()> {
        self.conn.execute("DELETE FROM cache", [])?;
        Ok(())
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let entry_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;

        let total_size: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM cache",
            [],
            |row| row.get(0),
        )?;

        Ok(CacheStats {
            entry_count: entry_count as usize,
            total_size_bytes: total_size as usize,
        })
    }

    // ===== Environment snapshots =====

    /// Store `env` under the hash of `source`.
    pub fn store_environment<S: Serialize>(&self, source: &S, env: &Environment) -> CacheResult<String> {
        let key = CacheKey::environment(&fingerprint(&self.version, source)?);
        log::debug!("caching environment as {}", key);
        self.set(&key, env)?;
        Ok(key)
    }

    /// The environment stored for `source`, if any.
    pub fn load_environment<S: Serialize>(&self, source: &S) -> CacheResult<Option<Environment>> {
        let key = CacheKey::environment(&fingerprint(&self.version, source)?);
        let hit: Option<Environment> = self.get(&key)?;
        log::debug!("environment cache {} for {}", if hit.is_some() { "hit" } else { "miss" }, key);
        Ok(hit)
    }

    /// The cached environment for `source`, building and storing it on a miss.
    pub fn environment_or_build<S, F>(&self, source: &S, build: F) -> crate::Result<Environment>
    where
        S: Serialize,
        F: FnOnce() -> crate::Result<Environment>,
    {
        if let Some(env) = self.load_environment(source)? {
            return Ok(env);
        }
        let env = build()?;
        self.store_environment(source, &env)?;
        Ok(env)
    }
}

/// Cache key builders.
pub struct CacheKey;

impl CacheKey {
    pub fn environment(source_hash: &str) -> String {
        format!("env:{}", source_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Concept, DataType};

    fn environment() -> Environment {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env
    }

    #[test]
    fn test_cache_get_set() {
        let cache = EnvironmentCache::open_in_memory().unwrap();
        cache.set("test:key", &vec!["a", "b", "c"]).unwrap();
        let value: Option<Vec<String>> = cache.get("test:key").unwrap();
        assert_eq!(
            value,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        let missing: Option<String> = cache.get("nonexistent").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_cache_delete() {
        let cache = EnvironmentCache::open_in_memory().unwrap();
        cache.set("test:key", &"value").unwrap();
        assert!(cache.delete("test:key").unwrap());
        assert!(cache.get::<String>("test:key").unwrap().is_none());
        assert!(!cache.delete("nonexistent").unwrap());
    }

    #[test]
    fn test_environment_round_trip() {
        let cache = EnvironmentCache::open_in_memory().unwrap();
        let env = environment();
        let key = cache.store_environment(&"model source", &env).unwrap();
        assert!(key.starts_with("env:"));

        let loaded = cache.load_environment(&"model source").unwrap().unwrap();
        assert!(loaded.concepts.contains_key("local.order_id"));
        assert!(cache.load_environment(&"other source").unwrap().is_none());
    }

    #[test]
    fn test_build_runs_only_on_miss() {
        let cache = EnvironmentCache::open_in_memory().unwrap();
        let mut builds = 0;
        for _ in 0..2 {
            let env = cache
                .environment_or_build(&"src", || {
                    builds += 1;
                    Ok(environment())
                })
                .unwrap();
            assert!(env.concepts.contains_key("local.order_id"));
        }
        assert_eq!(builds, 1);
    }

    #[test]
    fn test_corrupted_entry_reads_as_miss() {
        let cache = EnvironmentCache::open_in_memory().unwrap();
        cache.set("k", &vec![1, 2, 3]).unwrap();
        cache
            .conn
            .execute("UPDATE cache SET value = '[1,2,4]' WHERE key = 'k'", [])
            .unwrap();
        assert!(cache.get::<Vec<i32>>("k").unwrap().is_none());
        assert_eq!(cache.stats().unwrap().entry_count, 0);
    }

    #[test]
    fn test_version_mismatch_clears_everything() {
        let dir = std::env::temp_dir().join(format!("grainql-cache-{}", std::process::id()));
        let path = dir.join("cache.sqlite");
        let _ = std::fs::remove_file(&path);
        {
            let cache = EnvironmentCache::open(&path).unwrap();
            cache.store_environment(&"src", &environment()).unwrap();
            cache.set("other", &1).unwrap();
            assert_eq!(cache.stats().unwrap().entry_count, 2);
        }
        {
            let cache = EnvironmentCache::open_with_version(&path, "0-old").unwrap();
            assert_eq!(cache.stats().unwrap().entry_count, 0);
            assert_eq!(cache.version(), "0-old");
        }
        let reopened = EnvironmentCache::open(&path).unwrap();
        assert_eq!(reopened.stats().unwrap().entry_count, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
