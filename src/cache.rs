//! Result cache keyed by (step, strategy, normalized input + options).
//!
//! The manager owns ttl and serialization; backends only move opaque bytes.
//! Any backend failure switches the manager to pass-through for the rest of
//! the process: every `get` misses and every `put` is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::Options;
use crate::error::KiraError;
use crate::table::ResultTable;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    step: String,
    strategy: String,
    digest: String,
}

impl CacheKey {
    pub fn new(
        step: &str,
        strategy: &str,
        identifier: &str,
        options: &Options,
        case_sensitive: bool,
    ) -> Self {
        let mut material = normalize(identifier, case_sensitive);
        for (key, value) in options {
            material.push('\u{1f}');
            material.push_str(&normalize(key, false));
            material.push('=');
            material.push_str(&normalize(value, case_sensitive));
        }
        let digest = format!("{:x}", Sha256::digest(material.as_bytes()));
        Self {
            step: step.to_string(),
            strategy: strategy.to_string(),
            digest,
        }
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// Opaque backend key. Step-scoped invalidation relies on the step being
    /// the first segment.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.step, self.strategy, self.digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// Trim, collapse inner whitespace and optionally fold case.
pub fn normalize(value: &str, case_sensitive: bool) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if case_sensitive {
        collapsed
    } else {
        collapsed.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub created_at: DateTime<Utc>,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    pub table: ResultTable,
}

impl CacheEntry {
    pub fn new(strategy: &str, table: ResultTable, ttl: Option<Duration>) -> Self {
        Self {
            created_at: Utc::now(),
            strategy: strategy.to_string(),
            ttl_secs: ttl.map(|ttl| ttl.as_secs()),
            table,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_secs {
            None => false,
            Some(secs) => i64::try_from(secs)
                .ok()
                .and_then(chrono::TimeDelta::try_seconds)
                .and_then(|ttl| self.created_at.checked_add_signed(ttl))
                .is_some_and(|expires_at| now >= expires_at),
        }
    }
}

pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KiraError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KiraError>;
    fn delete(&self, key: &str) -> Result<(), KiraError>;
    /// Delete every key starting with `prefix`; an empty prefix clears everything.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, KiraError>;
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, KiraError> {
        self.entries
            .lock()
            .map_err(|_| KiraError::CacheUnavailable("memory cache lock poisoned".to_string()))
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KiraError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KiraError> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KiraError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, KiraError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidateScope {
    Key(CacheKey),
    Step(String),
    All,
}

pub struct CacheManager {
    backend: Option<Box<dyn CacheBackend>>,
    degraded: AtomicBool,
}

impl CacheManager {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
            degraded: AtomicBool::new(false),
        }
    }

    /// A manager without a backing store; every lookup misses.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some() && !self.degraded.load(Ordering::Relaxed)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map(|b| b.name()).unwrap_or("none")
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let backend = self.active_backend()?;
        let storage_key = key.storage_key();
        let bytes = match backend.get(&storage_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(key = %storage_key, "cache miss");
                return None;
            }
            Err(err) => {
                self.degrade(&err);
                return None;
            }
        };
        let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %storage_key, error = %err, "dropping unreadable cache entry");
                self.purge(backend, &storage_key);
                return None;
            }
        };
        if entry.is_expired(Utc::now()) {
            debug!(key = %storage_key, "cache entry expired");
            self.purge(backend, &storage_key);
            return None;
        }
        debug!(key = %storage_key, "cache hit");
        Some(entry)
    }

    /// Last write wins. `ttl = None` keeps the entry until it is invalidated.
    pub fn put(&self, key: &CacheKey, table: &ResultTable, ttl: Option<Duration>) {
        let Some(backend) = self.active_backend() else {
            return;
        };
        let entry = CacheEntry::new(key.strategy(), table.clone(), ttl);
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to serialize cache entry");
                return;
            }
        };
        if let Err(err) = backend.put(&key.storage_key(), &bytes) {
            self.degrade(&err);
        }
    }

    /// Returns the number of removed entries, 0 when the cache is unavailable.
    pub fn invalidate(&self, scope: &InvalidateScope) -> usize {
        let Some(backend) = self.active_backend() else {
            return 0;
        };
        let result = match scope {
            InvalidateScope::Key(key) => backend.delete(&key.storage_key()).map(|_| 1),
            InvalidateScope::Step(step) => backend.delete_prefix(&format!("{step}/")),
            InvalidateScope::All => backend.delete_prefix(""),
        };
        match result {
            Ok(count) => count,
            Err(err) => {
                self.degrade(&err);
                0
            }
        }
    }

    fn active_backend(&self) -> Option<&dyn CacheBackend> {
        if self.degraded.load(Ordering::Relaxed) {
            return None;
        }
        self.backend.as_deref()
    }

    fn purge(&self, backend: &dyn CacheBackend, storage_key: &str) {
        if let Err(err) = backend.delete(storage_key) {
            self.degrade(&err);
        }
    }

    fn degrade(&self, err: &KiraError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                backend = self.backend_name(),
                error = %err,
                "cache backend failed; continuing without cache"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Association;

    struct BrokenBackend;

    impl CacheBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, KiraError> {
            Err(KiraError::CacheUnavailable("connection refused".to_string()))
        }

        fn put(&self, _key: &str, _value: &[u8]) -> Result<(), KiraError> {
            Err(KiraError::CacheUnavailable("connection refused".to_string()))
        }

        fn delete(&self, _key: &str) -> Result<(), KiraError> {
            Err(KiraError::CacheUnavailable("connection refused".to_string()))
        }

        fn delete_prefix(&self, _prefix: &str) -> Result<usize, KiraError> {
            Err(KiraError::CacheUnavailable("connection refused".to_string()))
        }
    }

    fn key(identifier: &str) -> CacheKey {
        CacheKey::new("targets", "chembl", identifier, &Options::new(), false)
    }

    fn sample(entity: &str) -> ResultTable {
        ResultTable::from_rows(vec![Association::new("id1", entity).with_score(0.7)])
    }

    #[test]
    fn key_normalization_folds_whitespace_and_case() {
        assert_eq!(key("  Lung   Cancer "), key("lung cancer"));
        assert_ne!(key("lung cancer"), key("breast cancer"));

        let smiles_upper = CacheKey::new("targets", "chembl", "C1=CC=CC=C1", &Options::new(), true);
        let smiles_lower = CacheKey::new("targets", "chembl", "c1ccccc1", &Options::new(), true);
        assert_ne!(smiles_upper, smiles_lower);
    }

    #[test]
    fn key_depends_on_options() {
        let mut options = Options::new();
        options.insert("organism".to_string(), "Homo sapiens".to_string());
        let with = CacheKey::new("targets", "chembl", "CCO", &options, false);
        assert_ne!(with, key("CCO"));
        assert!(with.storage_key().starts_with("targets/chembl/"));
    }

    #[test]
    fn put_then_get_returns_last_write() {
        let cache = CacheManager::new(Box::new(MemoryBackend::new()));
        cache.put(&key("CCO"), &sample("TGT1"), None);
        assert_eq!(cache.get(&key("CCO")).unwrap().table, sample("TGT1"));
        cache.put(&key("CCO"), &sample("TGT2"), None);
        assert_eq!(cache.get(&key("CCO")).unwrap().table, sample("TGT2"));
    }

    #[test]
    fn zero_ttl_is_a_miss() {
        let cache = CacheManager::new(Box::new(MemoryBackend::new()));
        cache.put(&key("CCO"), &sample("TGT1"), Some(Duration::ZERO));
        assert!(cache.get(&key("CCO")).is_none());
    }

    #[test]
    fn expiry_is_relative_to_creation() {
        let mut entry = CacheEntry::new("chembl", sample("X"), Some(Duration::from_secs(60)));
        let created = entry.created_at;
        assert!(!entry.is_expired(created + chrono::Duration::seconds(59)));
        assert!(entry.is_expired(created + chrono::Duration::seconds(60)));
        entry.ttl_secs = None;
        assert!(!entry.is_expired(created + chrono::Duration::days(3650)));
    }

    #[test]
    fn invalidate_by_step_scope() {
        let cache = CacheManager::new(Box::new(MemoryBackend::new()));
        let disease = CacheKey::new("disease", "omim", "asthma", &Options::new(), false);
        cache.put(&key("CCO"), &sample("A"), None);
        cache.put(&disease, &sample("B"), None);

        assert_eq!(cache.invalidate(&InvalidateScope::Step("targets".to_string())), 1);
        assert!(cache.get(&key("CCO")).is_none());
        assert!(cache.get(&disease).is_some());

        assert_eq!(cache.invalidate(&InvalidateScope::All), 1);
        assert!(cache.get(&disease).is_none());
    }

    #[test]
    fn broken_backend_degrades_to_pass_through() {
        let cache = CacheManager::new(Box::new(BrokenBackend));
        assert!(cache.is_available());
        cache.put(&key("CCO"), &sample("A"), None);
        assert!(!cache.is_available());
        assert!(cache.get(&key("CCO")).is_none());
        assert_eq!(cache.invalidate(&InvalidateScope::All), 0);
    }

    #[test]
    fn corrupt_entry_is_purged() {
        let backend = MemoryBackend::new();
        backend.put(&key("CCO").storage_key(), b"not json").unwrap();
        let cache = CacheManager::new(Box::new(backend));
        assert!(cache.get(&key("CCO")).is_none());
        assert!(cache.is_available());
    }
}
