//! Secure key-value storage for seed, master and scoped key material.
//!
//! Entries are write-once: a write against an existing key fails with
//! [`StoreStatus::Duplicate`] instead of overwriting it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Store operation that produced a failure status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOperation {
    Check,
    Read,
    Write,
    Acquire,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StoreOperation::Check => "check",
            StoreOperation::Read => "read",
            StoreOperation::Write => "write",
            StoreOperation::Acquire => "acquire",
        };
        f.write_str(label)
    }
}

/// Underlying status reported by a store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreStatus {
    #[error("entry already exists")]
    Duplicate,
    #[error("entry not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("store is held by another vault instance")]
    Busy,
    #[error("entry is corrupted")]
    Corrupted,
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("cryptographic failure: {0}")]
    Crypto(String),
}

/// Abstract secure storage scoped to the current device/user security context.
pub trait SecretStore: Send + Sync {
    /// Identifies the underlying storage so two vaults never share it.
    fn namespace(&self) -> &str;

    fn exists(&self, key: &str) -> Result<bool, StoreStatus>;

    fn read(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreStatus>;

    /// Persist a new entry. Existing entries are never overwritten.
    fn write(&self, key: &str, secret: &[u8]) -> Result<(), StoreStatus>;

    /// Take exclusive ownership of the namespace for the lifetime of the lease.
    fn acquire(&self) -> Result<StoreLease, StoreStatus>;
}

/// Exclusive hold on a store namespace, released on drop.
pub struct StoreLease {
    namespace: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl StoreLease {
    pub fn new(namespace: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            namespace: namespace.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Debug for StoreLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLease")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
    denied_writes: Mutex<HashSet<String>>,
    leased: Arc<AtomicBool>,
}

/// Process-local store. Clones share entries and the lease flag.
#[derive(Clone)]
pub struct MemorySecretStore {
    namespace: String,
    inner: Arc<MemoryInner>,
}

impl MemorySecretStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            inner: Arc::new(MemoryInner::default()),
        }
    }

    /// Reject future writes to `key` with [`StoreStatus::AccessDenied`],
    /// mirroring an OS-level access control refusal.
    pub fn deny_writes(&self, key: impl Into<String>) {
        self.inner.denied_writes.lock().insert(key.into());
    }

    pub fn allow_writes(&self, key: &str) {
        self.inner.denied_writes.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySecretStore")
            .field("namespace", &self.namespace)
            .field("entries", &self.len())
            .field("secrets", &"<redacted>")
            .finish()
    }
}

impl SecretStore for MemorySecretStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn exists(&self, key: &str) -> Result<bool, StoreStatus> {
        Ok(self.inner.entries.lock().contains_key(key))
    }

    fn read(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreStatus> {
        Ok(self
            .inner
            .entries
            .lock()
            .get(key)
            .map(|secret| Zeroizing::new(secret.to_vec())))
    }

    fn write(&self, key: &str, secret: &[u8]) -> Result<(), StoreStatus> {
        if self.inner.denied_writes.lock().contains(key) {
            return Err(StoreStatus::AccessDenied);
        }

        let mut entries = self.inner.entries.lock();
        if entries.contains_key(key) {
            return Err(StoreStatus::Duplicate);
        }
        entries.insert(key.to_string(), Zeroizing::new(secret.to_vec()));
        Ok(())
    }

    fn acquire(&self) -> Result<StoreLease, StoreStatus> {
        let flag = Arc::clone(&self.inner.leased);
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreStatus::Busy);
        }

        Ok(StoreLease::new(self.namespace.clone(), move || {
            flag.store(false, Ordering::Release);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_check_then_insert() {
        let store = MemorySecretStore::new("test");
        assert!(!store.exists("seed").unwrap());

        store.write("seed", b"first").unwrap();
        assert_eq!(store.write("seed", b"second"), Err(StoreStatus::Duplicate));

        let stored = store.read("seed").unwrap().expect("entry present");
        assert_eq!(stored.as_slice(), b"first");
        assert!(store.read("missing").unwrap().is_none());
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let store = MemorySecretStore::new("lease");
        let clone = store.clone();

        let lease = store.acquire().unwrap();
        assert_eq!(lease.namespace(), "lease");
        assert!(matches!(clone.acquire(), Err(StoreStatus::Busy)));

        drop(lease);
        assert!(clone.acquire().is_ok());
    }

    #[test]
    fn denied_writes_report_access_denied() {
        let store = MemorySecretStore::new("acl");
        store.deny_writes("master");
        assert_eq!(store.write("master", b"x"), Err(StoreStatus::AccessDenied));
        assert!(store.is_empty());

        store.allow_writes("master");
        store.write("master", b"x").unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let store = MemorySecretStore::new("debug");
        store.write("seed", b"abandon ability").unwrap();
        let rendered = format!("{:?}", store);
        assert!(!rendered.contains("abandon"));
        assert!(rendered.contains("<redacted>"));
    }
}
