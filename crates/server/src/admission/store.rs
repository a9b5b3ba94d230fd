//! Bucket store abstraction and the in-memory implementation.
//!
//! Stores expose a revisioned view of each key so that the gate can write
//! back conditionally: a write succeeds only if nobody else wrote the key
//! since it was read.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;
use turnstile_core::TokenBucket;

/// Failure talking to the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection refused, reset, or any other transport/server error.
    #[error("bucket store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the configured bound.
    #[error("bucket store timed out after {0} ms")]
    Timeout(u64),
}

impl StoreError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Timeout(_) => "timeout",
        }
    }
}

/// What the store holds for a key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoredBucket {
    /// Never written, or evicted.
    Absent,
    Present(TokenBucket),
    /// A record exists but cannot be decoded into a valid bucket.
    Malformed,
}

/// A read of one key together with the revision it was read at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub stored: StoredBucket,
    /// 0 for absent keys; bumped by every successful write.
    pub revision: u64,
}

impl Snapshot {
    pub fn absent() -> Self {
        Self {
            stored: StoredBucket::Absent,
            revision: 0,
        }
    }
}

/// Shared key → bucket mapping.
///
/// Implementations make no promise about serializing a caller's
/// read/compute/write sequence; [`compare_and_swap`](BucketStore::compare_and_swap)
/// is the only atomic primitive.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Read the bucket stored under `key`.
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError>;

    /// Write `bucket` under `key` iff its revision is still `expected_revision`.
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        bucket: &TokenBucket,
    ) -> Result<bool, StoreError>;

    /// Cheap reachability check for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    stored: StoredBucket,
    revision: u64,
}

/// Process-local store for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a key unconditionally, bumping its revision.
    ///
    /// Used to simulate corrupt records or writes from another instance.
    pub fn insert_raw(&self, key: &str, stored: StoredBucket) {
        let mut entries = self.entries.lock();
        let revision = entries.get(key).map(|e| e.revision).unwrap_or(0) + 1;
        entries.insert(key.to_string(), Entry { stored, revision });
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError> {
        Ok(match self.entries.lock().get(key) {
            Some(entry) => Snapshot {
                stored: entry.stored,
                revision: entry.revision,
            },
            None => Snapshot::absent(),
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        bucket: &TokenBucket,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|e| e.revision).unwrap_or(0);
        if current != expected_revision {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                stored: StoredBucket::Present(*bucket),
                revision: current + 1,
            },
        );
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(tokens: f64) -> TokenBucket {
        TokenBucket {
            tokens,
            last_refill_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn unknown_key_is_absent_at_revision_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nobody").await.unwrap(), Snapshot::absent());
    }

    #[tokio::test]
    async fn cas_succeeds_once_per_revision() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("k", 0, &bucket(9.0)).await.unwrap());
        // A second writer still holding revision 0 loses.
        assert!(!store.compare_and_swap("k", 0, &bucket(9.0)).await.unwrap());

        let snap = store.get("k").await.unwrap();
        assert_eq!(snap.revision, 1);
        assert_eq!(snap.stored, StoredBucket::Present(bucket(9.0)));

        assert!(store.compare_and_swap("k", 1, &bucket(8.0)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().revision, 2);
    }

    #[tokio::test]
    async fn malformed_record_can_be_overwritten_at_its_revision() {
        let store = MemoryStore::new();
        store.insert_raw("k", StoredBucket::Malformed);
        let snap = store.get("k").await.unwrap();
        assert_eq!(snap.stored, StoredBucket::Malformed);
        assert!(store
            .compare_and_swap("k", snap.revision, &bucket(10.0))
            .await
            .unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(StoreError::Timeout(5).kind(), "timeout");
        assert_eq!(
            StoreError::Unavailable("refused".into()).kind(),
            "unavailable"
        );
    }
}
