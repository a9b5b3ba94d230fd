use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use turnstile_core::{refill_and_consume, Clock, ManualClock, Tier, TierTable, TokenBucket};
use turnstile_server::admission::{
    AdmissionGate, BucketStore, Decision, DenyReason, FailurePolicy, GateConfig, MemoryStore,
    RequestContext, Snapshot, StoreError, StoredBucket,
};

const T0: u64 = 1_700_000_000_000;

fn ctx(tier: Tier) -> RequestContext {
    RequestContext {
        client_key: "198.51.100.7".to_string(),
        tier,
    }
}

fn gate_over(store: Arc<dyn BucketStore>, clock: &ManualClock, config: GateConfig) -> AdmissionGate {
    AdmissionGate::new(store, Arc::new(clock.clone()), config).unwrap()
}

/// Yields to the scheduler around every call so concurrent admissions interleave
/// between the read and the conditional write.
struct YieldingStore {
    inner: MemoryStore,
}

#[async_trait]
impl BucketStore for YieldingStore {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError> {
        tokio::task::yield_now().await;
        let snap = self.inner.get(key).await;
        tokio::task::yield_now().await;
        snap
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        bucket: &TokenBucket,
    ) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.inner
            .compare_and_swap(key, expected_revision, bucket)
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Healthy but slow: every call takes a fixed delay.
struct SlowStore {
    inner: MemoryStore,
    delay: std::time::Duration,
}

#[async_trait]
impl BucketStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        bucket: &TokenBucket,
    ) -> Result<bool, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .compare_and_swap(key, expected_revision, bucket)
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Simulates another service instance that consumes a token from the same
/// bucket between this instance's read and its write, for the first
/// `interference` writes.
struct InterleavingStore {
    inner: MemoryStore,
    clock: ManualClock,
    interference: AtomicUsize,
    foreign_admitted: AtomicUsize,
}

impl InterleavingStore {
    fn new(clock: ManualClock, interference: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            clock,
            interference: AtomicUsize::new(interference),
            foreign_admitted: AtomicUsize::new(0),
        }
    }

    async fn foreign_consume(&self, key: &str) {
        let limits = TierTable::default().limits(Tier::Anonymous);
        let now = self.clock.now_ms();
        let prior = match self.inner.get(key).await.unwrap().stored {
            StoredBucket::Present(b) => b,
            _ => TokenBucket::full(limits, now),
        };
        let step = refill_and_consume(&prior, limits, now);
        if step.allowed {
            self.foreign_admitted.fetch_add(1, Ordering::SeqCst);
        }
        self.inner
            .insert_raw(key, StoredBucket::Present(step.bucket));
    }
}

#[async_trait]
impl BucketStore for InterleavingStore {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError> {
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        bucket: &TokenBucket,
    ) -> Result<bool, StoreError> {
        let interfere = self
            .interference
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if interfere {
            self.foreign_consume(key).await;
        }
        self.inner
            .compare_and_swap(key, expected_revision, bucket)
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Bumps the revision before every write, so no write ever lands.
struct AlwaysConflictingStore {
    inner: MemoryStore,
}

#[async_trait]
impl BucketStore for AlwaysConflictingStore {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError> {
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        bucket: &TokenBucket,
    ) -> Result<bool, StoreError> {
        let current = self.inner.get(key).await?.stored;
        self.inner.insert_raw(key, current);
        self.inner
            .compare_and_swap(key, expected_revision, bucket)
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Reads work, writes fail.
struct ReadOnlyStore {
    inner: MemoryStore,
}

#[async_trait]
impl BucketStore for ReadOnlyStore {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError> {
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected_revision: u64,
        _bucket: &TokenBucket,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("READONLY replica".into()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

async fn admit_concurrently(gates: &[Arc<AdmissionGate>], per_gate: usize, tier: Tier) -> usize {
    let mut handles = Vec::new();
    for gate in gates {
        for _ in 0..per_gate {
            let gate = Arc::clone(gate);
            handles.push(tokio::spawn(async move { gate.admit(&ctx(tier)).await }));
        }
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().is_allowed() {
            admitted += 1;
        }
    }
    admitted
}

#[tokio::test]
async fn saturation_then_partial_refill() {
    let clock = ManualClock::new(T0);
    let gate = gate_over(Arc::new(MemoryStore::new()), &clock, GateConfig::default());
    let client = ctx(Tier::Anonymous);

    for i in 0..10 {
        assert!(gate.admit(&client).await.is_allowed(), "request {}", i + 1);
    }
    assert!(!gate.admit(&client).await.is_allowed());

    clock.advance(6_000);
    assert!(gate.admit(&client).await.is_allowed());
    assert_eq!(
        gate.admit(&client).await,
        Decision::Deny {
            limit: 10,
            retry_after_ms: 6_000,
            reason: DenyReason::RateLimited,
        }
    );
}

#[tokio::test]
async fn tiers_differ_only_in_capacity() {
    let clock = ManualClock::new(T0);
    for (tier, expected) in [(Tier::Anonymous, 10), (Tier::Authenticated, 30)] {
        let gate = gate_over(Arc::new(MemoryStore::new()), &clock, GateConfig::default());
        let mut admitted = 0;
        while gate.admit(&ctx(tier)).await.is_allowed() {
            admitted += 1;
        }
        assert_eq!(admitted, expected, "{tier}");
    }
}

#[tokio::test]
async fn backwards_clock_does_not_mint_tokens() {
    let clock = ManualClock::new(T0);
    let gate = gate_over(Arc::new(MemoryStore::new()), &clock, GateConfig::default());
    let client = ctx(Tier::Anonymous);
    while gate.admit(&client).await.is_allowed() {}

    clock.set(T0 - 120_000);
    assert!(!gate.admit(&client).await.is_allowed());

    // Back to the original time: still nothing has elapsed since the last refill.
    clock.set(T0);
    assert!(!gate.admit(&client).await.is_allowed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_admit_exactly_capacity() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(YieldingStore {
        inner: MemoryStore::new(),
    });
    let gate = Arc::new(gate_over(store, &clock, GateConfig::default()));

    assert_eq!(admit_concurrently(&[gate.clone()], 50, Tier::Anonymous).await, 10);
    assert_eq!(admit_concurrently(&[gate], 50, Tier::Anonymous).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_admissions_on_a_slow_store_still_respect_capacity() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: std::time::Duration::from_millis(20),
    });
    // Most callers wait longer than the store timeout for the key lock.
    let gate = Arc::new(gate_over(store, &clock, GateConfig::default()));

    assert_eq!(admit_concurrently(&[gate], 100, Tier::Anonymous).await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fewer_requests_than_capacity_are_all_admitted() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(YieldingStore {
        inner: MemoryStore::new(),
    });
    let gate = Arc::new(gate_over(store, &clock, GateConfig::default()));

    assert_eq!(
        admit_concurrently(&[gate], 20, Tier::Authenticated).await,
        20
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instances_sharing_a_store_admit_exactly_capacity() {
    let clock = ManualClock::new(T0);
    let store: Arc<dyn BucketStore> = Arc::new(YieldingStore {
        inner: MemoryStore::new(),
    });
    // Each gate has its own locks, like separate processes; only CAS protects the bucket.
    let config = GateConfig {
        max_cas_attempts: 64,
        ..GateConfig::default()
    };
    let gates: Vec<Arc<AdmissionGate>> = (0..3)
        .map(|_| Arc::new(gate_over(store.clone(), &clock, config.clone())))
        .collect();

    assert_eq!(admit_concurrently(&gates, 10, Tier::Anonymous).await, 10);
}

#[tokio::test]
async fn foreign_writes_between_read_and_write_are_retried() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(InterleavingStore::new(clock.clone(), 3));
    let gate = gate_over(store.clone(), &clock, GateConfig::default());
    let client = ctx(Tier::Anonymous);

    let mut admitted = 0;
    for _ in 0..20 {
        if gate.admit(&client).await.is_allowed() {
            admitted += 1;
        }
    }
    let foreign = store.foreign_admitted.load(Ordering::SeqCst);
    assert_eq!(foreign, 3);
    assert_eq!(admitted + foreign, 10);
}

#[tokio::test]
async fn endless_conflicts_deny_as_contended() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(AlwaysConflictingStore {
        inner: MemoryStore::new(),
    });
    let config = GateConfig {
        max_cas_attempts: 4,
        ..GateConfig::default()
    };
    let gate = gate_over(store, &clock, config);

    match gate.admit(&ctx(Tier::Anonymous)).await {
        Decision::Deny { reason, .. } => assert_eq!(reason, DenyReason::Contended),
        other => panic!("expected contended denial, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_write_returns_engine_decision_when_open() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(ReadOnlyStore {
        inner: MemoryStore::new(),
    });
    store.inner.insert_raw(
        "198.51.100.7",
        StoredBucket::Present(TokenBucket {
            tokens: 0.0,
            last_refill_ms: T0,
        }),
    );
    let gate = gate_over(store.clone(), &clock, GateConfig::default());

    // The empty bucket is still enforced even though the write fails.
    assert!(!gate.admit(&ctx(Tier::Anonymous)).await.is_allowed());

    clock.advance(60_000);
    assert_eq!(
        gate.admit(&ctx(Tier::Anonymous)).await,
        Decision::Allow {
            limit: 10,
            remaining: Some(9),
        }
    );
}

#[tokio::test]
async fn failed_write_denies_when_closed() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(ReadOnlyStore {
        inner: MemoryStore::new(),
    });
    let config = GateConfig {
        failure_policy: FailurePolicy::Closed,
        ..GateConfig::default()
    };
    let gate = gate_over(store, &clock, config);

    match gate.admit(&ctx(Tier::Anonymous)).await {
        Decision::Deny { reason, .. } => assert_eq!(reason, DenyReason::StoreUnavailable),
        other => panic!("expected denial, got {:?}", other),
    }
}
