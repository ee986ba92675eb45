#![allow(dead_code)]

use async_trait::async_trait;
use gatekeep::{
    ApiKeyPolicy, IdentityMode, InMemoryStore, Limiter, LimiterConfig, LimiterStore, ManualClock,
    StoreError, UsageRecord,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BLOCK: Duration = Duration::from_secs(3);

/// Store wrapper that counts reads and writes.
#[derive(Debug, Clone, Default)]
pub struct RecordingStore {
    pub inner: InMemoryStore,
    pub writes: Arc<AtomicUsize>,
    pub policy_reads: Arc<AtomicUsize>,
    pub record_reads: Arc<AtomicUsize>,
}

impl RecordingStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self { inner, ..Default::default() }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.policy_reads.load(Ordering::SeqCst) + self.record_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LimiterStore for RecordingStore {
    async fn fetch_policy(&self, id: &str) -> Result<Option<ApiKeyPolicy>, StoreError> {
        self.policy_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_policy(id).await
    }

    async fn fetch_record(&self, id: &str) -> Result<Option<UsageRecord>, StoreError> {
        self.record_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_record(id).await
    }

    async fn persist_policy(&self, policy: &ApiKeyPolicy) -> Result<(), StoreError> {
        self.inner.persist_policy(policy).await
    }

    async fn persist_record(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.persist_record(record).await
    }

    async fn compare_and_persist(
        &self,
        expected: Option<&UsageRecord>,
        record: &UsageRecord,
    ) -> Result<bool, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.compare_and_persist(expected, record).await
    }
}

/// Store whose every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreachableStore;

#[async_trait]
impl LimiterStore for UnreachableStore {
    async fn fetch_policy(&self, _id: &str) -> Result<Option<ApiKeyPolicy>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn fetch_record(&self, _id: &str) -> Result<Option<UsageRecord>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn persist_policy(&self, _policy: &ApiKeyPolicy) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn persist_record(&self, _record: &UsageRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn compare_and_persist(
        &self,
        _expected: Option<&UsageRecord>,
        _record: &UsageRecord,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Store that always reports a conflicting write.
#[derive(Debug, Clone, Default)]
pub struct AlwaysConflictingStore {
    pub inner: InMemoryStore,
}

#[async_trait]
impl LimiterStore for AlwaysConflictingStore {
    async fn fetch_policy(&self, id: &str) -> Result<Option<ApiKeyPolicy>, StoreError> {
        self.inner.fetch_policy(id).await
    }

    async fn fetch_record(&self, id: &str) -> Result<Option<UsageRecord>, StoreError> {
        self.inner.fetch_record(id).await
    }

    async fn persist_policy(&self, policy: &ApiKeyPolicy) -> Result<(), StoreError> {
        self.inner.persist_policy(policy).await
    }

    async fn persist_record(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.inner.persist_record(record).await
    }

    async fn compare_and_persist(
        &self,
        _expected: Option<&UsageRecord>,
        _record: &UsageRecord,
    ) -> Result<bool, StoreError> {
        Ok(false)
    }
}

/// Store that reads fine but fails every record write.
#[derive(Debug, Clone, Default)]
pub struct WriteFailingStore {
    pub inner: InMemoryStore,
}

#[async_trait]
impl LimiterStore for WriteFailingStore {
    async fn fetch_policy(&self, id: &str) -> Result<Option<ApiKeyPolicy>, StoreError> {
        self.inner.fetch_policy(id).await
    }

    async fn fetch_record(&self, id: &str) -> Result<Option<UsageRecord>, StoreError> {
        self.inner.fetch_record(id).await
    }

    async fn persist_policy(&self, policy: &ApiKeyPolicy) -> Result<(), StoreError> {
        self.inner.persist_policy(policy).await
    }

    async fn persist_record(&self, _record: &UsageRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("write timed out".into()))
    }

    async fn compare_and_persist(
        &self,
        _expected: Option<&UsageRecord>,
        _record: &UsageRecord,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("write timed out".into()))
    }
}

pub fn config(mode: IdentityMode, max_ip_requests: u32) -> LimiterConfig {
    LimiterConfig::new(mode, max_ip_requests, BLOCK).expect("valid config")
}

/// Limiter over a recording in-memory store driven by a manual clock.
pub fn limiter_with_clock(
    mode: IdentityMode,
    max_ip_requests: u32,
) -> (Limiter<RecordingStore>, RecordingStore, ManualClock) {
    let clock = ManualClock::new();
    let store = RecordingStore::new(InMemoryStore::new().with_clock(clock.clone()));
    let limiter = Limiter::new(config(mode, max_ip_requests), Arc::new(store.clone()));
    (limiter, store, clock)
}
