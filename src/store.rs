//! Shared state contract for the limiter.
//!
//! The engine keeps no state of its own; everything lives behind a
//! [`LimiterStore`] so many processes can enforce one budget. Backends must
//! expire usage records on their own once `time_to_live` elapses, and must
//! report an expired record as absent rather than as a zeroed record.

use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;
use crate::model::{ApiKeyPolicy, UsageRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Storage interface for API key policies and usage records.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Fetch the policy for an API key.
    async fn fetch_policy(&self, id: &str) -> Result<Option<ApiKeyPolicy>, StoreError>;

    /// Fetch the usage record for an identity.
    ///
    /// The returned `time_to_live` is what remains at read time.
    async fn fetch_record(&self, id: &str) -> Result<Option<UsageRecord>, StoreError>;

    /// Upsert a policy. Policies never expire.
    async fn persist_policy(&self, policy: &ApiKeyPolicy) -> Result<(), StoreError>;

    /// Upsert a usage record, expiring it `record.time_to_live` after the write.
    async fn persist_record(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Write `record` only if the stored state still matches `expected`.
    ///
    /// * `expected == None`: succeeds only if no live record exists.
    /// * `expected == Some(prev)`: succeeds only if a live record exists and
    ///   [`UsageRecord::same_state`] holds against `prev`.
    ///
    /// Returns `Ok(true)` if the write happened, `Ok(false)` if a race was
    /// detected (nothing written; re-read and retry).
    async fn compare_and_persist(
        &self,
        expected: Option<&UsageRecord>,
        record: &UsageRecord,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    current_requests: u32,
    blocked: bool,
    expires_at_millis: u64,
}

impl StoredRecord {
    fn to_record(&self, id: &str, now: u64) -> UsageRecord {
        UsageRecord {
            id: id.to_string(),
            current_requests: self.current_requests,
            time_to_live: Duration::from_millis(self.expires_at_millis.saturating_sub(now)),
            blocked: self.blocked,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    policies: HashMap<String, ApiKeyPolicy>,
    records: HashMap<String, StoredRecord>,
}

impl MemoryState {
    /// Live record for `id`, dropping it first if it has expired.
    fn live_record(&mut self, id: &str, now: u64) -> Option<&StoredRecord> {
        let expired = self.records.get(id).is_some_and(|r| r.expires_at_millis <= now);
        if expired {
            self.records.remove(id);
        }
        self.records.get(id)
    }

    fn insert_record(&mut self, record: &UsageRecord, now: u64) {
        let ttl = u64::try_from(record.time_to_live.as_millis()).unwrap_or(u64::MAX);
        self.records.insert(
            record.id.clone(),
            StoredRecord {
                current_requests: record.current_requests,
                blocked: record.blocked,
                expires_at_millis: now.saturating_add(ttl),
            },
        );
    }
}

/// Process-local store with lazy expiry.
///
/// All state sits behind one lock, so compare-and-persist is atomic for every
/// limiter sharing this store. Clones share the same state.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { state: Arc::default(), clock: Arc::new(MonotonicClock::default()) }
    }

    /// Override the clock (useful for deterministic expiry tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of records that have not expired yet.
    pub fn live_records(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock()
            .map(|state| state.records.values().filter(|r| r.expires_at_millis > now).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Unavailable("in-memory store poisoned".into()))
    }
}

#[async_trait]
impl LimiterStore for InMemoryStore {
    async fn fetch_policy(&self, id: &str) -> Result<Option<ApiKeyPolicy>, StoreError> {
        Ok(self.lock()?.policies.get(id).cloned())
    }

    async fn fetch_record(&self, id: &str) -> Result<Option<UsageRecord>, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        Ok(state.live_record(id, now).map(|stored| stored.to_record(id, now)))
    }

    async fn persist_policy(&self, policy: &ApiKeyPolicy) -> Result<(), StoreError> {
        self.lock()?.policies.insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    async fn persist_record(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        self.lock()?.insert_record(record, now);
        Ok(())
    }

    async fn compare_and_persist(
        &self,
        expected: Option<&UsageRecord>,
        record: &UsageRecord,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;

        let matches = match (state.live_record(&record.id, now), expected) {
            (None, None) => true,
            (Some(current), Some(prev)) => current.to_record(&record.id, now).same_state(prev),
            _ => false,
        };
        if !matches {
            return Ok(false); // Race detected
        }

        state.insert_record(record, now);
        Ok(true)
    }
}
