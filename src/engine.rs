//! Admission decisions: fixed window budget plus block cooldown.
//!
//! For each request the [`Limiter`] picks an identity according to its
//! [`IdentityMode`], then runs one window step against that identity's record:
//!
//! - no record: start a window at 1 and admit;
//! - open record below budget: increment, refresh the window TTL, admit;
//! - open record at budget: mark blocked with the block TTL, deny;
//! - blocked record: deny without writing (store expiry lifts the block).
//!
//! Writes go through [`LimiterStore::compare_and_persist`], so concurrent
//! limiters sharing a store never admit more than the budget between them.

use crate::config::{IdentityMode, LimiterConfig};
use crate::error::{LimitError, StoreError};
use crate::model::{Admission, Identity, UsageRecord};
use crate::store::LimiterStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Core interface between a transport boundary and the admission logic.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Decide whether a request from `client_address` presenting `api_key`
    /// may proceed. Empty strings mean "not supplied".
    async fn allow_request(&self, client_address: &str, api_key: &str)
        -> Result<Admission, LimitError>;
}

/// Next state for one identity, computed from what the store returned.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Admit(UsageRecord),
    Block(UsageRecord),
    AlreadyBlocked { retry_after: Duration },
}

/// Stateless decision engine bound to one policy.
///
/// Cloning is cheap and clones share the store.
#[derive(Debug)]
pub struct Limiter<S: ?Sized> {
    config: LimiterConfig,
    store: Arc<S>,
}

impl<S: ?Sized> Clone for Limiter<S> {
    fn clone(&self) -> Self {
        Self { config: self.config.clone(), store: self.store.clone() }
    }
}

impl<S> Limiter<S>
where
    S: LimiterStore + ?Sized,
{
    /// Create a limiter over a shared store.
    pub fn new(config: LimiterConfig, store: Arc<S>) -> Self {
        Self { config, store }
    }

    /// Policy this limiter enforces.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether the request may proceed.
    ///
    /// # Errors
    /// - [`LimitError::InvalidIdentity`] if the mode needs a client address and none was given.
    /// - [`LimitError::UnknownApiKey`] in API key mode when the key is empty or has no policy.
    /// - [`LimitError::BudgetExceeded`] once the identity's budget is spent.
    /// - [`LimitError::StoreUnavailable`] when the store fails; nothing is retried.
    pub async fn allow_request(
        &self,
        client_address: &str,
        api_key: &str,
    ) -> Result<Admission, LimitError> {
        let (identity, max_requests) = self.resolve(client_address, api_key).await?;
        self.evaluate(identity, max_requests).await
    }

    async fn resolve(
        &self,
        client_address: &str,
        api_key: &str,
    ) -> Result<(Identity, u32), LimitError> {
        match self.config.mode() {
            IdentityMode::IpOnly => self.ip_identity(client_address),
            IdentityMode::ApiKeyOnly => {
                self.api_key_identity(api_key).await?.ok_or(LimitError::UnknownApiKey)
            }
            IdentityMode::IpOrApiKey => match self.api_key_identity(api_key).await? {
                Some(found) => Ok(found),
                None => self.ip_identity(client_address),
            },
        }
    }

    fn ip_identity(&self, client_address: &str) -> Result<(Identity, u32), LimitError> {
        if client_address.is_empty() {
            return Err(LimitError::InvalidIdentity);
        }
        Ok((Identity::Ip(client_address.to_string()), self.config.default_max_requests_for_ip()))
    }

    async fn api_key_identity(&self, api_key: &str) -> Result<Option<(Identity, u32)>, LimitError> {
        if api_key.is_empty() {
            return Ok(None);
        }
        let policy = self.store.fetch_policy(api_key).await?;
        Ok(policy.map(|p| (Identity::ApiKey(api_key.to_string()), p.max_requests)))
    }

    async fn evaluate(&self, identity: Identity, max_requests: u32) -> Result<Admission, LimitError> {
        let attempts = self.config.max_conflict_retries();
        for attempt in 1..=attempts {
            let current = self.store.fetch_record(identity.as_str()).await?;

            let (next, admitted) = match self.plan(identity.as_str(), current.as_ref(), max_requests) {
                Step::AlreadyBlocked { retry_after } => {
                    tracing::debug!(
                        identity = identity.as_str(),
                        kind = identity.kind(),
                        ?retry_after,
                        "request denied: identity blocked"
                    );
                    return Err(LimitError::BudgetExceeded { retry_after });
                }
                Step::Admit(next) => (next, true),
                Step::Block(next) => (next, false),
            };

            if !self.store.compare_and_persist(current.as_ref(), &next).await? {
                tracing::trace!(identity = identity.as_str(), attempt, "usage record changed; retrying");
                continue;
            }

            if !admitted {
                tracing::info!(
                    identity = identity.as_str(),
                    kind = identity.kind(),
                    max = max_requests,
                    block = ?self.config.block_duration(),
                    "budget exceeded; identity blocked"
                );
                return Err(LimitError::BudgetExceeded { retry_after: self.config.block_duration() });
            }

            tracing::debug!(
                identity = identity.as_str(),
                kind = identity.kind(),
                current = next.current_requests,
                max = max_requests,
                "request admitted"
            );
            return Ok(Admission {
                identity,
                current_requests: next.current_requests,
                max_requests,
            });
        }

        tracing::warn!(
            target: "gatekeep::engine",
            identity = identity.as_str(),
            attempts,
            "giving up after repeated write conflicts"
        );
        Err(StoreError::Contention { attempts }.into())
    }

    fn plan(&self, id: &str, current: Option<&UsageRecord>, max_requests: u32) -> Step {
        match current {
            None => Step::Admit(UsageRecord::fresh(id, self.config.window())),
            Some(record) if record.blocked => {
                Step::AlreadyBlocked { retry_after: record.time_to_live }
            }
            // The request that reaches the budget is still admitted.
            Some(record) if record.current_requests < max_requests => Step::Admit(UsageRecord {
                id: id.to_string(),
                current_requests: record.current_requests + 1,
                time_to_live: self.config.window(),
                blocked: false,
            }),
            Some(record) => Step::Block(UsageRecord {
                id: id.to_string(),
                current_requests: record.current_requests,
                time_to_live: self.config.block_duration(),
                blocked: true,
            }),
        }
    }
}

#[async_trait]
impl<S> AdmissionControl for Limiter<S>
where
    S: LimiterStore + ?Sized,
{
    async fn allow_request(
        &self,
        client_address: &str,
        api_key: &str,
    ) -> Result<Admission, LimitError> {
        Limiter::allow_request(self, client_address, api_key).await
    }
}
