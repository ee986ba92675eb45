//! Records shared between the engine and its store.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The key a request is counted under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// A client address, budgeted with the default IP limit.
    Ip(String),
    /// An API key, budgeted with its own policy.
    ApiKey(String),
}

impl Identity {
    /// The tracked key.
    pub fn as_str(&self) -> &str {
        match self {
            Identity::Ip(id) | Identity::ApiKey(id) => id,
        }
    }

    /// Static label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Identity::Ip(_) => "ip",
            Identity::ApiKey(_) => "api_key",
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.as_str())
    }
}

/// One identity's state in the current window.
///
/// While `blocked` is set, `time_to_live` is the remaining block time rather
/// than the window length. An absent record means "never seen".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub id: String,
    pub current_requests: u32,
    pub time_to_live: Duration,
    pub blocked: bool,
}

impl UsageRecord {
    /// Record for the first request of a window.
    pub fn fresh(id: impl Into<String>, window: Duration) -> Self {
        Self { id: id.into(), current_requests: 1, time_to_live: window, blocked: false }
    }

    /// Whether two records agree on the fields admission decisions read.
    ///
    /// `id` and `time_to_live` are ignored: the TTL shrinks between read and
    /// write and the id is implied by the store key.
    pub fn same_state(&self, other: &UsageRecord) -> bool {
        self.current_requests == other.current_requests && self.blocked == other.blocked
    }
}

/// Request budget granted to an API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyPolicy {
    pub id: String,
    pub max_requests: u32,
}

impl ApiKeyPolicy {
    /// Create a policy; the budget must be positive.
    pub fn new(id: impl Into<String>, max_requests: u32) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::InvalidBudget { provided: 0 });
        }
        Ok(Self { id: id.into(), max_requests })
    }
}

/// An admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub identity: Identity,
    /// Requests counted in the window, this one included.
    pub current_requests: u32,
    pub max_requests: u32,
}

impl Admission {
    /// Requests left before the identity gets blocked.
    pub fn remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.current_requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_state_ignores_ttl() {
        let a = UsageRecord::fresh("1.2.3.4", Duration::from_secs(1));
        let mut b = a.clone();
        b.time_to_live = Duration::from_millis(10);
        assert!(a.same_state(&b));
        b.blocked = true;
        assert!(!a.same_state(&b));
    }

    #[test]
    fn policy_serializes_with_store_field_names() {
        let policy = ApiKeyPolicy::new("K1", 5).unwrap();
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json, serde_json::json!({ "id": "K1", "maxRequests": 5 }));
        assert!(ApiKeyPolicy::new("K1", 0).is_err());
    }

    #[test]
    fn identity_display_includes_kind() {
        assert_eq!(Identity::ApiKey("K1".into()).to_string(), "api_key:K1");
        assert_eq!(Identity::Ip("10.0.0.1".into()).as_str(), "10.0.0.1");
    }
}
