//! Error types for admission decisions and store access
use std::time::Duration;

/// Why a request was not admitted.
///
/// Every denial carries exactly one of these kinds; the boundary maps them to
/// transport responses (see [`crate::middleware`]).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LimitError {
    /// No usable identity could be derived under the active mode.
    #[error("the provided client is invalid")]
    InvalidIdentity,
    /// API key evaluation was requested but no policy exists for the key.
    #[error("the provided api key was not found")]
    UnknownApiKey,
    /// The identity spent its budget and is (now) cooling down.
    #[error(
        "you have reached the maximum number of requests or actions allowed within a certain time frame"
    )]
    BudgetExceeded {
        /// Time until the block lifts.
        retry_after: Duration,
    },
    /// The shared store could not be read or written.
    #[error("limiter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl LimitError {
    /// Check if no identity could be derived
    pub fn is_invalid_identity(&self) -> bool {
        matches!(self, Self::InvalidIdentity)
    }
    /// Check if the API key has no policy
    pub fn is_unknown_api_key(&self) -> bool {
        matches!(self, Self::UnknownApiKey)
    }
    /// Check if the budget was exhausted
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }
    /// Check if the store failed
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
    /// Remaining block time for `BudgetExceeded`.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::BudgetExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
    /// Borrow the store error if present.
    pub fn as_store_error(&self) -> Option<&StoreError> {
        match self {
            Self::StoreUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures surfaced by a [`crate::store::LimiterStore`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored entry exists but cannot be decoded.
    #[error("corrupt entry at '{key}': {reason}")]
    Corrupt {
        /// Store key holding the bad entry.
        key: String,
        /// What failed to decode.
        reason: String,
    },
    /// Compare-and-persist kept losing races.
    #[error("gave up after {attempts} conflicting writes")]
    Contention {
        /// Number of attempts made.
        attempts: usize,
    },
}

/// Errors produced when validating limiter configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Request budgets must be > 0.
    #[error("max requests must be > 0 (got {provided})")]
    InvalidBudget {
        /// Value provided by caller.
        provided: u32,
    },
    /// The counting window must be > 0.
    #[error("window must be > 0 (got {0:?})")]
    InvalidWindow(Duration),
    /// The block cooldown must be > 0.
    #[error("block duration must be > 0 (got {0:?})")]
    InvalidBlockDuration(Duration),
    /// Conflict retries must be > 0.
    #[error("max conflict retries must be > 0")]
    InvalidConflictRetries,
    /// Identity mode string not recognised.
    #[error("unknown identity mode '{0}' (expected ip, api_key or ip_or_api_key)")]
    UnknownMode(String),
}
