//! Convenient re-exports for common gatekeep types.
pub use crate::{
    config::{IdentityMode, LimiterConfig},
    engine::{AdmissionControl, Limiter},
    error::{ConfigError, LimitError, StoreError},
    middleware::{AdmissionLayer, StoreFailurePolicy},
    model::{Admission, ApiKeyPolicy, Identity, UsageRecord},
    store::{InMemoryStore, LimiterStore},
};
