#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # gatekeep
//!
//! Admission control for HTTP services: per-IP and per-API-key request budgets
//! over a fixed window, with a block cooldown once a budget is spent. State
//! lives in a shared [`LimiterStore`] so many server processes enforce the same
//! budgets.
//!
//! ## Features
//!
//! - **Three identity modes**: client address only, API key only, or API key with
//!   address fallback
//! - **Race-free counting** via compare-and-persist at the store boundary
//! - **Distinct store failures** so callers pick fail-open or fail-closed
//! - **Tower middleware** mapping verdicts to 429 / 400 / 500 responses
//!
//! ## Quick Start
//!
//! ```rust
//! use gatekeep::{IdentityMode, InMemoryStore, Limiter, LimiterConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LimiterConfig::new(IdentityMode::IpOnly, 2, Duration::from_secs(10)).unwrap();
//!     let limiter = Limiter::new(config, Arc::new(InMemoryStore::new()));
//!
//!     assert!(limiter.allow_request("203.0.113.7", "").await.is_ok());
//!     assert!(limiter.allow_request("203.0.113.7", "").await.is_ok());
//!     let denied = limiter.allow_request("203.0.113.7", "").await.unwrap_err();
//!     assert!(denied.is_budget_exceeded());
//! }
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod model;
pub mod prelude;
pub mod store;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{IdentityMode, LimiterConfig};
pub use engine::{AdmissionControl, Limiter};
pub use error::{ConfigError, LimitError, StoreError};
pub use middleware::{AdmissionLayer, AdmissionService, StoreFailurePolicy};
pub use model::{Admission, ApiKeyPolicy, Identity, UsageRecord};
pub use store::{InMemoryStore, LimiterStore};
