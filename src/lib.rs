//! Admission control for a dealership website's public inventory API.
//!
//! Requests under the public API prefix are counted per client in fixed
//! windows and rejected with a 429 once the quota is spent. Quotas live in
//! process memory or in Redis when several instances share the load.

pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod quota_store;
pub mod rate_limiter;
pub mod redis;
pub mod response;
pub mod server;

pub use config::Config;
pub use error::{Result, ThrottlerError};
pub use quota_store::{ClientQuotaRecord, MemoryQuotaStore, QuotaStore};
pub use rate_limiter::{Decision, Evaluation, Fallback, RateLimitPolicy, RateLimiter};
pub use server::create_app;
