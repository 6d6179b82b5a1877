//! Fixed window admission control.
//!
//! Each client gets `max_requests` per window. The window starts with the
//! client's first request and ends `window` later; the next request after
//! that opens a new one. A client can therefore land up to twice the quota
//! in a short span straddling a window boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Result, ThrottlerError};
use crate::quota_store::{ClientQuotaRecord, QuotaStore};

/// Extra read/CAS rounds on top of the quota. Every lost race is another
/// request's admission, so a window can only cost `max_requests` retries.
const EXTRA_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    fn window_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Why a decision was made without the quota store's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// The store errored; the request was admitted.
    StoreUnavailable,
    /// Every compare-and-swap round was lost; the request was denied.
    Contended,
}

/// A decision plus how it was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub fallback: Option<Fallback>,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        remaining: u32,
        window_reset_at: DateTime<Utc>,
    },
    Denied {
        window_reset_at: DateTime<Utc>,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allowed { remaining, .. } => *remaining,
            Decision::Denied { .. } => 0,
        }
    }

    pub fn window_reset_at(&self) -> DateTime<Utc> {
        match self {
            Decision::Allowed {
                window_reset_at, ..
            }
            | Decision::Denied { window_reset_at } => *window_reset_at,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    store: Arc<dyn QuotaStore>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, store: Arc<dyn QuotaStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    /// Count one request from `identity` against its quota.
    pub async fn evaluate(&self, identity: &str) -> Decision {
        self.evaluate_at(identity, Utc::now()).await
    }

    /// Same as [`evaluate`](Self::evaluate) with an explicit clock reading.
    pub async fn evaluate_at(&self, identity: &str, now: DateTime<Utc>) -> Decision {
        self.assess_at(identity, now).await.decision
    }

    /// Evaluate and report whether the decision had to fall back.
    ///
    /// Store failures admit the request. Losing every compare-and-swap
    /// round denies it instead, so contention never over-admits.
    pub async fn assess_at(&self, identity: &str, now: DateTime<Utc>) -> Evaluation {
        match self.try_evaluate_at(identity, now).await {
            Ok(decision) => Evaluation {
                decision,
                fallback: None,
            },
            Err(ThrottlerError::Contention {
                window_reset_at, ..
            }) => {
                warn!(identity, "Quota record contended, denying request");
                Evaluation {
                    decision: Decision::Denied { window_reset_at },
                    fallback: Some(Fallback::Contended),
                }
            }
            Err(err) => {
                warn!(identity, error = %err, "Quota store failed, admitting request");
                Evaluation {
                    decision: Decision::Allowed {
                        remaining: self.policy.max_requests.saturating_sub(1),
                        window_reset_at: self.policy.window_end(now),
                    },
                    fallback: Some(Fallback::StoreUnavailable),
                }
            }
        }
    }

    pub async fn try_evaluate_at(&self, identity: &str, now: DateTime<Utc>) -> Result<Decision> {
        let max = self.policy.max_requests;

        let attempts = max as usize + EXTRA_CAS_ATTEMPTS;
        let mut last_reset_at = self.policy.window_end(now);
        for _ in 0..attempts {
            let current = self.store.get(identity).await?;

            let (next, decision) = match current {
                Some(record) if !record.is_expired(now) => {
                    if record.count >= max {
                        debug!(identity, reset_at = %record.window_reset_at, "Quota exhausted");
                        return Ok(Decision::Denied {
                            window_reset_at: record.window_reset_at,
                        });
                    }
                    let next = ClientQuotaRecord::new(record.count + 1, record.window_reset_at);
                    let decision = Decision::Allowed {
                        remaining: max - next.count,
                        window_reset_at: next.window_reset_at,
                    };
                    (next, decision)
                }
                _ => {
                    let next = ClientQuotaRecord::new(1, self.policy.window_end(now));
                    let decision = Decision::Allowed {
                        remaining: max.saturating_sub(1),
                        window_reset_at: next.window_reset_at,
                    };
                    (next, decision)
                }
            };
            last_reset_at = next.window_reset_at;

            if self
                .store
                .compare_and_swap(identity, current.as_ref(), next, now)
                .await?
            {
                debug!(identity, count = next.count, remaining = decision.remaining(), "Request admitted");
                return Ok(decision);
            }
        }

        Err(ThrottlerError::Contention {
            identity: identity.to_string(),
            window_reset_at: last_reset_at,
        })
    }

    /// Drop quota records whose window has ended.
    pub async fn sweep(&self) -> Result<usize> {
        self.store.sweep(Utc::now()).await
    }
}
