// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Fixed-window rate limiter.
//!
//! Each key gets `max_requests` admissions per window. The window opens on
//! the first request for a key and closes `window_ms` later; the next request
//! after that opens a fresh one. Up to twice the limit can therefore pass
//! within a span that straddles two windows. This is the accepted cost of a
//! single counter per key.
//!
//! Conditional accounting refunds a slot after the guarded operation
//! reports its outcome, rather than deferring the increment.

use crate::error::{AdmissionError, Result};
use crate::metrics::AdmissionMetrics;
use crate::store::{window_end, CounterEntry, CounterStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Which outcomes consume quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accounting {
    /// Every admitted request counts
    All,
    /// Failed operations are refunded
    SuccessOnly,
    /// Successful operations are refunded
    FailureOnly,
}

/// Longest window a policy may use: one year.
pub const MAX_WINDOW_MS: u64 = 366 * 24 * 60 * 60 * 1000;

/// Rate limit for one class of protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: String,
    window_ms: u64,
    max_requests: u32,
    accounting: Accounting,
}

impl Policy {
    /// Build a policy from its raw settings.
    ///
    /// Fails when the window or maximum is zero, when the window exceeds
    /// [`MAX_WINDOW_MS`], or when both conditional accounting flags are set.
    pub fn new(
        name: impl Into<String>,
        window_ms: u64,
        max_requests: u32,
        count_success_only: bool,
        count_failure_only: bool,
    ) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: &str| AdmissionError::InvalidPolicy {
            policy: name.clone(),
            reason: reason.to_string(),
        };

        if window_ms == 0 {
            return Err(invalid("window must be greater than zero"));
        }
        if window_ms > MAX_WINDOW_MS {
            return Err(invalid("window must not exceed one year"));
        }
        if max_requests == 0 {
            return Err(invalid("max_requests must be greater than zero"));
        }
        let accounting = match (count_success_only, count_failure_only) {
            (false, false) => Accounting::All,
            (true, false) => Accounting::SuccessOnly,
            (false, true) => Accounting::FailureOnly,
            (true, true) => {
                return Err(invalid(
                    "count_success_only and count_failure_only are mutually exclusive",
                ))
            }
        };

        Ok(Self {
            name,
            window_ms,
            max_requests,
            accounting,
        })
    }

    /// Policy counting every admitted request.
    pub fn fixed_window(name: impl Into<String>, window_ms: u64, max_requests: u32) -> Result<Self> {
        Self::new(name, window_ms, max_requests, false, false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn accounting(&self) -> Accounting {
        self.accounting
    }

    /// Whether an operation with this outcome gives its slot back.
    pub fn refunds(&self, success: bool) -> bool {
        match self.accounting {
            Accounting::All => false,
            Accounting::SuccessOnly => !success,
            Accounting::FailureOnly => success,
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Present only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl AdmissionDecision {
    fn admit(policy: &Policy, entry: &CounterEntry) -> Self {
        Self {
            admitted: true,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(entry.count),
            reset_at: entry.window_end,
            retry_after_seconds: None,
        }
    }

    fn deny(policy: &Policy, entry: &CounterEntry, now: DateTime<Utc>) -> Self {
        Self {
            admitted: false,
            limit: policy.max_requests,
            remaining: 0,
            reset_at: entry.window_end,
            retry_after_seconds: Some(retry_after_secs(entry.window_end, now)),
        }
    }

    /// Convert a denial into the error surfaced to callers.
    pub fn into_error(self, policy: &Policy) -> Option<AdmissionError> {
        if self.admitted {
            return None;
        }
        Some(AdmissionError::RateLimitExceeded {
            policy: policy.name.clone(),
            limit: self.limit,
            retry_after_secs: self.retry_after_seconds.unwrap_or(0),
            reset_at: self.reset_at,
        })
    }
}

/// Whole seconds until `reset_at`, rounded up.
fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let ms = (reset_at - now).num_milliseconds().max(0) as u64;
    ms.div_ceil(1000)
}

/// Store key for `key` under `policy`. Policies share one store, so each
/// gets its own namespace.
pub fn counter_key(policy: &Policy, key: &str) -> String {
    format!("{}/{}", policy.name, key)
}

/// Admission decisions over a shared [`CounterStore`].
#[derive(Debug, Clone)]
pub struct WindowLimiter {
    store: Arc<CounterStore>,
    metrics: Option<Arc<AdmissionMetrics>>,
}

impl WindowLimiter {
    pub fn new(store: Arc<CounterStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AdmissionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// Check and, if admitted, consume one slot for `key`.
    pub async fn check_admission(
        &self,
        key: &str,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let slot = counter_key(policy, key);
        let decision = self
            .store
            .transaction(|txn| {
                let entry = txn.set_or_reset(&slot, now, policy.window_ms);
                if entry.count >= policy.max_requests {
                    return AdmissionDecision::deny(policy, &entry, now);
                }
                match txn.increment(&slot) {
                    Some(counted) => AdmissionDecision::admit(policy, &counted),
                    None => AdmissionDecision::admit(policy, &entry),
                }
            })
            .await;

        if decision.admitted {
            debug!(key, policy = %policy.name, remaining = decision.remaining, "Request admitted");
        } else {
            info!(
                key,
                policy = %policy.name,
                retry_after_secs = decision.retry_after_seconds,
                "Request rate limited"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_check(&policy.name, decision.admitted);
        }
        decision
    }

    /// Report what a check would return, without consuming quota or
    /// opening a window.
    pub async fn status(&self, key: &str, policy: &Policy, now: DateTime<Utc>) -> AdmissionDecision {
        let slot = counter_key(policy, key);
        let entry = self
            .store
            .transaction(|txn| txn.get(&slot, now).cloned())
            .await
            .unwrap_or_else(|| CounterEntry {
                key: slot.clone(),
                count: 0,
                window_start: now,
                window_end: window_end(now, policy.window_ms),
            });

        if entry.count >= policy.max_requests {
            AdmissionDecision::deny(policy, &entry, now)
        } else {
            AdmissionDecision::admit(policy, &entry)
        }
    }

    /// Apply conditional accounting for an admitted request. Returns whether
    /// a slot was given back.
    ///
    /// Call at most once per admitted request. Extra calls cannot push the
    /// count below zero but may refund slots consumed by other requests.
    pub async fn record_outcome(&self, key: &str, policy: &Policy, success: bool) -> bool {
        if !policy.refunds(success) {
            return false;
        }
        let refunded = self.store.decrement(&counter_key(policy, key)).await.is_some();
        if refunded {
            debug!(key, policy = %policy.name, success, "Refunded rate limit slot");
            if let Some(metrics) = &self.metrics {
                metrics.record_refund(&policy.name);
            }
        }
        refunded
    }
}
