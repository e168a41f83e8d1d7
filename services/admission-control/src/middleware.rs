// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Rate limit guard for protected operations.
//!
//! [`RateGuard::guard`] either rejects a request with
//! [`AdmissionError::RateLimitExceeded`] or hands back a [`Permit`]. The
//! holder runs the operation and reports how it went through
//! [`Permit::report`] so conditional accounting can refund the slot. A
//! permit dropped without a report stays counted.
//!
//! [`enforce`] packages the same flow as axum middleware.

use crate::config::RateLimitConfig;
use crate::error::{AdmissionError, Result};
use crate::key::{IdentityResolver, KeyStrategy, RequestContext};
use crate::limiter::{AdmissionDecision, Policy, WindowLimiter};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Write the rate limit headers. `Retry-After` is only set on denial.
pub fn write_rate_limit_headers(
    headers: &mut HeaderMap,
    limit: u32,
    remaining: u32,
    reset_at: DateTime<Utc>,
    retry_after_secs: Option<u64>,
) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    if let Ok(reset) = HeaderValue::from_str(&reset_at.to_rfc3339_opts(SecondsFormat::Millis, true)) {
        headers.insert(X_RATELIMIT_RESET, reset);
    }
    match retry_after_secs {
        Some(secs) => {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(secs));
        }
        None => {
            headers.remove(axum::http::header::RETRY_AFTER);
        }
    }
}

/// Write the headers describing `decision`.
pub fn write_decision_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    write_rate_limit_headers(
        headers,
        decision.limit,
        decision.remaining,
        decision.reset_at,
        decision.retry_after_seconds,
    );
}

/// A policy together with the way its counter keys are derived.
#[derive(Debug, Clone)]
pub struct GuardedPolicy {
    pub policy: Policy,
    pub strategy: Arc<dyn KeyStrategy>,
}

/// Configured policies by operation class name.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: BTreeMap<String, Arc<GuardedPolicy>>,
}

impl PolicySet {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        let mut policies = BTreeMap::new();
        for (name, raw) in &config.policies {
            let guarded = GuardedPolicy {
                policy: raw.to_policy(name)?,
                strategy: raw.key_strategy.strategy(),
            };
            policies.insert(name.clone(), Arc::new(guarded));
        }
        Ok(Self { policies })
    }

    pub fn insert(&mut self, guarded: GuardedPolicy) {
        self.policies
            .insert(guarded.policy.name().to_string(), Arc::new(guarded));
    }

    pub fn get(&self, name: &str) -> Result<Arc<GuardedPolicy>> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| AdmissionError::UnknownPolicy(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

/// Proof that one request was admitted; consumed by reporting its outcome.
#[derive(Debug)]
#[must_use = "an unreported permit stays counted against quota"]
pub struct Permit {
    limiter: WindowLimiter,
    policy: Policy,
    key: String,
    decision: AdmissionDecision,
}

impl Permit {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn decision(&self) -> &AdmissionDecision {
        &self.decision
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        write_decision_headers(headers, &self.decision);
    }

    /// Report the outcome of the guarded operation. Returns whether the
    /// slot was refunded.
    pub async fn report(self, success: bool) -> bool {
        self.limiter
            .record_outcome(&self.key, &self.policy, success)
            .await
    }
}

/// Admits or rejects protected operations.
#[derive(Debug, Clone)]
pub struct RateGuard {
    limiter: WindowLimiter,
    outcome_timeout: Duration,
}

impl RateGuard {
    pub fn new(limiter: WindowLimiter, outcome_timeout: Duration) -> Self {
        Self {
            limiter,
            outcome_timeout,
        }
    }

    pub fn limiter(&self) -> &WindowLimiter {
        &self.limiter
    }

    /// Check `ctx` against `guarded`, consuming a slot when admitted.
    ///
    /// Requests the strategy cannot key are rejected rather than pooled
    /// under a shared counter.
    pub async fn guard(&self, ctx: &RequestContext, guarded: &GuardedPolicy) -> Result<Permit> {
        let key = guarded.strategy.derive_key(ctx).ok_or_else(|| {
            AdmissionError::InvalidRequest(format!(
                "no identity or client address to rate limit {} by",
                guarded.policy.name()
            ))
        })?;
        let now = self.limiter.store().clock().now();
        let decision = self
            .limiter
            .check_admission(&key, &guarded.policy, now)
            .await;

        if let Some(denied) = decision.clone().into_error(&guarded.policy) {
            return Err(denied);
        }

        Ok(Permit {
            limiter: self.limiter.clone(),
            policy: guarded.policy.clone(),
            key,
            decision,
        })
    }

    /// Run `op` under `permit`, reporting its outcome. An operation that
    /// outlives the outcome timeout is abandoned and accounted as failed;
    /// `None` is returned in that case.
    pub async fn run<T, E>(
        &self,
        permit: Permit,
        op: impl Future<Output = std::result::Result<T, E>>,
    ) -> Option<std::result::Result<T, E>> {
        match tokio::time::timeout(self.outcome_timeout, op).await {
            Ok(result) => {
                permit.report(result.is_ok()).await;
                Some(result)
            }
            Err(_) => {
                warn!(key = %permit.key, policy = %permit.policy.name(), "Guarded operation timed out");
                permit.report(false).await;
                None
            }
        }
    }
}

/// State for the [`enforce`] middleware.
#[derive(Clone)]
pub struct EnforceState {
    pub guard: RateGuard,
    pub policy: Arc<GuardedPolicy>,
    pub resolver: Arc<dyn IdentityResolver>,
}

/// Axum middleware guarding every request routed through it.
///
/// Client and server error statuses count as failed outcomes.
pub async fn enforce(State(state): State<EnforceState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let identity = state
        .resolver
        .resolve(request.headers(), request.extensions());
    let ctx = RequestContext::from_parts(request.headers(), peer, identity);

    let permit = match state.guard.guard(&ctx, &state.policy).await {
        Ok(permit) => permit,
        Err(e) => return e.into_response(),
    };

    let decision = permit.decision().clone();
    let outcome = state
        .guard
        .run(permit, async {
            let response = next.run(request).await;
            let status = response.status();
            if status.is_client_error() || status.is_server_error() {
                Err(response)
            } else {
                Ok(response)
            }
        })
        .await;

    let mut response = match outcome {
        Some(Ok(response)) | Some(Err(response)) => response,
        None => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({
                "code": "OPERATION_TIMEOUT",
                "message": "Guarded operation did not complete in time",
                "statusCode": StatusCode::GATEWAY_TIMEOUT.as_u16(),
            })),
        )
            .into_response(),
    };
    debug!(status = %response.status(), remaining = decision.remaining, "Guarded request finished");
    write_decision_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::key::{IdentityOrOrigin, OriginOnly};
    use crate::store::CounterStore;
    use chrono::TimeZone;

    fn guard_at(start: DateTime<Utc>, timeout: Duration) -> RateGuard {
        let clock = MockClock::new(start);
        let store = Arc::new(CounterStore::new(Arc::new(clock)));
        RateGuard::new(WindowLimiter::new(store), timeout)
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
    }

    fn user(id: &str) -> RequestContext {
        RequestContext {
            identity: Some(id.to_string()),
            origin: None,
        }
    }

    #[test]
    fn test_headers_without_retry_after_when_admitted() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from_static("9"));
        write_rate_limit_headers(&mut headers, 10, 4, start_time(), None);

        assert_eq!(headers["X-RateLimit-Limit"], "10");
        assert_eq!(headers["X-RateLimit-Remaining"], "4");
        assert_eq!(headers["X-RateLimit-Reset"], "2026-07-01T00:00:00.000Z");
        assert!(headers.get("Retry-After").is_none());
    }

    #[tokio::test]
    async fn test_guard_denies_with_structured_error() {
        let guard = guard_at(start_time(), Duration::from_secs(5));
        let guarded = GuardedPolicy {
            policy: Policy::fixed_window("community-creation", 3_600_000, 1).unwrap(),
            strategy: Arc::new(IdentityOrOrigin),
        };

        let permit = guard.guard(&user("42"), &guarded).await.unwrap();
        assert_eq!(permit.key(), "user:42");
        assert_eq!(permit.decision().remaining, 0);
        permit.report(true).await;

        match guard.guard(&user("42"), &guarded).await {
            Err(AdmissionError::RateLimitExceeded { retry_after_secs, .. }) => {
                assert_eq!(retry_after_secs, 3600);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_refunds_failed_success_only_operation() {
        let guard = guard_at(start_time(), Duration::from_secs(5));
        let guarded = GuardedPolicy {
            policy: Policy::new("comment-creation", 60_000, 1, true, false).unwrap(),
            strategy: Arc::new(IdentityOrOrigin),
        };

        let permit = guard.guard(&user("1"), &guarded).await.unwrap();
        let result = guard.run(permit, async { Err::<(), _>("validation failed") }).await;
        assert_eq!(result, Some(Err("validation failed")));

        // Slot came back, so the next attempt is admitted.
        let permit = guard.guard(&user("1"), &guarded).await.unwrap();
        let result = guard.run(permit, async { Ok::<_, ()>(7) }).await;
        assert_eq!(result, Some(Ok(7)));

        assert!(guard.guard(&user("1"), &guarded).await.is_err());
    }

    #[tokio::test]
    async fn test_unreported_permit_stays_counted() {
        let guard = guard_at(start_time(), Duration::from_secs(5));
        let guarded = GuardedPolicy {
            policy: Policy::new("comment-creation", 60_000, 1, true, false).unwrap(),
            strategy: Arc::new(IdentityOrOrigin),
        };

        let permit = guard.guard(&user("1"), &guarded).await.unwrap();
        drop(permit);
        assert!(guard.guard(&user("1"), &guarded).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_operation_accounted_as_failure() {
        let guard = guard_at(start_time(), Duration::from_millis(100));
        let guarded = GuardedPolicy {
            policy: Policy::new("comment-creation", 60_000, 1, true, false).unwrap(),
            strategy: Arc::new(OriginOnly),
        };
        let anon = RequestContext {
            identity: None,
            origin: Some("198.51.100.20".parse().unwrap()),
        };

        let permit = guard.guard(&anon, &guarded).await.unwrap();
        assert_eq!(permit.key(), "ip:198.51.100.20");
        let result = guard
            .run(permit, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ()>(())
            })
            .await;
        assert!(result.is_none());

        assert!(guard.guard(&anon, &guarded).await.is_ok());
    }

    #[tokio::test]
    async fn test_unkeyable_request_rejected_without_counting() {
        let guard = guard_at(start_time(), Duration::from_secs(5));
        let guarded = GuardedPolicy {
            policy: Policy::fixed_window("rsvp", 60_000, 1).unwrap(),
            strategy: Arc::new(IdentityOrOrigin),
        };

        for _ in 0..3 {
            assert!(matches!(
                guard.guard(&RequestContext::default(), &guarded).await,
                Err(AdmissionError::InvalidRequest(_))
            ));
        }
        assert!(guard.limiter().store().is_empty().await);
    }

    #[tokio::test]
    async fn test_policy_set_lookup() {
        let set = PolicySet::from_config(&RateLimitConfig::default()).unwrap();
        assert!(set.get("comment-creation").is_ok());
        assert!(matches!(
            set.get("nope"),
            Err(AdmissionError::UnknownPolicy(name)) if name == "nope"
        ));
        assert_eq!(set.names().count(), 4);
    }
}
