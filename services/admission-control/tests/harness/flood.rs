// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Concurrent request floods against a guard, and a tally of the results.

use admission_control::{
    error::AdmissionError,
    key::RequestContext,
    middleware::{GuardedPolicy, RateGuard},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one flooded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Admitted,
    RateLimited,
    Rejected,
}

/// Counts of outcomes by key.
#[derive(Debug, Default)]
pub struct FloodTally {
    outcomes: HashMap<Outcome, usize>,
    admitted_per_key: HashMap<String, usize>,
    retry_after: Vec<u64>,
    elapsed: Duration,
}

impl FloodTally {
    pub fn record(&mut self, outcome: Outcome, key: Option<&str>) {
        *self.outcomes.entry(outcome).or_insert(0) += 1;
        if let (Outcome::Admitted, Some(key)) = (outcome, key) {
            *self.admitted_per_key.entry(key.to_string()).or_insert(0) += 1;
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.outcomes.values().sum()
    }

    pub fn admitted_for(&self, key: &str) -> usize {
        self.admitted_per_key.get(key).copied().unwrap_or(0)
    }

    pub fn distinct_keys(&self) -> usize {
        self.admitted_per_key.len()
    }

    /// Largest `Retry-After` handed out, in seconds.
    pub fn max_retry_after(&self) -> Option<u64> {
        self.retry_after.iter().copied().max()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl std::fmt::Display for FloodTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Flood ===")?;
        writeln!(f, "Requests:     {}", self.total())?;
        writeln!(f, "Admitted:     {}", self.count(Outcome::Admitted))?;
        writeln!(f, "Rate limited: {}", self.count(Outcome::RateLimited))?;
        writeln!(f, "Rejected:     {}", self.count(Outcome::Rejected))?;
        writeln!(f, "Keys:         {}", self.distinct_keys())?;
        write!(f, "Elapsed:      {:?}", self.elapsed)
    }
}

/// Fire every context in `requests` at the guard concurrently. Admitted
/// permits are reported with `success`.
pub async fn flood(
    guard: &RateGuard,
    policy: Arc<GuardedPolicy>,
    requests: Vec<RequestContext>,
    success: bool,
) -> FloodTally {
    let started = Instant::now();
    let handles: Vec<_> = requests
        .into_iter()
        .map(|ctx| {
            let guard = guard.clone();
            let policy = Arc::clone(&policy);
            tokio::spawn(async move {
                match guard.guard(&ctx, &policy).await {
                    Ok(permit) => {
                        let key = permit.key().to_string();
                        permit.report(success).await;
                        (Outcome::Admitted, Some(key), None)
                    }
                    Err(AdmissionError::RateLimitExceeded {
                        retry_after_secs, ..
                    }) => (Outcome::RateLimited, None, Some(retry_after_secs)),
                    Err(_) => (Outcome::Rejected, None, None),
                }
            })
        })
        .collect();

    let mut tally = FloodTally::default();
    for handle in handles {
        let (outcome, key, retry_after) = handle.await.expect("flood task panicked");
        tally.record(outcome, key.as_deref());
        tally.retry_after.extend(retry_after);
    }
    tally.elapsed = started.elapsed();
    tally
}

/// `n` requests from the same authenticated user.
pub fn same_user(id: &str, n: usize) -> Vec<RequestContext> {
    (0..n)
        .map(|_| RequestContext {
            identity: Some(id.to_string()),
            origin: None,
        })
        .collect()
}

/// One anonymous request from each of `n` distinct origins.
pub fn distributed_origins(n: usize) -> Vec<RequestContext> {
    (0..n)
        .map(|i| RequestContext {
            identity: None,
            origin: Some(format!("10.0.{}.{}", i / 250, i % 250 + 1).parse().expect("valid ip")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_counts_by_outcome_and_key() {
        let mut tally = FloodTally::default();
        tally.record(Outcome::Admitted, Some("user:1"));
        tally.record(Outcome::Admitted, Some("user:1"));
        tally.record(Outcome::RateLimited, None);

        assert_eq!(tally.total(), 3);
        assert_eq!(tally.count(Outcome::Admitted), 2);
        assert_eq!(tally.admitted_for("user:1"), 2);
        assert_eq!(tally.distinct_keys(), 1);
    }
}
