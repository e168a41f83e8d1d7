// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Prometheus metrics for admission decisions.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

/// Counters exported on the metrics endpoint.
#[derive(Debug, Clone)]
pub struct AdmissionMetrics {
    registry: Registry,
    checks: IntCounterVec,
    refunds: IntCounterVec,
    promotions: IntCounter,
    counter_entries: IntGauge,
}

impl AdmissionMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let checks = IntCounterVec::new(
            Opts::new("admission_checks_total", "Rate limit checks by outcome"),
            &["policy", "outcome"],
        )?;
        let refunds = IntCounterVec::new(
            Opts::new(
                "admission_refunds_total",
                "Slots returned by conditional accounting",
            ),
            &["policy"],
        )?;
        let promotions = IntCounter::new(
            "waitlist_promotions_total",
            "Attendees promoted from an event waitlist",
        )?;
        let counter_entries = IntGauge::new(
            "admission_counter_entries",
            "Entries held by the rate limit counter store",
        )?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(refunds.clone()))?;
        registry.register(Box::new(promotions.clone()))?;
        registry.register(Box::new(counter_entries.clone()))?;

        Ok(Self {
            registry,
            checks,
            refunds,
            promotions,
            counter_entries,
        })
    }

    pub fn record_check(&self, policy: &str, admitted: bool) {
        let outcome = if admitted { "admitted" } else { "denied" };
        self.checks.with_label_values(&[policy, outcome]).inc();
    }

    pub fn record_refund(&self, policy: &str) {
        self.refunds.with_label_values(&[policy]).inc();
    }

    pub fn record_promotion(&self) {
        self.promotions.inc();
    }

    pub fn set_counter_entries(&self, entries: usize) {
        self.counter_entries.set(entries as i64);
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
