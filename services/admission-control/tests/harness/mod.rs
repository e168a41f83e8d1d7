// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Shared fixtures for the admission-control integration tests.

#![allow(dead_code)]

pub mod flood;
pub mod memory_store;

use admission_control::{
    clock::MockClock,
    limiter::WindowLimiter,
    middleware::{GuardedPolicy, RateGuard},
    rsvp::EventSnapshot,
    store::CounterStore,
    Policy,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

/// Fixed starting instant for every test clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
}

/// Limiter over a fresh store driven by a mock clock.
pub fn limiter_at(start: DateTime<Utc>) -> (WindowLimiter, MockClock) {
    let clock = MockClock::new(start);
    let store = Arc::new(CounterStore::new(Arc::new(clock.clone())));
    (WindowLimiter::new(store), clock)
}

/// Guard with a generous outcome timeout.
pub fn guard_at(start: DateTime<Utc>) -> (RateGuard, MockClock) {
    let (limiter, clock) = limiter_at(start);
    (
        RateGuard::new(limiter, std::time::Duration::from_secs(30)),
        clock,
    )
}

pub fn guarded(policy: Policy, strategy: admission_control::config::KeyStrategyKind) -> GuardedPolicy {
    GuardedPolicy {
        policy,
        strategy: strategy.strategy(),
    }
}

/// Published event starting a week after `t0`, registration open for
/// six days.
pub fn open_event(id: &str, capacity: Option<u32>) -> EventSnapshot {
    EventSnapshot {
        id: id.to_string(),
        capacity,
        published: true,
        registration_deadline: Some(t0() + Duration::days(6)),
        starts_at: t0() + Duration::days(7),
    }
}
