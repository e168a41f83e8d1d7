// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Admission Control
//!
//! Decides whether an action may proceed now against a bounded resource:
//!
//! - Per-key fixed-window rate limiting for write endpoints, with
//!   conditional (success-only / failure-only) accounting
//! - Identity-or-origin key derivation with separate namespaces
//! - Standard `X-RateLimit-*` / `Retry-After` response metadata
//! - Event RSVP capacity admission with a FIFO waitlist
//! - Deterministic waitlist promotion when a place frees up

pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod key;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod rsvp;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{AdmissionError, Result};
pub use limiter::{AdmissionDecision, Policy, WindowLimiter};
pub use middleware::{enforce, Permit, RateGuard};
pub use rsvp::{EventSnapshot, RequestedStatus, RsvpRecord, RsvpStatus};
pub use service::{RsvpService, RsvpStore};
pub use store::CounterStore;
