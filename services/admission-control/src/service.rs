// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! RSVP orchestration over the host application's record store.
//!
//! The record store must return reads that reflect every write this
//! service has already completed. Capacity is recomputed from it on every
//! call. Reads only inform the decision: every `going` grant on a capped
//! event is written through [`RsvpStore::admit_within_capacity`], which the
//! store performs as one conditional write, so concurrent RSVPs and
//! promotions cannot overfill an event.

use crate::error::{AdmissionError, Result};
use crate::metrics::AdmissionMetrics;
use crate::rsvp::{
    check_admissible, decide_status, select_promotion, EventSnapshot, RequestedStatus,
    RsvpRecord, RsvpStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Insert-or-replace request for one attendee's RSVP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsvpWrite {
    pub event_id: String,
    pub attendee_id: String,
    pub status: RsvpStatus,
    pub registered_at: DateTime<Utc>,
}

/// Record store for events and RSVPs, owned by the host application.
#[async_trait]
pub trait RsvpStore: Send + Sync {
    async fn get_event(&self, event_id: &str) -> Result<Option<EventSnapshot>>;

    async fn find_rsvp(&self, event_id: &str, attendee_id: &str) -> Result<Option<RsvpRecord>>;

    /// Attendees currently `going`, optionally leaving one out.
    async fn query_going_count(&self, event_id: &str, exclude_attendee_id: Option<&str>)
        -> Result<u32>;

    /// Waitlisted records for the event, in any order.
    async fn query_waitlist(&self, event_id: &str) -> Result<Vec<RsvpRecord>>;

    /// Upsert keyed on (event, attendee). An existing record keeps its id.
    async fn create_or_update_rsvp(&self, write: RsvpWrite) -> Result<RsvpRecord>;

    /// Upsert `write` as `going` if fewer than `capacity` other attendees
    /// are going, otherwise as `waitlisted`. The count and the write must be
    /// atomic with respect to every other write for the event (a
    /// transaction or conditional update in the backing store).
    async fn admit_within_capacity(&self, write: RsvpWrite, capacity: u32) -> Result<RsvpRecord>;

    /// Remove and return the attendee's record, if any.
    async fn delete_rsvp(&self, event_id: &str, attendee_id: &str) -> Result<Option<RsvpRecord>>;
}

/// Result of an RSVP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsvpOutcome {
    pub record: RsvpRecord,
    pub previous: Option<RsvpStatus>,
    /// Attendee promoted because this RSVP gave up a `going` place
    pub promoted: Option<String>,
}

impl RsvpOutcome {
    /// Whether the attendee ended up on the waitlist.
    pub fn was_waitlisted(&self) -> bool {
        self.record.status == RsvpStatus::Waitlisted
    }
}

/// Result of a cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub removed: Option<RsvpRecord>,
    pub promoted: Option<String>,
}

/// Capacity admission and waitlist promotion for events.
pub struct RsvpService<S: ?Sized> {
    store: Arc<S>,
    metrics: Option<Arc<AdmissionMetrics>>,
}

impl<S: RsvpStore + ?Sized> RsvpService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AdmissionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn load_event(&self, event_id: &str) -> Result<EventSnapshot> {
        self.store
            .get_event(event_id)
            .await?
            .ok_or_else(|| AdmissionError::EventNotFound(event_id.to_string()))
    }

    /// Status `attendee_id` would be granted for `requested` at `now`.
    pub async fn decide_rsvp_status(
        &self,
        event: &EventSnapshot,
        attendee_id: &str,
        requested: RequestedStatus,
        now: DateTime<Utc>,
    ) -> Result<RsvpStatus> {
        check_admissible(event, now)?;

        if requested != RequestedStatus::Going || event.capacity.is_none() {
            return Ok(requested.into());
        }

        let going = self
            .store
            .query_going_count(&event.id, Some(attendee_id))
            .await?;
        let granted = decide_status(event, requested, going);
        debug!(
            event_id = %event.id,
            attendee_id,
            going,
            capacity = ?event.capacity,
            granted = ?granted,
            "Capacity decision"
        );
        Ok(granted)
    }

    /// Record an RSVP, granting `waitlisted` instead of `going` when full.
    pub async fn rsvp(
        &self,
        event_id: &str,
        attendee_id: &str,
        requested: RequestedStatus,
        now: DateTime<Utc>,
    ) -> Result<RsvpOutcome> {
        let event = self.load_event(event_id).await?;
        let status = self
            .decide_rsvp_status(&event, attendee_id, requested, now)
            .await?;

        let existing = self.store.find_rsvp(event_id, attendee_id).await?;
        let previous = existing.as_ref().map(|r| r.status);
        let registered_at = existing.map_or(now, |r| r.registered_at);

        let write = RsvpWrite {
            event_id: event_id.to_string(),
            attendee_id: attendee_id.to_string(),
            status,
            registered_at,
        };
        let record = self.persist(&event, write).await?;
        if status == RsvpStatus::Going && record.status != RsvpStatus::Going {
            debug!(event_id, attendee_id, "Place taken concurrently, granted waitlist instead");
        }

        if record.status == RsvpStatus::Waitlisted && previous != Some(RsvpStatus::Waitlisted) {
            info!(event_id, attendee_id, "Event full, attendee waitlisted");
        }

        let promoted = if previous == Some(RsvpStatus::Going) && record.status != RsvpStatus::Going {
            self.promote_best_effort(event_id).await
        } else {
            None
        };

        Ok(RsvpOutcome {
            record,
            previous,
            promoted,
        })
    }

    /// Remove an RSVP. When it held a `going` place the next waitlisted
    /// attendee is promoted; a failed promotion does not fail the
    /// cancellation.
    pub async fn cancel(&self, event_id: &str, attendee_id: &str) -> Result<CancelOutcome> {
        let removed = self.store.delete_rsvp(event_id, attendee_id).await?;

        let promoted = match &removed {
            Some(record) if record.status == RsvpStatus::Going => {
                self.promote_best_effort(event_id).await
            }
            _ => None,
        };

        Ok(CancelOutcome { removed, promoted })
    }

    /// Promote at most one waitlisted attendee if the event has room.
    pub async fn promote_from_waitlist(&self, event_id: &str) -> Result<Option<String>> {
        let event = self.load_event(event_id).await?;
        let going = self.store.query_going_count(event_id, None).await?;
        let waitlist = self.store.query_waitlist(event_id).await?;

        let Some(next) = select_promotion(&event, going, &waitlist) else {
            return Ok(None);
        };

        let write = RsvpWrite {
            event_id: event_id.to_string(),
            attendee_id: next.attendee_id.clone(),
            status: RsvpStatus::Going,
            registered_at: next.registered_at,
        };
        let promoted = self
            .persist(&event, write)
            .await
            .map_err(|e| AdmissionError::PromotionPersistFailure {
                event_id: event_id.to_string(),
                attendee_id: next.attendee_id.clone(),
                reason: e.to_string(),
            })?;

        if promoted.status != RsvpStatus::Going {
            debug!(event_id, attendee_id = %promoted.attendee_id, "Freed place already taken, nothing promoted");
            return Ok(None);
        }

        info!(event_id, attendee_id = %promoted.attendee_id, "Promoted from waitlist");
        if let Some(metrics) = &self.metrics {
            metrics.record_promotion();
        }
        Ok(Some(promoted.attendee_id))
    }

    /// Write `going` grants on capped events conditionally; everything else
    /// is a plain upsert.
    async fn persist(&self, event: &EventSnapshot, write: RsvpWrite) -> Result<RsvpRecord> {
        match (write.status, event.capacity) {
            (RsvpStatus::Going, Some(capacity)) => {
                self.store.admit_within_capacity(write, capacity).await
            }
            _ => self.store.create_or_update_rsvp(write).await,
        }
    }

    async fn promote_best_effort(&self, event_id: &str) -> Option<String> {
        match self.promote_from_waitlist(event_id).await {
            Ok(promoted) => promoted,
            Err(e) => {
                warn!(event_id, error = %e, "Waitlist promotion failed, left for reconciliation");
                None
            }
        }
    }

    /// Promote until the event is full or the waitlist is empty. Intended
    /// for the read path, to repair promotions that failed earlier.
    pub async fn reconcile(&self, event_id: &str) -> Result<Vec<String>> {
        let budget = self.store.query_waitlist(event_id).await?.len();
        let mut promoted = Vec::new();
        for _ in 0..budget {
            match self.promote_from_waitlist(event_id).await? {
                Some(attendee) => promoted.push(attendee),
                None => break,
            }
        }
        if !promoted.is_empty() {
            info!(event_id, count = promoted.len(), "Reconciled waitlist");
        }
        Ok(promoted)
    }
}
