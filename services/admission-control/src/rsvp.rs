// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Event capacity admission and waitlist ordering.
//!
//! Everything here is a pure function of an event and the RSVP records
//! read for it; nothing is cached between calls.

use crate::error::{AdmissionError, NotAdmissibleReason, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Status held by an attendee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RsvpStatus {
    Going,
    Maybe,
    NotGoing,
    Waitlisted,
}

/// Status an attendee may ask for. `Waitlisted` is only ever granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestedStatus {
    Going,
    Maybe,
    NotGoing,
}

impl From<RequestedStatus> for RsvpStatus {
    fn from(requested: RequestedStatus) -> Self {
        match requested {
            RequestedStatus::Going => Self::Going,
            RequestedStatus::Maybe => Self::Maybe,
            RequestedStatus::NotGoing => Self::NotGoing,
        }
    }
}

/// The parts of an event that admission depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub id: String,
    /// `None` means unlimited
    pub capacity: Option<u32>,
    pub published: bool,
    pub registration_deadline: Option<DateTime<Utc>>,
    pub starts_at: DateTime<Utc>,
}

/// One attendee's RSVP for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsvpRecord {
    /// Assigned by the record store, strictly increasing in creation order
    pub id: u64,
    pub event_id: String,
    pub attendee_id: String,
    pub status: RsvpStatus,
    pub registered_at: DateTime<Utc>,
}

/// Reject RSVPs for events that cannot take them at `now`.
pub fn check_admissible(event: &EventSnapshot, now: DateTime<Utc>) -> Result<()> {
    if !event.published {
        return Err(AdmissionError::EventNotAdmissible {
            event_id: event.id.clone(),
            reason: NotAdmissibleReason::Unpublished,
        });
    }
    if let Some(deadline) = event.registration_deadline {
        if now > deadline {
            return Err(AdmissionError::RegistrationClosed {
                event_id: event.id.clone(),
                deadline,
            });
        }
    }
    if now >= event.starts_at {
        return Err(AdmissionError::EventNotAdmissible {
            event_id: event.id.clone(),
            reason: NotAdmissibleReason::AlreadyStarted,
        });
    }
    Ok(())
}

/// Status to grant, given the number of `going` attendees other than the
/// requester.
pub fn decide_status(
    event: &EventSnapshot,
    requested: RequestedStatus,
    going_excluding_requester: u32,
) -> RsvpStatus {
    match (requested, event.capacity) {
        (RequestedStatus::Going, Some(capacity)) if going_excluding_requester >= capacity => {
            RsvpStatus::Waitlisted
        }
        _ => requested.into(),
    }
}

/// Waitlisted record to promote next, if the event has room.
///
/// Earliest `registered_at` wins; equal times fall back to record id.
pub fn select_promotion<'a>(
    event: &EventSnapshot,
    going_count: u32,
    waitlist: &'a [RsvpRecord],
) -> Option<&'a RsvpRecord> {
    if event.capacity.is_some_and(|capacity| going_count >= capacity) {
        return None;
    }
    waitlist
        .iter()
        .filter(|r| r.status == RsvpStatus::Waitlisted)
        .min_by_key(|r| (r.registered_at, r.id))
}

/// Capacity view of one event derived from its RSVP records.
#[derive(Debug, Clone)]
pub struct CapacityPool {
    pub capacity: Option<u32>,
    pub going: BTreeSet<String>,
    /// Waitlisted records, oldest first
    pub waitlist: Vec<RsvpRecord>,
}

impl CapacityPool {
    pub fn from_records<'a>(
        event: &EventSnapshot,
        records: impl IntoIterator<Item = &'a RsvpRecord>,
    ) -> Self {
        let mut going = BTreeSet::new();
        let mut waitlist = Vec::new();
        for record in records.into_iter().filter(|r| r.event_id == event.id) {
            match record.status {
                RsvpStatus::Going => {
                    going.insert(record.attendee_id.clone());
                }
                RsvpStatus::Waitlisted => waitlist.push(record.clone()),
                RsvpStatus::Maybe | RsvpStatus::NotGoing => {}
            }
        }
        waitlist.sort_by_key(|r| (r.registered_at, r.id));

        Self {
            capacity: event.capacity,
            going,
            waitlist,
        }
    }

    pub fn admitted_count(&self) -> u32 {
        self.going.len() as u32
    }

    /// Going count with `attendee`'s own record left out.
    pub fn going_excluding(&self, attendee_id: &str) -> u32 {
        let own = u32::from(self.going.contains(attendee_id));
        self.admitted_count() - own
    }

    pub fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|capacity| self.admitted_count() >= capacity)
    }

    /// Whether the pool respects its capacity.
    pub fn within_capacity(&self) -> bool {
        self.capacity
            .map_or(true, |capacity| self.admitted_count() <= capacity)
    }
}
