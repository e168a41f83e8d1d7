// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! In-memory record store with write-failure injection, and a wrapper whose
//! reads yield to the scheduler so interleavings actually happen.

use admission_control::{
    error::{AdmissionError, Result},
    rsvp::{EventSnapshot, RsvpRecord, RsvpStatus},
    service::{RsvpStore, RsvpWrite},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryRsvpStore {
    events: RwLock<HashMap<String, EventSnapshot>>,
    rsvps: RwLock<HashMap<(String, String), RsvpRecord>>,
    next_id: AtomicU64,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRsvpStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_event(&self, event: EventSnapshot) {
        self.events.write().await.insert(event.id.clone(), event);
    }

    /// Insert a record as-is, bypassing admission. Used to seed state.
    pub async fn seed(&self, event_id: &str, attendee_id: &str, status: RsvpStatus, at: chrono::DateTime<chrono::Utc>) -> RsvpRecord {
        let record = RsvpRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            event_id: event_id.to_string(),
            attendee_id: attendee_id.to_string(),
            status,
            registered_at: at,
        };
        self.rsvps
            .write()
            .await
            .insert((event_id.to_string(), attendee_id.to_string()), record.clone());
        record
    }

    /// Make every subsequent upsert fail until switched back.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn status_of(&self, event_id: &str, attendee_id: &str) -> Option<RsvpStatus> {
        self.rsvps
            .read()
            .await
            .get(&(event_id.to_string(), attendee_id.to_string()))
            .map(|r| r.status)
    }

    pub async fn records(&self, event_id: &str) -> Vec<RsvpRecord> {
        let mut records: Vec<_> = self
            .rsvps
            .read()
            .await
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AdmissionError::Store("injected write failure".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn upsert(&self, rsvps: &mut HashMap<(String, String), RsvpRecord>, write: RsvpWrite) -> RsvpRecord {
        let slot = (write.event_id.clone(), write.attendee_id.clone());
        let id = match rsvps.get(&slot) {
            Some(existing) => existing.id,
            None => self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let record = RsvpRecord {
            id,
            event_id: write.event_id,
            attendee_id: write.attendee_id,
            status: write.status,
            registered_at: write.registered_at,
        };
        rsvps.insert(slot, record.clone());
        record
    }
}

#[async_trait]
impl RsvpStore for MemoryRsvpStore {
    async fn get_event(&self, event_id: &str) -> Result<Option<EventSnapshot>> {
        Ok(self.events.read().await.get(event_id).cloned())
    }

    async fn find_rsvp(&self, event_id: &str, attendee_id: &str) -> Result<Option<RsvpRecord>> {
        Ok(self
            .rsvps
            .read()
            .await
            .get(&(event_id.to_string(), attendee_id.to_string()))
            .cloned())
    }

    async fn query_going_count(&self, event_id: &str, exclude_attendee_id: Option<&str>) -> Result<u32> {
        let count = self
            .rsvps
            .read()
            .await
            .values()
            .filter(|r| r.event_id == event_id && r.status == RsvpStatus::Going)
            .filter(|r| Some(r.attendee_id.as_str()) != exclude_attendee_id)
            .count();
        Ok(count as u32)
    }

    async fn query_waitlist(&self, event_id: &str) -> Result<Vec<RsvpRecord>> {
        Ok(self
            .rsvps
            .read()
            .await
            .values()
            .filter(|r| r.event_id == event_id && r.status == RsvpStatus::Waitlisted)
            .cloned()
            .collect())
    }

    async fn create_or_update_rsvp(&self, write: RsvpWrite) -> Result<RsvpRecord> {
        self.check_writable()?;
        let mut rsvps = self.rsvps.write().await;
        Ok(self.upsert(&mut rsvps, write))
    }

    async fn admit_within_capacity(&self, mut write: RsvpWrite, capacity: u32) -> Result<RsvpRecord> {
        self.check_writable()?;
        // Count and write under one lock.
        let mut rsvps = self.rsvps.write().await;
        let others_going = rsvps
            .values()
            .filter(|r| r.event_id == write.event_id && r.status == RsvpStatus::Going)
            .filter(|r| r.attendee_id != write.attendee_id)
            .count() as u32;
        if others_going >= capacity {
            write.status = RsvpStatus::Waitlisted;
        }
        Ok(self.upsert(&mut rsvps, write))
    }

    async fn delete_rsvp(&self, event_id: &str, attendee_id: &str) -> Result<Option<RsvpRecord>> {
        Ok(self
            .rsvps
            .write()
            .await
            .remove(&(event_id.to_string(), attendee_id.to_string())))
    }
}

/// Delegates to a [`MemoryRsvpStore`], yielding before every read so that
/// concurrent callers interleave between their reads and writes.
#[derive(Debug, Clone)]
pub struct YieldingStore {
    pub inner: Arc<MemoryRsvpStore>,
}

impl YieldingStore {
    pub fn new(inner: Arc<MemoryRsvpStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RsvpStore for YieldingStore {
    async fn get_event(&self, event_id: &str) -> Result<Option<EventSnapshot>> {
        tokio::task::yield_now().await;
        self.inner.get_event(event_id).await
    }

    async fn find_rsvp(&self, event_id: &str, attendee_id: &str) -> Result<Option<RsvpRecord>> {
        tokio::task::yield_now().await;
        self.inner.find_rsvp(event_id, attendee_id).await
    }

    async fn query_going_count(&self, event_id: &str, exclude_attendee_id: Option<&str>) -> Result<u32> {
        let count = self.inner.query_going_count(event_id, exclude_attendee_id).await;
        // The count is now stale for anyone scheduled in between.
        tokio::task::yield_now().await;
        count
    }

    async fn query_waitlist(&self, event_id: &str) -> Result<Vec<RsvpRecord>> {
        let waitlist = self.inner.query_waitlist(event_id).await;
        tokio::task::yield_now().await;
        waitlist
    }

    async fn create_or_update_rsvp(&self, write: RsvpWrite) -> Result<RsvpRecord> {
        self.inner.create_or_update_rsvp(write).await
    }

    async fn admit_within_capacity(&self, write: RsvpWrite, capacity: u32) -> Result<RsvpRecord> {
        self.inner.admit_within_capacity(write, capacity).await
    }

    async fn delete_rsvp(&self, event_id: &str, attendee_id: &str) -> Result<Option<RsvpRecord>> {
        self.inner.delete_rsvp(event_id, attendee_id).await
    }
}
