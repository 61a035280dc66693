// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event state and delivery.
//!
//! Each device keeps one [`DeviceEventTable`]: per-event-id enable and
//! emission counters. Each client keeps per-event delivery flags and a pair
//! of queues; the error queue is always drained before the normal queue.
//! Emission while an event has no enablers is dropped at the source: the
//! counter does not move and nothing is queued.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Deliver matching events to the client's normal queue.
pub const EVENT_FLAG_QUEUE: u32 = 1 << 0;
/// Deliver matching events to the client's error queue.
pub const EVENT_FLAG_ERROR_QUEUE: u32 = 1 << 1;
/// Wake the client's event waiters without queueing a record.
pub const EVENT_FLAG_NOTIFY_ONLY: u32 = 1 << 2;

/// Ids at or above this base are error events: always accepted by the device
/// counter table even when nothing has enabled them.
pub const EVENT_ID_ERROR_BASE: u64 = 0xF000_0000;

/// Fault address/flags payloads are emitted under this id when the external
/// memory collaborator reports a page fault on an owning device.
pub const EVENT_ID_MEMORY_PAGE_FAULT: u64 = EVENT_ID_ERROR_BASE + 1;

/// Default id for transaction-failure records when the submitter did not
/// configure an error event.
pub const EVENT_ID_TRANSACTION_FAILURE: u64 = EVENT_ID_ERROR_BASE + 2;

/// Default id for periodic-io failure records.
pub const EVENT_ID_PERIODIC_IO_FAILURE: u64 = EVENT_ID_ERROR_BASE + 3;

pub fn is_error_event(event_id: u64) -> bool {
    event_id >= EVENT_ID_ERROR_BASE
}

/// One delivered event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: u64,
    pub counter: u64,
    pub timestamp_ns: u64,
    pub payload: Bytes,
}

/// Per-event flag update, as carried by the event-control command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventControl {
    pub event_id: u64,
    pub flags: u32,
}

// -- Device-side state ---------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct EventState {
    enable_count: i64,
    counter: u64,
}

/// Per-device event table: `event_id → (enable_count, event_counter)`.
#[derive(Default)]
pub struct DeviceEventTable {
    states: Mutex<HashMap<u64, EventState>>,
}

/// Result of bumping an event's enable count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableTransition {
    /// Aggregate moved 0→1; hardware-side delivery should be switched on.
    Enabled,
    /// Aggregate moved 1→0; hardware-side delivery should be switched off.
    Disabled,
    Unchanged,
}

impl DeviceEventTable {
    /// Account one emission. Returns the new strictly-increased counter, or
    /// `None` if the event has no enablers and is not an error event (the
    /// emission is dropped at the source).
    pub fn accept(&self, event_id: u64) -> Option<u64> {
        let mut states = self.states.lock();
        let state = states.entry(event_id).or_default();
        if state.enable_count == 0 && !is_error_event(event_id) {
            return None;
        }
        state.counter += 1;
        Some(state.counter)
    }

    /// Current emission counter for `event_id`.
    pub fn counter(&self, event_id: u64) -> u64 {
        self.states.lock().get(&event_id).map(|s| s.counter).unwrap_or(0)
    }

    /// Bump the enable count by `delta` (±1), reporting aggregate edges.
    pub fn adjust_enable(&self, event_id: u64, delta: i64) -> EnableTransition {
        let mut states = self.states.lock();
        let state = states.entry(event_id).or_default();
        let old = state.enable_count;
        state.enable_count = (old + delta).max(0);
        match (old, state.enable_count) {
            (0, n) if n > 0 => EnableTransition::Enabled,
            (o, 0) if o > 0 => EnableTransition::Disabled,
            _ => EnableTransition::Unchanged,
        }
    }

    /// Reset counters of events that no longer have any enabler. Called when
    /// a client disables its device.
    pub fn reset_disabled(&self) {
        let mut states = self.states.lock();
        for state in states.values_mut() {
            if state.enable_count == 0 {
                state.counter = 0;
            }
        }
    }
}

// -- Client-side queues --------------------------------------------------------

/// Why a dequeue returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueError {
    Empty,
    /// The caller's payload buffer is too small; nothing was popped.
    TooSmall { required: usize },
}

/// A client's normal + error event queues.
#[derive(Default)]
pub struct EventQueues {
    normal: VecDeque<EventRecord>,
    error: VecDeque<EventRecord>,
}

impl EventQueues {
    pub fn push(&mut self, record: EventRecord, to_error: bool) {
        if to_error {
            self.error.push_back(record);
        } else {
            self.normal.push_back(record);
        }
    }

    /// Pop the next event, error queue first. A record whose payload exceeds
    /// `capacity` is left in place and its required size reported, so the
    /// caller can retry with a larger buffer.
    pub fn dequeue(&mut self, capacity: usize) -> Result<EventRecord, DequeueError> {
        let queue = if self.error.is_empty() { &mut self.normal } else { &mut self.error };
        let front = queue.front().ok_or(DequeueError::Empty)?;
        if front.payload.len() > capacity {
            return Err(DequeueError::TooSmall { required: front.payload.len() });
        }
        queue.pop_front().ok_or(DequeueError::Empty)
    }

    pub fn clear(&mut self) {
        self.normal.clear();
        self.error.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.error.is_empty()
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.error.len()
    }
}

/// Decide which queue (if any) a record goes to under the client's `flags`.
/// The error flag wins when both are set. `None` means notify-only or no
/// delivery at all.
pub fn route(flags: u32) -> Option<bool> {
    if flags & EVENT_FLAG_ERROR_QUEUE != 0 {
        return Some(true);
    }
    if flags & EVENT_FLAG_QUEUE != 0 {
        return Some(false);
    }
    None
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
