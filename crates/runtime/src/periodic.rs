// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic io: self-resubmitting register programs on a fixed period.
//!
//! Entries sharing one period share one timer task; a tick marks every entry
//! of that period pending and hands the work to the client scheduler, so
//! executions ride the same drain path as transactions. An entry never has
//! two outstanding ticks: if an execution is still pending when the next
//! tick lands, that tick is skipped, which keeps consecutive executions at
//! least one period apart.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ioentry::{IoEntry, IoResult};

fn default_batch_size() -> usize {
    1
}

/// User-facing submit descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicIoInfo {
    pub entries: Vec<IoEntry>,
    pub period_ns: u64,
    /// Executions accumulated before one batch event is emitted.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Event carrying each completed batch.
    #[serde(default)]
    pub emit_event_id: Option<u64>,
}

/// Batch payload embedded in the periodic completion event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicBatch {
    pub id: u64,
    /// 0, or the errno of the execution that failed.
    pub ret: i32,
    pub executions: Vec<Vec<IoResult>>,
}

pub struct PeriodicEntry {
    pub id: u64,
    pub entries: Vec<IoEntry>,
    pub period_ns: u64,
    pub batch_size: usize,
    pub emit_event_id: Option<u64>,
    /// A tick is queued or executing; further ticks are skipped until clear.
    pub pending_tick: bool,
    /// Executions accumulated toward the next batch event.
    pub batch: Vec<Vec<IoResult>>,
}

/// One timer task driving every entry of a given period.
pub struct TimerSlot {
    pub cancel: CancellationToken,
    pub refs: usize,
}

/// Per-client periodic bookkeeping, guarded by the client's short lock.
#[derive(Default)]
pub struct PeriodicTable {
    next_id: u64,
    pub entries: HashMap<u64, PeriodicEntry>,
    /// `period_ns → timer`, shared by every entry with that period.
    pub timers: HashMap<u64, TimerSlot>,
    /// Entry ids with a pending tick, in tick order.
    pub tick_queue: VecDeque<u64>,
}

impl PeriodicTable {
    pub fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Mark every idle entry of `period_ns` pending. Returns true if any
    /// work was queued.
    pub fn queue_ticks(&mut self, period_ns: u64) -> bool {
        let mut queued = false;
        for entry in self.entries.values_mut() {
            if entry.period_ns == period_ns && !entry.pending_tick {
                entry.pending_tick = true;
                self.tick_queue.push_back(entry.id);
                queued = true;
            }
        }
        queued
    }

    /// Remove an entry, dropping any queued tick and releasing its timer
    /// slot. Returns the entry (for partial-batch flush) and the timer token
    /// to cancel if this was the period's last user.
    pub fn remove(&mut self, id: u64) -> Option<(PeriodicEntry, Option<CancellationToken>)> {
        let entry = self.entries.remove(&id)?;
        self.tick_queue.retain(|queued| *queued != id);
        let mut last_user = false;
        if let Some(slot) = self.timers.get_mut(&entry.period_ns) {
            slot.refs -= 1;
            last_user = slot.refs == 0;
        }
        let expired = if last_user {
            self.timers.remove(&entry.period_ns).map(|slot| slot.cancel)
        } else {
            None
        };
        Some((entry, expired))
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
#[path = "periodic_tests.rs"]
mod tests;
