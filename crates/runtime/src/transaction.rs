// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transactions: deferred io-entry programs with trigger and completion
//! metadata.
//!
//! A submitted transaction is owned by exactly one place at a time: the
//! client's waiting table while its trigger is open, then the process queue
//! (by id), then the executing drain call. Event buckets and fences only ever
//! hold its id; the weak-record scheme keeps the fence/transaction graph
//! acyclic. The orchestration (submit, cancel, firing dispatch) lives on
//! [`Client`](crate::client::Client); this module is the data model.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ioentry::{IoEntry, IoResult};
use crate::trigger::{TriggerCondition, TriggerProgress};
use crate::TxnId;

/// Status a transaction's completion fences receive when it is cancelled
/// before (or during) execution.
pub const TXN_CANCELED_STATUS: i32 = -125;

/// User-facing submit descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    #[serde(default)]
    pub trigger: TriggerCondition,
    pub entries: Vec<IoEntry>,
    /// Event emitted with the response payload on success.
    #[serde(default)]
    pub emit_success_event_id: Option<u64>,
    /// Event emitted with the response payload on failure or cancellation.
    #[serde(default)]
    pub emit_error_event_id: Option<u64>,
    /// Pre-existing fences to signal with the final status.
    #[serde(default)]
    pub completion_fence_fds: Vec<u32>,
    /// Ask the runtime to create one more completion fence and return its fd.
    #[serde(default)]
    pub create_completion_fence: bool,
}

/// What submit hands back to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub id: TxnId,
    /// Fds of fences created for `NewFence` trigger nodes, in node order.
    #[serde(default)]
    pub trigger_fence_fds: Vec<u32>,
    #[serde(default)]
    pub completion_fence_fd: Option<u32>,
}

/// Response payload embedded in completion events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: TxnId,
    /// 0 on success, negative errno otherwise.
    pub ret: i32,
    #[serde(default)]
    pub results: Vec<IoResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Waiting,
    Queued,
    Running,
}

/// Kernel-side transaction state.
pub struct Transaction {
    pub id: TxnId,
    pub entries: Vec<IoEntry>,
    pub progress: TriggerProgress,
    pub phase: TxnPhase,
    pub emit_success_event_id: Option<u64>,
    pub emit_error_event_id: Option<u64>,
    pub completion_fence_fds: Vec<u32>,
    /// Fence error that moved this transaction to the cleanup queue.
    pub cancel_status: Option<i32>,
    /// `(event_id, counter)` trigger nodes registered as weak records.
    pub event_nodes: Vec<(u64, u64)>,
    /// Trigger fences this transaction is attached to.
    pub trigger_fence_fds: Vec<u32>,
}

/// Non-owning registration of a transaction on one trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakRecord {
    pub txn_id: TxnId,
    /// Counter the event must reach, 0 for any emission.
    pub counter: u64,
}

impl WeakRecord {
    pub fn matches(&self, counter: u64) -> bool {
        self.counter == 0 || self.counter == counter
    }
}

/// A transaction currently inside the executor.
pub struct RunningTxn {
    pub id: TxnId,
    pub cancel: Arc<AtomicBool>,
}

/// Per-client transaction bookkeeping. Guarded by the client's short
/// transaction lock; never held across an await.
#[derive(Default)]
pub struct TxnTable {
    next_id: TxnId,
    /// Strong ownership of trigger-pending transactions.
    pub waiting: HashMap<TxnId, Transaction>,
    /// Weak records per trigger event id.
    pub event_buckets: HashMap<u64, Vec<WeakRecord>>,
    /// Ready transactions in submit order.
    pub process_queue: VecDeque<TxnId>,
    /// Cancelled transactions awaiting error emission and fence signaling.
    pub cleanup_queue: VecDeque<Transaction>,
    pub running: Option<RunningTxn>,
}

impl TxnTable {
    /// Ids come from a per-client monotonically increasing counter.
    pub fn alloc_id(&mut self) -> TxnId {
        self.next_id += 1;
        self.next_id
    }

    /// Register a weak record for `txn_id` on `event_id`.
    pub fn register_event(&mut self, event_id: u64, txn_id: TxnId, counter: u64) {
        self.event_buckets.entry(event_id).or_default().push(WeakRecord { txn_id, counter });
    }

    /// Remove every weak record belonging to `txn_id`; returns the event ids
    /// whose buckets shrank (for enable-count rollback).
    pub fn unregister_events(&mut self, txn_id: TxnId) -> Vec<u64> {
        let mut touched = Vec::new();
        self.event_buckets.retain(|event_id, bucket| {
            let before = bucket.len();
            bucket.retain(|record| record.txn_id != txn_id);
            for _ in bucket.len()..before {
                touched.push(*event_id);
            }
            !bucket.is_empty()
        });
        touched
    }

    /// Pop weak records in `event_id`'s bucket matching `counter`.
    pub fn take_matching(&mut self, event_id: u64, counter: u64) -> Vec<WeakRecord> {
        let Some(bucket) = self.event_buckets.get_mut(&event_id) else {
            return Vec::new();
        };
        let mut matched = Vec::new();
        bucket.retain(|record| {
            if record.matches(counter) {
                matched.push(*record);
                false
            } else {
                true
            }
        });
        if bucket.is_empty() {
            self.event_buckets.remove(&event_id);
        }
        matched
    }

    /// Transition a waiting transaction to the ready queue.
    pub fn enqueue_ready(&mut self, txn_id: TxnId) {
        if let Some(txn) = self.waiting.get_mut(&txn_id) {
            txn.phase = TxnPhase::Queued;
            self.process_queue.push_back(txn_id);
        }
    }

    /// Pull a cancelled transaction out of the tables onto the cleanup queue.
    pub fn move_to_cleanup(&mut self, txn_id: TxnId, status: i32) {
        if let Some(mut txn) = self.waiting.remove(&txn_id) {
            txn.cancel_status = Some(status);
            self.process_queue.retain(|id| *id != txn_id);
            self.cleanup_queue.push_back(txn);
        }
    }

    /// Ids of waiting transactions registered on `event_id`.
    pub fn ids_on_event(&self, event_id: u64) -> Vec<TxnId> {
        self.event_buckets
            .get(&event_id)
            .map(|bucket| bucket.iter().map(|r| r.txn_id).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "transaction_tests.rs"]
mod tests;
