// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trigger conditions: boolean combinations of event and fence predicates.
//!
//! The types here are pure state; parsing a condition against a client's
//! tables (weak-record registration, placeholder-fence creation, fence
//! attachment) happens in the transaction layer. [`TriggerProgress`] is the
//! per-transaction readiness machine. Its outcome is three-valued: a fence
//! error makes a transaction "ready to cancel", which is not the same thing
//! as ready to run.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Maximum predicates in one condition.
pub const TRIGGER_NODES_MAX: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOp {
    /// No predicates: the transaction runs at submit.
    None,
    /// Every node must fire ok; any fence error cancels.
    And,
    /// First ok firing wins; exhaustion with no ok cancels.
    Or,
}

/// One predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerNode {
    /// Fires when the device emits `event_id` with this exact counter value.
    /// `counter == 0` matches any emission of the id.
    Event { event_id: u64, counter: u64 },
    /// Fires when the fence behind `fd` signals.
    Fence { fd: u32 },
    /// Ask the runtime to create a fresh fence at submit and wait on it; the
    /// new fd is reported back in the submit result.
    NewFence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub op: TriggerOp,
    #[serde(default)]
    pub nodes: Vec<TriggerNode>,
}

impl TriggerCondition {
    /// A condition that is satisfied at submit time.
    pub fn immediate() -> Self {
        Self { op: TriggerOp::None, nodes: Vec::new() }
    }

    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.nodes.len() > TRIGGER_NODES_MAX {
            return Err(ErrorCode::InvalidArg);
        }
        match self.op {
            TriggerOp::None if !self.nodes.is_empty() => Err(ErrorCode::InvalidArg),
            TriggerOp::And | TriggerOp::Or if self.nodes.is_empty() => Err(ErrorCode::InvalidArg),
            _ => Ok(()),
        }
    }
}

impl Default for TriggerCondition {
    fn default() -> Self {
        Self::immediate()
    }
}

/// What a transaction should do after a predicate fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Run,
    /// Ready to cancel with the given fence error status.
    Cancel(i32),
}

/// Per-transaction firing tally.
#[derive(Debug, Clone)]
pub struct TriggerProgress {
    op: TriggerOp,
    total: usize,
    signaled: usize,
    any_ok: bool,
    last_err: i32,
}

impl TriggerProgress {
    pub fn new(op: TriggerOp, total: usize) -> Self {
        Self { op, total, signaled: 0, any_ok: false, last_err: 0 }
    }

    /// A node fired successfully (event match, or fence signaled with 0).
    pub fn note_ok(&mut self) -> Readiness {
        self.signaled += 1;
        self.any_ok = true;
        self.readiness()
    }

    /// A fence node signaled with a non-zero status.
    pub fn note_err(&mut self, status: i32) -> Readiness {
        match self.op {
            // Under AND a single failure is terminal, whatever the tally.
            TriggerOp::And | TriggerOp::None => Readiness::Cancel(status),
            TriggerOp::Or => {
                self.signaled += 1;
                self.last_err = status;
                if self.signaled >= self.total && !self.any_ok {
                    Readiness::Cancel(status)
                } else {
                    Readiness::Pending
                }
            }
        }
    }

    pub fn readiness(&self) -> Readiness {
        match self.op {
            TriggerOp::None => Readiness::Run,
            TriggerOp::And => {
                if self.signaled >= self.total {
                    Readiness::Run
                } else {
                    Readiness::Pending
                }
            }
            TriggerOp::Or => {
                if self.any_ok {
                    Readiness::Run
                } else if self.signaled >= self.total {
                    Readiness::Cancel(self.last_err)
                } else {
                    Readiness::Pending
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "trigger_tests.rs"]
mod tests;
