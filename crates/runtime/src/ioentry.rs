// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed register-access programs and their executor.
//!
//! An io-entry program is a linear list of [`IoEntry`] instructions run
//! against one device's [`RegisterIo`] capability. Read results are written
//! back into the entries themselves (the caller's mirror), so a synchronous
//! register-io command returns the updated program and a transaction embeds
//! the results in its completion event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ErrorCode;
use crate::hal::{DeviceOps, RegisterIo};

/// Hard cap on entries per program.
pub const MAX_IO_ENTRIES: usize = 4096;

/// Hard cap on a single batch transfer, in bytes.
pub const MAX_BATCH_SIZE: usize = 8192;

/// Interval between reads while polling.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// One register-access instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IoEntry {
    /// Read one value at `offset`; the result lands in `val`.
    Read {
        offset: u64,
        #[serde(default)]
        val: u64,
    },
    /// Write `val` at `offset`.
    Write { offset: u64, val: u64 },
    /// Read-modify-write: only bits under `mask` take `val`.
    Modify { offset: u64, mask: u64, val: u64 },
    /// Read `size` bytes at `offset`; the result lands in `buf`.
    ReadBatch {
        offset: u64,
        size: usize,
        #[serde(default)]
        buf: Vec<u8>,
    },
    /// Write `buf` at `offset`.
    WriteBatch { offset: u64, buf: Vec<u8> },
    /// Read `offset` until `(value & mask) == val`, failing after `timeout_ms`.
    Poll { offset: u64, mask: u64, val: u64, timeout_ms: u64 },
    /// Read `offset` once; fail unless `(value & mask) == expected`.
    ReadAssert { offset: u64, mask: u64, expected: u64 },
}

/// How an executor run ended when no access failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Done,
    /// A cancellation was observed between entries; remaining entries were
    /// not run.
    Cancelled,
}

/// Structured read result extracted from an executed program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IoResult {
    Value { offset: u64, value: u64 },
    Block { offset: u64, data: Vec<u8> },
}

/// Validate a user-supplied program before deep-copying it.
///
/// Every user-supplied length is untrusted: the total allocation size is
/// checked with saturating-free arithmetic before anything is copied.
pub fn validate_entries(entries: &[IoEntry]) -> Result<(), ErrorCode> {
    if entries.len() > MAX_IO_ENTRIES {
        return Err(ErrorCode::InvalidArg);
    }
    entries
        .len()
        .checked_mul(std::mem::size_of::<IoEntry>())
        .ok_or(ErrorCode::Overflow)?;
    for entry in entries {
        match entry {
            IoEntry::ReadBatch { size, .. } => {
                if *size == 0 || *size > MAX_BATCH_SIZE {
                    return Err(ErrorCode::Overflow);
                }
            }
            IoEntry::WriteBatch { buf, .. } => {
                if buf.is_empty() || buf.len() > MAX_BATCH_SIZE {
                    return Err(ErrorCode::Overflow);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Run `entries` in order against `io`.
///
/// Stops at the first failing access and returns its error; earlier side
/// effects on the device remain. The exit barrier is invoked on every path.
/// If `cancel` is set between entries the run stops with
/// [`ExecStatus::Cancelled`] after finishing the current entry.
pub async fn execute_io_entries(
    io: &dyn RegisterIo,
    ops: Option<&dyn DeviceOps>,
    entries: &mut [IoEntry],
    cancel: Option<&AtomicBool>,
) -> Result<ExecStatus, ErrorCode> {
    if let Some(ops) = ops {
        ops.io_barrier(false, true);
    }
    let result = run_entries(io, entries, cancel).await;
    if let Some(ops) = ops {
        ops.io_barrier(true, false);
    }
    result
}

async fn run_entries(
    io: &dyn RegisterIo,
    entries: &mut [IoEntry],
    cancel: Option<&AtomicBool>,
) -> Result<ExecStatus, ErrorCode> {
    let native = io.native_size();
    for entry in entries.iter_mut() {
        if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
            return Ok(ExecStatus::Cancelled);
        }
        match entry {
            IoEntry::Read { offset, val } => {
                *val = io.read(*offset, native).await?;
            }
            IoEntry::Write { offset, val } => {
                io.write(*offset, *val, native).await?;
            }
            IoEntry::Modify { offset, mask, val } => {
                let current = io.read(*offset, native).await?;
                let merged = (current & !*mask) | (*val & *mask);
                io.write(*offset, merged, native).await?;
            }
            IoEntry::ReadBatch { offset, size, buf } => {
                buf.resize(*size, 0);
                io.read_block(*offset, buf).await?;
            }
            IoEntry::WriteBatch { offset, buf } => {
                io.write_block(*offset, buf).await?;
            }
            IoEntry::Poll { offset, mask, val, timeout_ms } => {
                poll_register(io, native, *offset, *mask, *val, *timeout_ms).await?;
            }
            IoEntry::ReadAssert { offset, mask, expected } => {
                let value = io.read(*offset, native).await?;
                if (value & *mask) != *expected {
                    return Err(ErrorCode::InvalidArg);
                }
            }
        }
    }
    Ok(ExecStatus::Done)
}

async fn poll_register(
    io: &dyn RegisterIo,
    native: crate::hal::AccessSize,
    offset: u64,
    mask: u64,
    val: u64,
    timeout_ms: u64,
) -> Result<(), ErrorCode> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let value = io.read(offset, native).await?;
        if (value & mask) == val {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ErrorCode::Timeout);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Pull the read results out of an executed program.
pub fn collect_read_results(entries: &[IoEntry]) -> Vec<IoResult> {
    let mut results = Vec::new();
    for entry in entries {
        match entry {
            IoEntry::Read { offset, val } => {
                results.push(IoResult::Value { offset: *offset, value: *val });
            }
            IoEntry::ReadBatch { offset, buf, .. } => {
                results.push(IoResult::Block { offset: *offset, data: buf.clone() });
            }
            _ => {}
        }
    }
    results
}

#[cfg(test)]
#[path = "ioentry_tests.rs"]
mod tests;
