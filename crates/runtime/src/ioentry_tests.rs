// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use yare::parameterized;

use super::{
    collect_read_results, execute_io_entries, validate_entries, ExecStatus, IoEntry, IoResult,
    MAX_BATCH_SIZE, MAX_IO_ENTRIES,
};
use crate::error::ErrorCode;
use crate::hal::mem::MemRegisterIo;
use crate::hal::{AccessSize, DeviceOps, RegisterIo};

fn mem() -> Arc<MemRegisterIo> {
    MemRegisterIo::new()
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let io = mem();
    let mut entries = vec![
        IoEntry::Write { offset: 0x100, val: 0xDEAD },
        IoEntry::Read { offset: 0x100, val: 0 },
    ];
    let status = execute_io_entries(io.as_ref(), None, &mut entries, None).await.unwrap();
    assert_eq!(status, ExecStatus::Done);
    assert!(matches!(entries[1], IoEntry::Read { val: 0xDEAD, .. }));
}

#[tokio::test]
async fn modify_touches_only_masked_bits() {
    let io = mem();
    io.preset(0x40, 0xFFFF_0000, AccessSize::Bits32);
    let mut entries = vec![
        IoEntry::Modify { offset: 0x40, mask: 0x0000_00FF, val: 0x0000_0042 },
        IoEntry::Read { offset: 0x40, val: 0 },
    ];
    execute_io_entries(io.as_ref(), None, &mut entries, None).await.unwrap();
    assert!(matches!(entries[1], IoEntry::Read { val: 0xFFFF_0042, .. }));
}

#[tokio::test]
async fn batch_write_then_batch_read() {
    let io = mem();
    let mut entries = vec![
        IoEntry::WriteBatch { offset: 0x200, buf: vec![0x11, 0x22, 0x33] },
        IoEntry::ReadBatch { offset: 0x200, size: 3, buf: Vec::new() },
    ];
    execute_io_entries(io.as_ref(), None, &mut entries, None).await.unwrap();
    match &entries[1] {
        IoEntry::ReadBatch { buf, .. } => assert_eq!(buf, &[0x11, 0x22, 0x33]),
        other => panic!("unexpected entry {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn poll_succeeds_once_value_matches() {
    let io = mem();
    io.preset(0x8, 0b100, AccessSize::Bits32);
    let mut entries =
        vec![IoEntry::Poll { offset: 0x8, mask: 0b111, val: 0b100, timeout_ms: 10 }];
    let status = execute_io_entries(io.as_ref(), None, &mut entries, None).await.unwrap();
    assert_eq!(status, ExecStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn poll_times_out_when_value_never_matches() {
    let io = mem();
    let mut entries =
        vec![IoEntry::Poll { offset: 0x8, mask: 0xFF, val: 0x55, timeout_ms: 5 }];
    let err = execute_io_entries(io.as_ref(), None, &mut entries, None).await.unwrap_err();
    assert_eq!(err, ErrorCode::Timeout);
}

#[tokio::test]
async fn read_assert_passes_and_fails() {
    let io = mem();
    io.preset(0x0, 0xA5, AccessSize::Bits32);
    let mut ok = vec![IoEntry::ReadAssert { offset: 0x0, mask: 0xFF, expected: 0xA5 }];
    execute_io_entries(io.as_ref(), None, &mut ok, None).await.unwrap();

    let mut bad = vec![IoEntry::ReadAssert { offset: 0x0, mask: 0xFF, expected: 0x5A }];
    let err = execute_io_entries(io.as_ref(), None, &mut bad, None).await.unwrap_err();
    assert_eq!(err, ErrorCode::InvalidArg);
}

#[tokio::test]
async fn stops_at_first_error_keeping_earlier_side_effects() {
    let io = mem();
    let mut entries = vec![
        IoEntry::Write { offset: 0x10, val: 1 },
        IoEntry::ReadAssert { offset: 0x10, mask: 0xFF, expected: 99 },
        IoEntry::Write { offset: 0x20, val: 2 },
    ];
    let err = execute_io_entries(io.as_ref(), None, &mut entries, None).await.unwrap_err();
    assert_eq!(err, ErrorCode::InvalidArg);
    // First write landed, third never ran.
    assert_eq!(io.read(0x10, AccessSize::Bits32).await.unwrap(), 1);
    assert_eq!(io.read(0x20, AccessSize::Bits32).await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_flag_stops_between_entries() {
    let io = mem();
    let cancel = AtomicBool::new(true);
    let mut entries = vec![IoEntry::Write { offset: 0x10, val: 1 }];
    let status =
        execute_io_entries(io.as_ref(), None, &mut entries, Some(&cancel)).await.unwrap();
    assert_eq!(status, ExecStatus::Cancelled);
    assert_eq!(io.read(0x10, AccessSize::Bits32).await.unwrap(), 0);
}

struct BarrierProbe {
    calls: parking_lot::Mutex<Vec<(bool, bool)>>,
}

#[async_trait::async_trait]
impl DeviceOps for BarrierProbe {
    fn io_barrier(&self, read: bool, write: bool) {
        self.calls.lock().push((read, write));
    }
}

#[tokio::test]
async fn barrier_brackets_every_run_including_errors() {
    let io = mem();
    let probe = BarrierProbe { calls: parking_lot::Mutex::new(Vec::new()) };
    let mut entries = vec![IoEntry::ReadAssert { offset: 0, mask: 0xFF, expected: 1 }];
    let _ = execute_io_entries(io.as_ref(), Some(&probe), &mut entries, None).await;
    let calls = probe.calls.lock();
    assert_eq!(*calls, vec![(false, true), (true, false)]);
}

#[parameterized(
    zero_read = { IoEntry::ReadBatch { offset: 0, size: 0, buf: Vec::new() } },
    huge_read = { IoEntry::ReadBatch { offset: 0, size: MAX_BATCH_SIZE + 1, buf: Vec::new() } },
    empty_write = { IoEntry::WriteBatch { offset: 0, buf: Vec::new() } },
    huge_write = { IoEntry::WriteBatch { offset: 0, buf: vec![0; MAX_BATCH_SIZE + 1] } },
)]
fn batch_size_limits_are_enforced(entry: IoEntry) {
    assert_eq!(validate_entries(&[entry]), Err(ErrorCode::Overflow));
}

#[test]
fn entry_count_limit_is_enforced() {
    let entries = vec![IoEntry::Write { offset: 0, val: 0 }; MAX_IO_ENTRIES + 1];
    assert_eq!(validate_entries(&entries), Err(ErrorCode::InvalidArg));
}

#[test]
fn read_results_are_collected_in_program_order() {
    let entries = vec![
        IoEntry::Read { offset: 0x4, val: 9 },
        IoEntry::Write { offset: 0x8, val: 1 },
        IoEntry::ReadBatch { offset: 0x10, size: 2, buf: vec![7, 8] },
    ];
    let results = collect_read_results(&entries);
    assert_eq!(
        results,
        vec![
            IoResult::Value { offset: 0x4, value: 9 },
            IoResult::Block { offset: 0x10, data: vec![7, 8] },
        ]
    );
}

#[tokio::test]
async fn cancel_unset_runs_to_completion() {
    let io = mem();
    let cancel = AtomicBool::new(false);
    let mut entries = vec![
        IoEntry::Write { offset: 0x10, val: 1 },
        IoEntry::Write { offset: 0x14, val: 2 },
    ];
    let status =
        execute_io_entries(io.as_ref(), None, &mut entries, Some(&cancel)).await.unwrap();
    assert_eq!(status, ExecStatus::Done);
    cancel.store(true, Ordering::Release);
    assert_eq!(io.read(0x14, AccessSize::Bits32).await.unwrap(), 2);
}
