// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::{process_chain, Command, CommandOutput};
use crate::client::Client;
use crate::device::DeviceType;
use crate::error::ErrorCode;
use crate::event::{EventControl, EVENT_FLAG_QUEUE};
use crate::hal::mem::MemRegisterIo;
use crate::ioentry::IoEntry;
use crate::state::{ClockSetting, Runtime};
use crate::transaction::TransactionInfo;
use crate::trigger::TriggerCondition;

fn test_setup(kind: DeviceType) -> (Arc<Runtime>, Arc<Client>) {
    let runtime = Runtime::new();
    let reg_io = if kind.is_virtual() {
        None
    } else {
        Some(MemRegisterIo::new() as Arc<dyn crate::hal::RegisterIo>)
    };
    let device =
        runtime.add_device("dev0", kind, reg_io, None, None, Vec::new(), Vec::new(), 0);
    let client = runtime.connect(device.id).unwrap();
    (runtime, client)
}

#[tokio::test]
async fn echo_and_time_round_trip() {
    let (runtime, client) = test_setup(DeviceType::Test);
    let results = process_chain(
        &runtime,
        &client,
        vec![Command::Echo { msg: "ping".to_owned(), log: true }, Command::TimeQuery],
    )
    .await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].ret, 0);
    assert!(matches!(&results[0].output, CommandOutput::Echoed { msg } if msg == "ping"));
    assert!(matches!(results[1].output, CommandOutput::Time { .. }));
}

#[tokio::test]
async fn chain_continues_past_a_failing_packet() {
    let (runtime, client) = test_setup(DeviceType::Test);
    let results = process_chain(
        &runtime,
        &client,
        vec![
            Command::DmaBufferFree { handle: 404 },
            Command::Echo { msg: "still here".to_owned(), log: false },
        ],
    )
    .await;
    assert_eq!(results[0].ret, ErrorCode::NotFound.errno());
    assert_eq!(results[1].ret, 0);
}

#[tokio::test]
async fn reg_io_mirrors_read_results() {
    let (runtime, client) = test_setup(DeviceType::Test);
    let results = process_chain(
        &runtime,
        &client,
        vec![
            Command::DeviceEnable,
            Command::RegIo {
                entries: vec![
                    IoEntry::Write { offset: 0x100, val: 0xDEAD },
                    IoEntry::Read { offset: 0x100, val: 0 },
                ],
            },
        ],
    )
    .await;
    assert_eq!(results[1].ret, 0);
    match &results[1].output {
        CommandOutput::RegIoDone { entries } => {
            assert!(matches!(entries[1], IoEntry::Read { val: 0xDEAD, .. }));
        }
        other => panic!("unexpected output {other:?}"),
    }
}

#[tokio::test]
async fn event_dequeue_reports_required_size_and_retries() {
    let (runtime, client) = test_setup(DeviceType::Test);
    client.event_control_set(&[EventControl { event_id: 8, flags: EVENT_FLAG_QUEUE }]);
    let payload = bytes::Bytes::from(vec![0u8; 1024]);
    client.device.emit_event(8, payload).unwrap();

    let results = process_chain(
        &runtime,
        &client,
        vec![Command::EventDequeue { capacity: 256 }, Command::EventDequeue { capacity: 1024 }],
    )
    .await;

    assert_eq!(results[0].ret, ErrorCode::NoMemory.errno());
    assert!(matches!(results[0].output, CommandOutput::EventSpace { required: 1024 }));

    assert_eq!(results[1].ret, 0);
    match &results[1].output {
        CommandOutput::Event { event_id, counter, payload, .. } => {
            assert_eq!(*event_id, 8);
            assert_eq!(*counter, 1);
            assert_eq!(payload.len(), 1024);
        }
        other => panic!("unexpected output {other:?}"),
    }

    // Queue is drained now.
    let empty = process_chain(&runtime, &client, vec![Command::EventDequeue { capacity: 64 }]).await;
    assert_eq!(empty[0].ret, ErrorCode::NotFound.errno());
}

#[tokio::test]
async fn transaction_submit_returns_id_and_cancel_finds_it() {
    let (runtime, client) = test_setup(DeviceType::Test);
    let info = TransactionInfo {
        trigger: crate::trigger::TriggerCondition {
            op: crate::trigger::TriggerOp::And,
            nodes: vec![crate::trigger::TriggerNode::Event { event_id: 3, counter: 1 }],
        },
        entries: Vec::new(),
        emit_success_event_id: None,
        emit_error_event_id: None,
        completion_fence_fds: Vec::new(),
        create_completion_fence: false,
    };
    let results = process_chain(
        &runtime,
        &client,
        vec![Command::TransactionSubmit { info }],
    )
    .await;
    let id = match &results[0].output {
        CommandOutput::TransactionSubmitted(submitted) => submitted.id,
        other => panic!("unexpected output {other:?}"),
    };

    let results =
        process_chain(&runtime, &client, vec![Command::TransactionCancel { id }]).await;
    assert_eq!(results[0].ret, 0);
    let results =
        process_chain(&runtime, &client, vec![Command::TransactionCancel { id }]).await;
    assert_eq!(results[0].ret, ErrorCode::NotFound.errno());
}

#[tokio::test]
async fn submit_to_virtual_device_reports_not_supported() {
    let (runtime, client) = test_setup(DeviceType::Top);
    let info = TransactionInfo {
        trigger: TriggerCondition::immediate(),
        entries: Vec::new(),
        emit_success_event_id: None,
        emit_error_event_id: None,
        completion_fence_fds: Vec::new(),
        create_completion_fence: false,
    };
    let results =
        process_chain(&runtime, &client, vec![Command::TransactionSubmit { info }]).await;
    assert_eq!(results[0].ret, ErrorCode::NotSupported.errno());
}

#[tokio::test]
async fn buffer_commands_cover_the_handle_lifecycle() {
    let (runtime, client) = test_setup(DeviceType::Test);
    let results = process_chain(
        &runtime,
        &client,
        vec![
            Command::DmaBufferEnroll { handle: 42, flags: 0 },
            Command::DmaBufferAlloc { size: 4096, flags: 0 },
        ],
    )
    .await;
    let dma_addr = match results[0].output {
        CommandOutput::BufferEnrolled { dma_addr } => dma_addr,
        ref other => panic!("unexpected output {other:?}"),
    };
    let handle = match results[1].output {
        CommandOutput::BufferAllocated { handle } => handle,
        ref other => panic!("unexpected output {other:?}"),
    };

    let results = process_chain(
        &runtime,
        &client,
        vec![
            Command::DmaBufferCpuAccess { handle, flags: crate::buffer::CPU_ACCESS_READ },
            Command::DmaBufferFree { handle },
            Command::DmaBufferDisenroll { dma_addr },
        ],
    )
    .await;
    assert!(results.iter().all(|result| result.ret == 0));
}

#[tokio::test]
async fn dpm_commands_require_a_dpm_device() {
    let (runtime, client) = test_setup(DeviceType::Test);
    let results = process_chain(
        &runtime,
        &client,
        vec![Command::DpmGetClock { device_id: 1 }],
    )
    .await;
    assert_eq!(results[0].ret, ErrorCode::NotSupported.errno());
}

#[tokio::test]
async fn dpm_clock_updates_are_readable() {
    let (runtime, client) = test_setup(DeviceType::Dpm);
    let results = process_chain(
        &runtime,
        &client,
        vec![
            Command::DpmClkUpdate {
                settings: vec![ClockSetting { device_id: 1, freq_hz: 533_000_000 }],
            },
            Command::DpmGetClock { device_id: 1 },
            Command::DpmGetClock { device_id: 99 },
        ],
    )
    .await;
    assert_eq!(results[0].ret, 0);
    assert!(matches!(results[1].output, CommandOutput::ClockRate { freq_hz: 533_000_000 }));
    assert_eq!(results[2].ret, ErrorCode::NotFound.errno());
}

#[tokio::test]
async fn device_reset_skips_when_not_enabled() {
    let (runtime, client) = test_setup(DeviceType::Test);
    let entries = vec![IoEntry::Write { offset: 0x0, val: 7 }];
    let results = process_chain(
        &runtime,
        &client,
        vec![Command::DeviceReset { entries: entries.clone() }],
    )
    .await;
    // Skipped with a warning, not failed.
    assert_eq!(results[0].ret, 0);

    let results = process_chain(
        &runtime,
        &client,
        vec![
            Command::DeviceEnable,
            Command::DeviceReset { entries },
            Command::RegIo { entries: vec![IoEntry::Read { offset: 0x0, val: 0 }] },
        ],
    )
    .await;
    assert_eq!(results[1].ret, 0);
    match &results[2].output {
        CommandOutput::RegIoDone { entries } => {
            assert!(matches!(entries[0], IoEntry::Read { val: 7, .. }));
        }
        other => panic!("unexpected output {other:?}"),
    }
}

#[tokio::test]
async fn lifecycle_commands_are_idempotent() {
    let (runtime, client) = test_setup(DeviceType::Test);
    let results = process_chain(
        &runtime,
        &client,
        vec![
            Command::DeviceEnable,
            Command::DeviceEnable,
            Command::DeviceSuspend,
            Command::DeviceSuspend,
            Command::DeviceResume,
            Command::DeviceDisable,
            Command::DeviceDisable,
        ],
    )
    .await;
    assert!(results.iter().all(|result| result.ret == 0));
    assert_eq!(client.device.enable_count(), 0);
}
