// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios driving topology bring-up, the command channel, and
//! the shared-bus worker together.

use std::time::Duration;

use bytes::Bytes;

use regmux::config::Topology;
use regmux::event::{EventControl, EVENT_FLAG_QUEUE, EVENT_ID_MEMORY_PAGE_FAULT};
use regmux::ioentry::IoEntry;
use regmux::transaction::{TransactionInfo, TransactionResponse};
use regmux::trigger::TriggerCondition;
use regmux::{process_chain, Command, CommandOutput, ErrorCode, Runtime};
use regmux_specs::{assert_no_interleaving, shared_bus_rig};

// -- Immediate transaction over the command channel ----------------------------

#[tokio::test]
async fn immediate_write_emits_success_and_is_readable() {
    let runtime = Runtime::new();
    let device = runtime.add_device(
        "isp",
        regmux::DeviceType::Mmio,
        Some(regmux::hal::mem::MemRegisterIo::new()),
        None,
        None,
        Vec::new(),
        Vec::new(),
        0,
    );
    let client = runtime.connect(device.id).unwrap();

    let info = TransactionInfo {
        trigger: TriggerCondition::immediate(),
        entries: vec![IoEntry::Write { offset: 0x100, val: 0xDEAD }],
        emit_success_event_id: Some(0x50),
        emit_error_event_id: None,
        completion_fence_fds: Vec::new(),
        create_completion_fence: false,
    };
    let results = process_chain(
        &runtime,
        &client,
        vec![
            Command::DeviceEnable,
            Command::EventControlSet {
                controls: vec![EventControl { event_id: 0x50, flags: EVENT_FLAG_QUEUE }],
            },
            Command::TransactionSubmit { info },
        ],
    )
    .await;
    assert!(results.iter().all(|result| result.ret == 0), "{results:?}");

    // The success event fires exactly once.
    let record = client.wait_event(Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.event_id, 0x50);
    let response: TransactionResponse = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(response.ret, 0);
    assert!(client.wait_event(Duration::from_millis(50)).await.is_err());

    // And the write is observable through synchronous register io.
    let results = process_chain(
        &runtime,
        &client,
        vec![Command::RegIo { entries: vec![IoEntry::Read { offset: 0x100, val: 0 }] }],
    )
    .await;
    match &results[0].output {
        CommandOutput::RegIoDone { entries } => {
            assert!(matches!(entries[0], IoEntry::Read { val: 0xDEAD, .. }));
        }
        other => panic!("unexpected output {other:?}"),
    }
}

// -- Bus serialization ---------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn programs_on_a_shared_bus_never_interleave() {
    let rig = shared_bus_rig(Duration::from_millis(10));
    let client_a = rig.runtime.connect(rig.device_a).unwrap();
    let client_b = rig.runtime.connect(rig.device_b).unwrap();

    // Each client toggles its own device; both land on the bus FIFO at once.
    for (client, success) in [(&client_a, 0x60u64), (&client_b, 0x61u64)] {
        client.event_control_set(&[EventControl { event_id: success, flags: EVENT_FLAG_QUEUE }]);
        client
            .submit(TransactionInfo {
                trigger: TriggerCondition::immediate(),
                entries: vec![
                    IoEntry::Write { offset: 0x0, val: 1 },
                    IoEntry::Write { offset: 0x0, val: 0 },
                ],
                emit_success_event_id: Some(success),
                emit_error_event_id: None,
                completion_fence_fds: Vec::new(),
                create_completion_fence: false,
            })
            .unwrap();
    }

    client_a.wait_event(Duration::from_secs(5)).await.unwrap();
    client_b.wait_event(Duration::from_secs(5)).await.unwrap();

    assert_eq!(rig.journal.lock().len(), 4, "two writes per device");
    assert_no_interleaving(&rig.journal);
}

// -- Dequeue overflow retry ----------------------------------------------------

#[tokio::test]
async fn undersized_dequeue_reports_size_then_retry_pops() {
    let runtime = Runtime::new();
    let device = runtime.add_device(
        "cam0",
        regmux::DeviceType::Test,
        Some(regmux::hal::mem::MemRegisterIo::new()),
        None,
        None,
        Vec::new(),
        Vec::new(),
        0,
    );
    let client = runtime.connect(device.id).unwrap();
    client.event_control_set(&[EventControl { event_id: 9, flags: EVENT_FLAG_QUEUE }]);
    client.device.emit_event(9, Bytes::from(vec![0xAA; 1024])).unwrap();

    let results = process_chain(
        &runtime,
        &client,
        vec![Command::EventDequeue { capacity: 256 }],
    )
    .await;
    assert_eq!(results[0].ret, ErrorCode::NoMemory.errno());
    assert!(matches!(results[0].output, CommandOutput::EventSpace { required: 1024 }));

    let results = process_chain(
        &runtime,
        &client,
        vec![Command::EventDequeue { capacity: 1024 }],
    )
    .await;
    assert_eq!(results[0].ret, 0);
    match &results[0].output {
        CommandOutput::Event { payload, .. } => assert_eq!(payload.len(), 1024),
        other => panic!("unexpected output {other:?}"),
    }
}

// -- Page faults surface as error events ---------------------------------------

#[tokio::test]
async fn page_fault_reaches_the_error_queue_first() {
    let runtime = Runtime::new();
    let device = runtime.add_device(
        "cam0",
        regmux::DeviceType::Test,
        Some(regmux::hal::mem::MemRegisterIo::new()),
        None,
        None,
        Vec::new(),
        Vec::new(),
        0,
    );
    let client = runtime.connect(device.id).unwrap();
    client.event_control_set(&[
        EventControl { event_id: 5, flags: EVENT_FLAG_QUEUE },
        EventControl {
            event_id: EVENT_ID_MEMORY_PAGE_FAULT,
            flags: regmux::event::EVENT_FLAG_ERROR_QUEUE,
        },
    ]);

    // A normal event lands first, then the fault: the fault is delivered
    // ahead of it.
    client.device.emit_event(5, Bytes::new()).unwrap();
    runtime.report_page_fault(device.id, 0xDEAD_0000, 0x2);

    let record = client.wait_event(Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.event_id, EVENT_ID_MEMORY_PAGE_FAULT);
    let payload: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(payload["fault_addr"], 0xDEAD_0000u64);

    let record = client.wait_event(Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.event_id, 5);
}

// -- Topology bring-up ---------------------------------------------------------

#[tokio::test]
async fn topology_json_brings_up_buses_and_devices() {
    let topology: Topology = serde_json::from_str(
        r#"{
            "buses": [{"name": "i2c-0"}],
            "devices": [
                {"name": "sensor0", "kind": "i2c", "bus": "i2c-0", "priority": 10},
                {"name": "sensor1", "kind": "i2c", "bus": "i2c-0", "priority": 10},
                {"name": "isp", "kind": "mmio", "clocks": ["core", "axi"], "regs": ["csr"]},
                {"name": "dpm", "kind": "dpm"}
            ]
        }"#,
    )
    .unwrap();
    let runtime = Runtime::from_topology(&topology).unwrap();
    assert_eq!(runtime.devices().len(), 4);
    assert!(runtime.bus("i2c-0").is_some());

    let isp = runtime.device_by_name("isp").unwrap();
    let client = runtime.connect(isp.id).unwrap();
    let results = process_chain(&runtime, &client, vec![Command::GetDeviceInfo]).await;
    match &results[0].output {
        CommandOutput::DeviceInfo(info) => {
            assert_eq!(info.name, "isp");
            assert_eq!(info.clocks, vec!["core", "axi"]);
            assert_eq!(info.worker_ids.len(), 1);
        }
        other => panic!("unexpected output {other:?}"),
    }

    // Bus devices report both their own worker and the bus worker.
    let sensor = runtime.device_by_name("sensor0").unwrap();
    let sensor_client = runtime.connect(sensor.id).unwrap();
    let results = process_chain(&runtime, &sensor_client, vec![Command::GetDeviceInfo]).await;
    match &results[0].output {
        CommandOutput::DeviceInfo(info) => assert_eq!(info.worker_ids.len(), 2),
        other => panic!("unexpected output {other:?}"),
    }

    // Virtual DPM devices reject register programs.
    let dpm = runtime.device_by_name("dpm").unwrap();
    let dpm_client = runtime.connect(dpm.id).unwrap();
    let results = process_chain(
        &runtime,
        &dpm_client,
        vec![Command::RegIo { entries: vec![IoEntry::Read { offset: 0, val: 0 }] }],
    )
    .await;
    assert_ne!(results[0].ret, 0);
}

// -- Bus teardown --------------------------------------------------------------

#[tokio::test]
async fn last_device_removal_tears_down_the_bus_manager() {
    let rig = shared_bus_rig(Duration::from_micros(10));
    assert!(rig.runtime.bus("i2c-0").is_some());
    rig.runtime.remove_device(rig.device_a).await.unwrap();
    assert!(rig.runtime.bus("i2c-0").is_some(), "one device still connected");
    rig.runtime.remove_device(rig.device_b).await.unwrap();
    assert!(rig.runtime.bus("i2c-0").is_none(), "manager unregistered after last device");
}
