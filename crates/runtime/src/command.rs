// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-client command channel.
//!
//! Commands arrive as typed packets; a chain is processed head to tail and
//! every packet gets its own `ret` code, so a local failure (bad argument,
//! allocation, unknown handle) does not stop the packets behind it. The
//! ioctl framing and user-memory copies live in the external channel glue;
//! by the time a [`Command`] exists here, every length has been validated
//! into owned memory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::device::{DeviceInfo, DeviceType};
use crate::error::ErrorCode;
use crate::event::EventControl;
use crate::ioentry::IoEntry;
use crate::periodic::PeriodicIoInfo;
use crate::state::{ClockSetting, QosRequest, Runtime};
use crate::transaction::{SubmitResult, TransactionInfo};
use crate::DeviceId;

/// The complete command set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Echo {
        msg: String,
        #[serde(default)]
        log: bool,
    },
    TimeQuery,
    GetDeviceInfo,
    DeviceEnable,
    DeviceDisable,
    DeviceReset {
        #[serde(default)]
        entries: Vec<IoEntry>,
    },
    DeviceSuspend,
    DeviceResume,
    DmaBufferEnroll {
        handle: u64,
        #[serde(default)]
        flags: u32,
    },
    DmaBufferDisenroll {
        dma_addr: u64,
    },
    DmaBufferAlloc {
        size: usize,
        #[serde(default)]
        flags: u32,
    },
    DmaBufferFree {
        handle: u64,
    },
    DmaBufferCpuAccess {
        handle: u64,
        flags: u32,
    },
    RegIo {
        entries: Vec<IoEntry>,
    },
    EventControlGet {
        event_id: u64,
    },
    EventControlSet {
        controls: Vec<EventControl>,
    },
    EventDequeue {
        capacity: usize,
    },
    TransactionSubmit {
        info: TransactionInfo,
    },
    TransactionCancel {
        id: u64,
    },
    TransactionReplace {
        info: TransactionInfo,
    },
    PeriodicIoSubmit {
        info: PeriodicIoInfo,
    },
    PeriodicIoCancel {
        id: u64,
    },
    DpmClkUpdate {
        settings: Vec<ClockSetting>,
    },
    DpmQosUpdate {
        requests: Vec<QosRequest>,
    },
    DpmGetClock {
        device_id: DeviceId,
    },
}

/// Output half of a command result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOutput {
    #[default]
    None,
    Echoed {
        msg: String,
    },
    Time {
        timestamp_ns: u64,
    },
    DeviceInfo(DeviceInfo),
    BufferEnrolled {
        dma_addr: u64,
    },
    BufferAllocated {
        handle: u64,
    },
    /// The executed program with read results mirrored back.
    RegIoDone {
        entries: Vec<IoEntry>,
    },
    EventFlags {
        event_id: u64,
        flags: u32,
    },
    Event {
        event_id: u64,
        counter: u64,
        timestamp_ns: u64,
        payload: Vec<u8>,
    },
    /// Dequeue needs at least `required` bytes of payload capacity.
    EventSpace {
        required: usize,
    },
    TransactionSubmitted(SubmitResult),
    PeriodicSubmitted {
        id: u64,
    },
    ClockRate {
        freq_hz: u64,
    },
}

/// One processed packet: `ret` is 0 or a negative errno.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub ret: i32,
    #[serde(default)]
    pub output: CommandOutput,
}

impl CommandResult {
    fn ok(output: CommandOutput) -> Self {
        Self { ret: 0, output }
    }

    fn fail(code: ErrorCode) -> Self {
        Self { ret: code.errno(), output: CommandOutput::None }
    }

    fn fail_with(code: ErrorCode, output: CommandOutput) -> Self {
        Self { ret: code.errno(), output }
    }
}

/// Process a packet chain in order. Failures are per-packet; the chain
/// always runs to the end.
pub async fn process_chain(
    runtime: &Runtime,
    client: &Arc<Client>,
    commands: Vec<Command>,
) -> Vec<CommandResult> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let result = process(runtime, client, command).await;
        if result.ret != 0 {
            tracing::debug!(client = client.id, ret = result.ret, "command failed");
        }
        results.push(result);
    }
    results
}

async fn process(runtime: &Runtime, client: &Arc<Client>, command: Command) -> CommandResult {
    match command {
        Command::Echo { msg, log } => {
            if log {
                tracing::info!(client = client.id, msg = %msg, "echo");
            }
            CommandResult::ok(CommandOutput::Echoed { msg })
        }
        Command::TimeQuery => {
            CommandResult::ok(CommandOutput::Time { timestamp_ns: runtime.now_ns() })
        }
        Command::GetDeviceInfo => {
            let info = client.device.info(client.worker_ids());
            CommandResult::ok(CommandOutput::DeviceInfo(info))
        }

        Command::DeviceEnable => match client.device_enable().await {
            Ok(()) => CommandResult::ok(CommandOutput::None),
            Err(code) => CommandResult::fail(code),
        },
        Command::DeviceDisable => match client.device_disable().await {
            Ok(()) => CommandResult::ok(CommandOutput::None),
            Err(code) => CommandResult::fail(code),
        },
        Command::DeviceReset { mut entries } => match client.device_reset(&mut entries).await {
            Ok(()) => CommandResult::ok(CommandOutput::None),
            Err(code) => CommandResult::fail(code),
        },
        Command::DeviceSuspend => {
            client.device.suspend().await;
            CommandResult::ok(CommandOutput::None)
        }
        Command::DeviceResume => {
            client.device.resume().await;
            CommandResult::ok(CommandOutput::None)
        }

        Command::DmaBufferEnroll { handle, flags } => {
            match client.buffers().enroll(handle, flags) {
                Ok(dma_addr) => CommandResult::ok(CommandOutput::BufferEnrolled { dma_addr }),
                Err(code) => CommandResult::fail(code),
            }
        }
        Command::DmaBufferDisenroll { dma_addr } => match client.buffers().disenroll(dma_addr) {
            Ok(()) => CommandResult::ok(CommandOutput::None),
            Err(code) => CommandResult::fail(code),
        },
        Command::DmaBufferAlloc { size, flags } => match client.buffers().alloc(size, flags) {
            Ok(handle) => CommandResult::ok(CommandOutput::BufferAllocated { handle }),
            Err(code) => CommandResult::fail(code),
        },
        Command::DmaBufferFree { handle } => match client.buffers().free(handle) {
            Ok(()) => CommandResult::ok(CommandOutput::None),
            Err(code) => CommandResult::fail(code),
        },
        Command::DmaBufferCpuAccess { handle, flags } => {
            match client.buffers().cpu_access(handle, flags) {
                Ok(()) => CommandResult::ok(CommandOutput::None),
                Err(code) => CommandResult::fail(code),
            }
        }

        Command::RegIo { mut entries } => match client.reg_io(&mut entries).await {
            Ok(()) => CommandResult::ok(CommandOutput::RegIoDone { entries }),
            Err(code) => CommandResult::fail(code),
        },

        Command::EventControlGet { event_id } => CommandResult::ok(CommandOutput::EventFlags {
            event_id,
            flags: client.event_flags(event_id),
        }),
        Command::EventControlSet { controls } => {
            client.event_control_set(&controls);
            CommandResult::ok(CommandOutput::None)
        }
        Command::EventDequeue { capacity } => match client.dequeue_event(capacity) {
            Ok(record) => CommandResult::ok(CommandOutput::Event {
                event_id: record.event_id,
                counter: record.counter,
                timestamp_ns: record.timestamp_ns,
                payload: record.payload.to_vec(),
            }),
            Err(crate::event::DequeueError::Empty) => CommandResult::fail(ErrorCode::NotFound),
            Err(crate::event::DequeueError::TooSmall { required }) => CommandResult::fail_with(
                ErrorCode::NoMemory,
                CommandOutput::EventSpace { required },
            ),
        },

        Command::TransactionSubmit { info } => match client.submit(info) {
            Ok(result) => CommandResult::ok(CommandOutput::TransactionSubmitted(result)),
            Err(code) => CommandResult::fail(code),
        },
        Command::TransactionCancel { id } => match client.cancel(id) {
            Ok(()) => CommandResult::ok(CommandOutput::None),
            Err(code) => CommandResult::fail(code),
        },
        Command::TransactionReplace { info } => match client.replace(info) {
            Ok(result) => CommandResult::ok(CommandOutput::TransactionSubmitted(result)),
            Err(code) => CommandResult::fail(code),
        },

        Command::PeriodicIoSubmit { info } => match client.periodic_submit(info) {
            Ok(id) => CommandResult::ok(CommandOutput::PeriodicSubmitted { id }),
            Err(code) => CommandResult::fail(code),
        },
        Command::PeriodicIoCancel { id } => match client.periodic_cancel(id) {
            Ok(()) => CommandResult::ok(CommandOutput::None),
            Err(code) => CommandResult::fail(code),
        },

        Command::DpmClkUpdate { settings } => {
            if client.device.kind != DeviceType::Dpm {
                return CommandResult::fail(ErrorCode::NotSupported);
            }
            match runtime.dpm_update_clocks(&settings) {
                Ok(()) => CommandResult::ok(CommandOutput::None),
                Err(code) => CommandResult::fail(code),
            }
        }
        Command::DpmQosUpdate { requests } => {
            if client.device.kind != DeviceType::Dpm {
                return CommandResult::fail(ErrorCode::NotSupported);
            }
            match runtime.dpm_update_qos(&requests) {
                Ok(()) => CommandResult::ok(CommandOutput::None),
                Err(code) => CommandResult::fail(code),
            }
        }
        Command::DpmGetClock { device_id } => {
            if client.device.kind != DeviceType::Dpm {
                return CommandResult::fail(ErrorCode::NotSupported);
            }
            match runtime.dpm_clock(device_id) {
                Ok(freq_hz) => CommandResult::ok(CommandOutput::ClockRate { freq_hz }),
                Err(code) => CommandResult::fail(code),
            }
        }
    }
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
