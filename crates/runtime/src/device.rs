// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Devices: the mediation targets.
//!
//! A device is identity + a register-io capability (absent on virtual types)
//! + per-device event state + the set of connected clients. Enable/disable
//! transitions are reference-counted across clients and guarded by the
//! device's sleep lock; the emission path is lock-light and never blocks.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::bus::BusManager;
use crate::client::Client;
use crate::error::ErrorCode;
use crate::event::DeviceEventTable;
use crate::hal::{DeviceOps, NopDeviceOps, RegisterIo};
use crate::state::Clock;
use crate::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mmio,
    I2c,
    Spi,
    Dpm,
    Test,
    Top,
}

impl DeviceType {
    /// Virtual types never carry a register-io capability.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Dpm | Self::Top)
    }
}

/// Everything needed to register a device with the runtime.
pub struct DeviceSetup {
    pub name: String,
    pub kind: DeviceType,
    pub reg_io: Option<Arc<dyn RegisterIo>>,
    pub ops: Option<Arc<dyn DeviceOps>>,
    pub bus: Option<Arc<BusManager>>,
    pub clocks: Vec<String>,
    pub regs: Vec<String>,
    pub priority: u32,
}

/// Info block returned by the device-info command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub kind: DeviceType,
    pub name: String,
    pub clocks: Vec<String>,
    pub regs: Vec<String>,
    pub worker_ids: Vec<u64>,
}

pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceType,
    reg_io: Option<Arc<dyn RegisterIo>>,
    ops: Arc<dyn DeviceOps>,
    bus: Option<Arc<BusManager>>,
    /// Guards enable/disable transitions (a sleep lock: hooks may block).
    client_lock: Mutex<()>,
    enable_count: AtomicI32,
    suspended: AtomicBool,
    pub events: DeviceEventTable,
    clients: RwLock<Vec<Weak<Client>>>,
    clock: Clock,
    clocks: Vec<String>,
    regs: Vec<String>,
    pub priority: u32,
}

impl Device {
    pub fn create(id: DeviceId, setup: DeviceSetup, clock: Clock) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: setup.name,
            kind: setup.kind,
            reg_io: setup.reg_io,
            ops: setup.ops.unwrap_or_else(|| Arc::new(NopDeviceOps)),
            bus: setup.bus,
            client_lock: Mutex::new(()),
            enable_count: AtomicI32::new(0),
            suspended: AtomicBool::new(false),
            events: DeviceEventTable::default(),
            clients: RwLock::new(Vec::new()),
            clock,
            clocks: setup.clocks,
            regs: setup.regs,
            priority: setup.priority,
        })
    }

    /// The register-io capability; virtual devices fail with `NotSupported`.
    pub fn reg_io(&self) -> Result<Arc<dyn RegisterIo>, ErrorCode> {
        self.reg_io.clone().ok_or(ErrorCode::NotSupported)
    }

    pub fn supports_io(&self) -> bool {
        self.reg_io.is_some()
    }

    pub fn ops(&self) -> &Arc<dyn DeviceOps> {
        &self.ops
    }

    pub fn bus(&self) -> Option<&Arc<BusManager>> {
        self.bus.as_ref()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn enable_count(&self) -> i32 {
        self.enable_count.load(Ordering::Acquire)
    }

    pub fn info(&self, worker_ids: Vec<u64>) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            clocks: self.clocks.clone(),
            regs: self.regs.clone(),
            worker_ids,
        }
    }

    // -- Client attachment ----------------------------------------------------

    pub fn attach_client(&self, client: &Arc<Client>) {
        self.clients.write().push(Arc::downgrade(client));
    }

    pub fn detach_client(&self, client_id: u64) {
        self.clients
            .write()
            .retain(|weak| weak.upgrade().is_some_and(|c| c.id != client_id));
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().iter().filter(|w| w.strong_count() > 0).count()
    }

    // -- Lifecycle ------------------------------------------------------------

    /// Count one more enabling client; powers the device up on the first.
    pub async fn enable(&self) -> Result<(), ErrorCode> {
        let _guard = self.client_lock.lock().await;
        let count = self.enable_count.load(Ordering::Acquire);
        if count == i32::MAX {
            return Err(ErrorCode::Overflow);
        }
        if count == 0 {
            self.ops.enable().await?;
        }
        self.enable_count.store(count + 1, Ordering::Release);
        tracing::debug!(device = %self.name, count = count + 1, "device enabled");
        Ok(())
    }

    /// Count one enabling client out; powers the device down on the last.
    pub async fn disable(&self) -> Result<(), ErrorCode> {
        let _guard = self.client_lock.lock().await;
        let count = self.enable_count.load(Ordering::Acquire);
        if count == 0 {
            return Ok(());
        }
        if count == 1 {
            self.ops.disable().await?;
        }
        self.enable_count.store(count - 1, Ordering::Release);
        tracing::debug!(device = %self.name, count = count - 1, "device disabled");
        Ok(())
    }

    /// Idempotent suspend; io is rejected with `Busy` until resume.
    pub async fn suspend(&self) {
        let _guard = self.client_lock.lock().await;
        if !self.suspended.swap(true, Ordering::AcqRel) {
            tracing::info!(device = %self.name, "device suspended");
        }
    }

    pub async fn resume(&self) {
        let _guard = self.client_lock.lock().await;
        if self.suspended.swap(false, Ordering::AcqRel) {
            tracing::info!(device = %self.name, "device resumed");
        }
    }

    // -- Event emission -------------------------------------------------------

    /// Emit an event with `payload` to every connected client whose flags
    /// select it, and run trigger evaluation synchronously. Returns the new
    /// event counter, or `None` if the emission was dropped at the source.
    ///
    /// Runs in wake/timer contexts: no blocking, no await.
    pub fn emit_event(self: &Arc<Self>, event_id: u64, payload: Bytes) -> Option<u64> {
        let counter = self.events.accept(event_id)?;
        self.ops.event_emitted(event_id, counter);
        let timestamp_ns = self.clock.now_ns();
        let clients: Vec<Arc<Client>> =
            self.clients.read().iter().filter_map(Weak::upgrade).collect();
        for client in clients {
            client.on_device_event(event_id, counter, timestamp_ns, payload.clone());
        }
        Some(counter)
    }
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
