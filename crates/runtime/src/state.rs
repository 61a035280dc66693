// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared runtime state: the registries every subsystem hangs off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bus::BusManager;
use crate::client::{signal_fence, Client, ClientRegistry};
use crate::config::Topology;
use crate::device::{Device, DeviceSetup, DeviceType};
use crate::error::ErrorCode;
use crate::event::EVENT_ID_MEMORY_PAGE_FAULT;
use crate::fence::FenceTable;
use crate::hal::mem::{new_journal, MemRegisterIo, SlowRegisterIo};
use crate::hal::{DeviceOps, RegisterIo};
use crate::{ClientId, DeviceId};

/// Monotonic time base shared by event timestamps and the time query.
#[derive(Clone)]
pub struct Clock {
    base: tokio::time::Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { base: tokio::time::Instant::now() }
    }

    pub fn now_ns(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Requested clock rate for one device, recorded by the DPM command set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSetting {
    pub device_id: DeviceId,
    pub freq_hz: u64,
}

/// Bandwidth/QoS request for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosRequest {
    pub device_id: DeviceId,
    pub read_bw: u64,
    pub write_bw: u64,
}

#[derive(Default)]
struct DpmTable {
    clocks: HashMap<DeviceId, u64>,
    qos: HashMap<DeviceId, QosRequest>,
}

/// The device-mediation runtime.
///
/// Owns the device/bus/client/fence registries and the id allocators. All
/// user-facing operations reach the runtime through a connected [`Client`]
/// and the command layer; tests and the external channel glue use the typed
/// methods directly.
pub struct Runtime {
    devices: RwLock<IndexMap<DeviceId, Arc<Device>>>,
    buses: Mutex<HashMap<String, Arc<BusManager>>>,
    registry: Arc<ClientRegistry>,
    fences: Arc<FenceTable>,
    dpm: Mutex<DpmTable>,
    clock: Clock,
    next_device_id: AtomicU32,
    next_client_id: AtomicU64,
    next_worker_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(IndexMap::new()),
            buses: Mutex::new(HashMap::new()),
            registry: ClientRegistry::new(),
            fences: FenceTable::new(),
            dpm: Mutex::new(DpmTable::default()),
            clock: Clock::new(),
            next_device_id: AtomicU32::new(1),
            next_client_id: AtomicU64::new(1),
            next_worker_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Build a runtime from a parsed topology, backing every io-capable
    /// device with an in-memory register file (bus devices get the bus's
    /// transfer latency on top).
    pub fn from_topology(topology: &Topology) -> Result<Arc<Self>, ErrorCode> {
        topology.validate()?;
        let runtime = Self::new();
        let mut delays = HashMap::new();
        for bus in &topology.buses {
            runtime.ensure_bus(&bus.name);
            delays.insert(bus.name.clone(), bus.transfer_delay_us);
        }
        for spec in &topology.devices {
            let reg_io: Option<Arc<dyn RegisterIo>> = if spec.kind.is_virtual() {
                None
            } else {
                let mem = MemRegisterIo::new();
                match spec.bus.as_deref() {
                    Some(bus_name) => {
                        let delay_us = delays.get(bus_name).copied().unwrap_or(0);
                        if delay_us > 0 {
                            Some(SlowRegisterIo::new(
                                mem,
                                spec.name.clone(),
                                std::time::Duration::from_micros(delay_us),
                                new_journal(),
                            ))
                        } else {
                            Some(mem)
                        }
                    }
                    None => Some(mem),
                }
            };
            runtime.add_device(
                &spec.name,
                spec.kind,
                reg_io,
                None,
                spec.bus.as_deref(),
                spec.clocks.clone(),
                spec.regs.clone(),
                spec.priority,
            );
        }
        Ok(runtime)
    }

    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn fences(&self) -> &Arc<FenceTable> {
        &self.fences
    }

    // -- Bus registry ---------------------------------------------------------

    /// Look up or start the manager for a named bus.
    pub fn ensure_bus(&self, name: &str) -> Arc<BusManager> {
        let mut buses = self.buses.lock();
        if let Some(bus) = buses.get(name) {
            return Arc::clone(bus);
        }
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let bus = BusManager::spawn(name, worker_id, self.shutdown.child_token());
        buses.insert(name.to_owned(), Arc::clone(&bus));
        bus
    }

    pub fn bus(&self, name: &str) -> Option<Arc<BusManager>> {
        self.buses.lock().get(name).cloned()
    }

    // -- Device registry ------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_device(
        &self,
        name: &str,
        kind: DeviceType,
        reg_io: Option<Arc<dyn RegisterIo>>,
        ops: Option<Arc<dyn DeviceOps>>,
        bus_name: Option<&str>,
        clocks: Vec<String>,
        regs: Vec<String>,
        priority: u32,
    ) -> Arc<Device> {
        let id = self.next_device_id.fetch_add(1, Ordering::Relaxed);
        let bus = bus_name.map(|bus_name| self.ensure_bus(bus_name));
        let device = Device::create(
            id,
            DeviceSetup {
                name: name.to_owned(),
                kind,
                reg_io,
                ops,
                bus: bus.clone(),
                clocks,
                regs,
                priority,
            },
            self.clock.clone(),
        );
        if let Some(bus) = bus {
            bus.connect_device(id, priority);
        }
        self.devices.write().insert(id, Arc::clone(&device));
        tracing::info!(device = %name, id, ?kind, "device registered");
        device
    }

    pub fn device(&self, id: DeviceId) -> Result<Arc<Device>, ErrorCode> {
        self.devices.read().get(&id).cloned().ok_or(ErrorCode::NotFound)
    }

    pub fn device_by_name(&self, name: &str) -> Result<Arc<Device>, ErrorCode> {
        self.devices
            .read()
            .values()
            .find(|device| device.name == name)
            .cloned()
            .ok_or(ErrorCode::NotFound)
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    /// Unregister a device. When it was the last one on its bus, the bus
    /// manager is flushed and torn down.
    pub async fn remove_device(&self, id: DeviceId) -> Result<(), ErrorCode> {
        let device = self.devices.write().shift_remove(&id).ok_or(ErrorCode::NotFound)?;
        if let Some(bus) = device.bus() {
            if bus.disconnect_device(id) {
                bus.flush().await;
                if bus.fifo_len() != 0 {
                    tracing::warn!(bus = %bus.name, "bus fifo not empty after flush");
                }
                self.buses.lock().remove(&bus.name);
                tracing::info!(bus = %bus.name, "bus manager torn down");
            }
        }
        Ok(())
    }

    // -- Clients --------------------------------------------------------------

    /// Connect a new client to a device.
    pub fn connect(&self, device_id: DeviceId) -> Result<Arc<Client>, ErrorCode> {
        let device = self.device(device_id)?;
        let id: ClientId = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let client = Client::connect(
            id,
            worker_id,
            device,
            Arc::clone(&self.fences),
            Arc::clone(&self.registry),
            self.shutdown.child_token(),
        );
        tracing::debug!(client = id, device = device_id, "client connected");
        Ok(client)
    }

    pub async fn disconnect(&self, client: &Arc<Client>) {
        client.disconnect().await;
    }

    // -- Fences ---------------------------------------------------------------

    pub fn fence_create(&self) -> u32 {
        self.fences.create().fd()
    }

    /// Signal a fence by fd, dispatching dependent transactions.
    pub fn fence_signal(&self, fd: u32, status: i32) -> Result<(), ErrorCode> {
        signal_fence(&self.fences, &self.registry, fd, status)
    }

    /// Non-blocking status read; `None` while unsignaled.
    pub fn fence_status(&self, fd: u32) -> Result<Option<i32>, ErrorCode> {
        Ok(self.fences.get(fd)?.status())
    }

    pub async fn fence_wait(&self, fd: u32) -> Result<i32, ErrorCode> {
        let fence = self.fences.get(fd)?;
        Ok(fence.wait().await)
    }

    pub fn fence_close(&self, fd: u32) -> Result<(), ErrorCode> {
        self.fences.close(fd)
    }

    // -- Faults ---------------------------------------------------------------

    /// Entry point for the external memory collaborator: a page fault on a
    /// device becomes an error event carrying the fault address and flags.
    pub fn report_page_fault(&self, device_id: DeviceId, fault_addr: u64, flags: u64) {
        let Ok(device) = self.device(device_id) else {
            tracing::warn!(device = device_id, "page fault on unknown device");
            return;
        };
        let payload = serde_json::json!({ "fault_addr": fault_addr, "flags": flags });
        let payload = Bytes::from(payload.to_string().into_bytes());
        device.emit_event(EVENT_ID_MEMORY_PAGE_FAULT, payload);
        tracing::error!(device = %device.name, fault_addr, "memory page fault");
    }

    // -- DPM ------------------------------------------------------------------

    pub fn dpm_update_clocks(&self, settings: &[ClockSetting]) -> Result<(), ErrorCode> {
        let mut dpm = self.dpm.lock();
        for setting in settings {
            dpm.clocks.insert(setting.device_id, setting.freq_hz);
        }
        Ok(())
    }

    pub fn dpm_update_qos(&self, requests: &[QosRequest]) -> Result<(), ErrorCode> {
        let mut dpm = self.dpm.lock();
        for request in requests {
            dpm.qos.insert(request.device_id, request.clone());
        }
        Ok(())
    }

    pub fn dpm_clock(&self, device_id: DeviceId) -> Result<u64, ErrorCode> {
        self.dpm.lock().clocks.get(&device_id).copied().ok_or(ErrorCode::NotFound)
    }

    // -- Shutdown -------------------------------------------------------------

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        tracing::info!("runtime shut down");
    }
}
