// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bus managers: one serializing worker per shared transport.
//!
//! Producers are clients that became ready; the FIFO holds client references,
//! never transactions: a dequeued client drains its own queue. Membership
//! is deduplicated with the client's in-queue flag, bounding the FIFO at one
//! slot per client. The bus mutex is held across exactly one client drain,
//! which is what makes executor runs on devices sharing the transport
//! non-interleaving.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::DeviceId;

pub struct BusManager {
    pub name: String,
    pub worker_id: u64,
    fifo: Mutex<VecDeque<Weak<Client>>>,
    wake: Arc<Notify>,
    /// Widest lock in the system: held only across one client drain.
    bus_lock: tokio::sync::Mutex<()>,
    devices: Mutex<Vec<DeviceId>>,
    /// Priority of the first-connected device; later mismatches are logged.
    priority: Mutex<Option<u32>>,
    shutdown: CancellationToken,
}

impl BusManager {
    /// Create the manager and start its worker task.
    pub fn spawn(name: impl Into<String>, worker_id: u64, shutdown: CancellationToken) -> Arc<Self> {
        let manager = Arc::new(Self {
            name: name.into(),
            worker_id,
            fifo: Mutex::new(VecDeque::new()),
            wake: Arc::new(Notify::new()),
            bus_lock: tokio::sync::Mutex::new(()),
            devices: Mutex::new(Vec::new()),
            priority: Mutex::new(None),
            shutdown,
        });
        let worker = Arc::clone(&manager);
        tokio::spawn(async move {
            worker.worker_loop().await;
        });
        manager
    }

    // -- Device membership ----------------------------------------------------

    pub fn connect_device(&self, device_id: DeviceId, priority: u32) {
        let mut bus_priority = self.priority.lock();
        match *bus_priority {
            None => *bus_priority = Some(priority),
            Some(existing) if existing != priority => {
                tracing::warn!(
                    bus = %self.name,
                    bus_priority = existing,
                    device_priority = priority,
                    "device priority differs from bus worker priority"
                );
            }
            Some(_) => {}
        }
        self.devices.lock().push(device_id);
    }

    /// Returns true when the last device left and the manager should be torn
    /// down by its registry.
    pub fn disconnect_device(&self, device_id: DeviceId) -> bool {
        let mut devices = self.devices.lock();
        devices.retain(|id| *id != device_id);
        devices.is_empty()
    }

    pub fn has_device(&self, device_id: DeviceId) -> bool {
        self.devices.lock().contains(&device_id)
    }

    // -- Client FIFO ----------------------------------------------------------

    /// Queue a client for draining. Idempotent while the client is already
    /// queued: the in-queue flag keeps the FIFO bounded by one entry per
    /// client.
    pub fn enqueue_client(&self, client: &Arc<Client>) {
        if client.in_bus_queue.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fifo.lock().push_back(Arc::downgrade(client));
        self.wake.notify_one();
    }

    pub fn fifo_len(&self) -> usize {
        self.fifo.lock().len()
    }

    /// Take the bus mutex for a synchronous register-io run in the calling
    /// context. The worker takes the same lock around each client drain.
    pub async fn lock_bus(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.bus_lock.lock().await
    }

    /// Wait until the FIFO is empty and the worker is between drains.
    pub async fn flush(&self) {
        loop {
            if self.fifo.lock().is_empty() {
                let _idle = self.bus_lock.lock().await;
                if self.fifo.lock().is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // -- Worker ---------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>) {
        tracing::debug!(bus = %self.name, worker = self.worker_id, "bus worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }
            loop {
                let next = self.fifo.lock().pop_front();
                let Some(weak) = next else { break };
                let Some(client) = weak.upgrade() else { continue };
                // Clear membership before draining so readiness that arrives
                // mid-drain re-queues the client.
                client.in_bus_queue.store(false, Ordering::Release);
                if !self.has_device(client.device.id) {
                    // Stale entry from a disconnected device.
                    continue;
                }
                let _bus = self.bus_lock.lock().await;
                client.drain_ready().await;
            }
        }
        tracing::debug!(bus = %self.name, "bus worker stopped");
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
