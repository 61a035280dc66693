// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clients and their scheduler.
//!
//! A client belongs to exactly one device and owns everything submitted
//! through it: event flags and queues, the transaction tables, periodic
//! entries, and buffer handles. Ready work is drained single-file by
//! [`Client::drain_ready`], invoked from the client's own worker task for
//! direct-mapped devices, or from the bus-manager worker for devices behind a
//! shared transport. The short `txns`/`periodic`/`queues` locks are never
//! held across an await; the `run_lock` sleep mutex spans one execution so
//! cancellation always observes a consistent phase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferTable;
use crate::device::Device;
use crate::error::ErrorCode;
use crate::event::{
    route, DequeueError, EventControl, EventQueues, EventRecord, EVENT_FLAG_NOTIFY_ONLY,
    EVENT_ID_PERIODIC_IO_FAILURE, EVENT_ID_TRANSACTION_FAILURE,
};
use crate::fence::{AttachOutcome, Fence, FenceTable};
use crate::ioentry::{
    collect_read_results, execute_io_entries, validate_entries, ExecStatus, IoEntry,
};
use crate::periodic::{PeriodicBatch, PeriodicEntry, PeriodicIoInfo, PeriodicTable, TimerSlot};
use crate::transaction::{
    RunningTxn, SubmitResult, Transaction, TransactionInfo, TransactionResponse, TxnPhase,
    TxnTable, TXN_CANCELED_STATUS,
};
use crate::trigger::{Readiness, TriggerNode, TriggerProgress};
use crate::{ClientId, TxnId};

/// Lookup table from client id to live client, used by fence signal dispatch.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, Weak<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, client: &Arc<Client>) {
        self.clients.write().insert(client.id, Arc::downgrade(client));
    }

    pub fn remove(&self, id: ClientId) {
        self.clients.write().remove(&id);
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.read().get(&id).and_then(Weak::upgrade)
    }
}

/// Signal a fence and dispatch the drained transaction buckets to their
/// owning clients for trigger re-evaluation.
pub fn signal_fence(
    fences: &FenceTable,
    registry: &ClientRegistry,
    fd: u32,
    status: i32,
) -> Result<(), ErrorCode> {
    let fence = fences.get(fd)?;
    let drained = fence.signal(status)?;
    for (client_id, txn_ids) in drained {
        if let Some(client) = registry.get(client_id) {
            client.on_fence_signaled(&txn_ids, status);
        }
    }
    Ok(())
}

pub struct Client {
    pub id: ClientId,
    pub device: Arc<Device>,
    fences: Arc<FenceTable>,
    registry: Arc<ClientRegistry>,
    /// Per-event delivery flags set by the user.
    flags: Mutex<HashMap<u64, u32>>,
    queues: Mutex<EventQueues>,
    event_wake: Notify,
    txns: Mutex<TxnTable>,
    periodic: Mutex<PeriodicTable>,
    buffers: Mutex<BufferTable>,
    /// Held across one execution so cancel sees a settled phase.
    run_lock: tokio::sync::Mutex<()>,
    worker_wake: Notify,
    /// Bus FIFO membership dedup flag.
    pub(crate) in_bus_queue: AtomicBool,
    is_enabled: AtomicBool,
    worker_id: u64,
    shutdown: CancellationToken,
}

impl Client {
    /// Attach a new client to `device`, spawning its worker task.
    pub(crate) fn connect(
        id: ClientId,
        worker_id: u64,
        device: Arc<Device>,
        fences: Arc<FenceTable>,
        registry: Arc<ClientRegistry>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            id,
            device,
            fences,
            registry,
            flags: Mutex::new(HashMap::new()),
            queues: Mutex::new(EventQueues::default()),
            event_wake: Notify::new(),
            txns: Mutex::new(TxnTable::default()),
            periodic: Mutex::new(PeriodicTable::default()),
            buffers: Mutex::new(BufferTable::default()),
            run_lock: tokio::sync::Mutex::new(()),
            worker_wake: Notify::new(),
            in_bus_queue: AtomicBool::new(false),
            is_enabled: AtomicBool::new(false),
            worker_id,
            shutdown,
        });
        client.device.attach_client(&client);
        client.registry.insert(&client);
        if client.device.bus().is_none() {
            let worker = Arc::clone(&client);
            tokio::spawn(async move {
                worker.worker_loop().await;
            });
        }
        client
    }

    pub fn worker_ids(&self) -> Vec<u64> {
        let mut ids = vec![self.worker_id];
        if let Some(bus) = self.device.bus() {
            ids.push(bus.worker_id);
        }
        ids
    }

    pub fn fences(&self) -> &Arc<FenceTable> {
        &self.fences
    }

    pub fn buffers(&self) -> parking_lot::MutexGuard<'_, BufferTable> {
        self.buffers.lock()
    }

    // -- Scheduling -----------------------------------------------------------

    /// Hand ready work to whoever drains this client: the bus FIFO for
    /// devices on a shared transport, the local worker otherwise.
    fn schedule(self: &Arc<Self>) {
        match self.device.bus() {
            Some(bus) => bus.enqueue_client(self),
            None => self.worker_wake.notify_one(),
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.worker_wake.notified() => {}
            }
            self.drain_ready().await;
        }
    }

    /// Drain everything ready, in priority order: cancellation cleanup, then
    /// transactions in submit order, then periodic ticks.
    pub async fn drain_ready(self: &Arc<Self>) {
        let _run = self.run_lock.lock().await;
        loop {
            let cancelled = self.txns.lock().cleanup_queue.pop_front();
            match cancelled {
                Some(txn) => {
                    let status = txn.cancel_status.unwrap_or(TXN_CANCELED_STATUS);
                    self.complete(txn, status);
                }
                None => break,
            }
        }
        while let Some((mut txn, cancel)) = self.pop_ready() {
            let result = self.execute_entries(&mut txn.entries, Some(&cancel)).await;
            self.txns.lock().running = None;
            let status = match result {
                Ok(ExecStatus::Done) => 0,
                Ok(ExecStatus::Cancelled) => TXN_CANCELED_STATUS,
                Err(code) => code.errno(),
            };
            self.complete(txn, status);
        }
        self.run_periodic_ticks().await;
    }

    fn pop_ready(&self) -> Option<(Transaction, Arc<AtomicBool>)> {
        let mut table = self.txns.lock();
        while let Some(id) = table.process_queue.pop_front() {
            if let Some(mut txn) = table.waiting.remove(&id) {
                txn.phase = TxnPhase::Running;
                let cancel = Arc::new(AtomicBool::new(false));
                table.running = Some(RunningTxn { id, cancel: Arc::clone(&cancel) });
                return Some((txn, cancel));
            }
        }
        None
    }

    async fn execute_entries(
        &self,
        entries: &mut [IoEntry],
        cancel: Option<&AtomicBool>,
    ) -> Result<ExecStatus, ErrorCode> {
        if self.device.is_suspended() {
            return Err(ErrorCode::Busy);
        }
        let io = self.device.reg_io()?;
        execute_io_entries(io.as_ref(), Some(self.device.ops().as_ref()), entries, cancel).await
    }

    // -- Completion -----------------------------------------------------------

    /// Emit completion events and resolve completion fences; `status` is 0 on
    /// success. Called with no short lock held.
    fn complete(self: &Arc<Self>, txn: Transaction, status: i32) {
        let response = TransactionResponse {
            id: txn.id,
            ret: status,
            results: collect_read_results(&txn.entries),
        };
        let payload = Bytes::from(serde_json::to_vec(&response).unwrap_or_default());

        if status == 0 {
            if let Some(event_id) = txn.emit_success_event_id {
                self.device.emit_event(event_id, payload.clone());
            }
        } else if let Some(event_id) = txn.emit_error_event_id {
            let accepted = self.device.emit_event(event_id, payload.clone());
            let routed_to_self = accepted.is_some() && route(self.event_flags(event_id)).is_some();
            if !routed_to_self {
                self.push_error_record(event_id, payload.clone());
            }
        } else {
            self.push_error_record(EVENT_ID_TRANSACTION_FAILURE, payload.clone());
        }

        for fd in &txn.completion_fence_fds {
            match signal_fence(&self.fences, &self.registry, *fd, status) {
                Ok(()) | Err(ErrorCode::AlreadySignaled) => {}
                Err(err) => {
                    tracing::warn!(fd = *fd, %err, "completion fence signal failed");
                }
            }
        }
        tracing::debug!(client = self.id, txn = txn.id, status, "transaction finished");
    }

    /// Failure records always reach the submitter's error queue, whatever its
    /// delivery flags say.
    fn push_error_record(&self, event_id: u64, payload: Bytes) {
        let record = EventRecord {
            event_id,
            counter: self.device.events.counter(event_id),
            timestamp_ns: self.device.clock().now_ns(),
            payload,
        };
        self.queues.lock().push(record, true);
        self.event_wake.notify_waiters();
    }

    // -- Trigger evaluation ---------------------------------------------------

    /// Apply one firing (`status == 0` for success) to a waiting transaction.
    /// Returns true when the client has new ready or cleanup work.
    fn apply_firing(self: &Arc<Self>, txn_id: TxnId, status: i32) -> bool {
        let mut table = self.txns.lock();
        let Some(txn) = table.waiting.get_mut(&txn_id) else {
            return false;
        };
        if txn.phase != TxnPhase::Waiting {
            return false;
        }
        let readiness = if status == 0 {
            txn.progress.note_ok()
        } else {
            txn.progress.note_err(status)
        };
        match readiness {
            Readiness::Pending => false,
            Readiness::Run => {
                // Under OR the other nodes may still be registered; drop
                // them so nothing fires into an executed transaction.
                self.unlink_locked(&mut table, txn_id);
                table.enqueue_ready(txn_id);
                true
            }
            Readiness::Cancel(status) => {
                self.unlink_locked(&mut table, txn_id);
                table.move_to_cleanup(txn_id, status);
                true
            }
        }
    }

    /// Remove every registration (weak event records, trigger fences) of a
    /// waiting transaction. Caller holds the transaction lock.
    fn unlink_locked(&self, table: &mut TxnTable, txn_id: TxnId) {
        for event_id in table.unregister_events(txn_id) {
            self.bump_event_enable(event_id, -1);
        }
        if let Some(txn) = table.waiting.get(&txn_id) {
            for fd in &txn.trigger_fence_fds {
                if let Ok(fence) = self.fences.get(*fd) {
                    fence.detach(self.id, txn_id);
                }
            }
        }
    }

    /// Device event emission callback. Delivers the record per this client's
    /// flags, then lets matching weak records fire. Runs synchronously on the
    /// emission path; no blocking.
    pub(crate) fn on_device_event(
        self: &Arc<Self>,
        event_id: u64,
        counter: u64,
        timestamp_ns: u64,
        payload: Bytes,
    ) {
        let flags = self.event_flags(event_id);
        if let Some(to_error) = route(flags) {
            let record = EventRecord { event_id, counter, timestamp_ns, payload };
            self.queues.lock().push(record, to_error);
            self.event_wake.notify_waiters();
        } else if flags & EVENT_FLAG_NOTIFY_ONLY != 0 {
            self.event_wake.notify_waiters();
        }

        let matched = self.txns.lock().take_matching(event_id, counter);
        if matched.is_empty() {
            return;
        }
        for _ in &matched {
            self.bump_event_enable(event_id, -1);
        }
        let mut ready = false;
        for record in matched {
            if self.apply_firing(record.txn_id, 0) {
                ready = true;
            }
        }
        if ready {
            self.schedule();
        }
    }

    /// Fence signal callback with this client's pending ids.
    pub(crate) fn on_fence_signaled(self: &Arc<Self>, txn_ids: &[TxnId], status: i32) {
        let mut ready = false;
        for txn_id in txn_ids {
            if self.apply_firing(*txn_id, status) {
                ready = true;
            }
        }
        if ready {
            self.schedule();
        }
    }

    // -- Transaction API ------------------------------------------------------

    /// Submit a transaction. Parse failures (bad fd, malformed trigger,
    /// oversized program) abort before anything registers.
    pub fn submit(self: &Arc<Self>, info: TransactionInfo) -> Result<SubmitResult, ErrorCode> {
        if !self.device.supports_io() {
            return Err(ErrorCode::NotSupported);
        }
        validate_entries(&info.entries)?;
        info.trigger.validate()?;

        // Resolve fences up front so a bad fd aborts cleanly.
        enum NodePlan {
            Event { event_id: u64, counter: u64 },
            Fence(Arc<Fence>),
        }
        let mut plans = Vec::new();
        let mut trigger_fence_fds = Vec::new();
        for node in &info.trigger.nodes {
            match node {
                TriggerNode::Event { event_id, counter } => {
                    plans.push(NodePlan::Event { event_id: *event_id, counter: *counter });
                }
                TriggerNode::Fence { fd } => {
                    plans.push(NodePlan::Fence(self.fences.get(*fd)?));
                }
                TriggerNode::NewFence => {
                    let fence = self.fences.create();
                    trigger_fence_fds.push(fence.fd());
                    plans.push(NodePlan::Fence(fence));
                }
            }
        }
        for fd in &info.completion_fence_fds {
            self.fences.get(*fd)?;
        }
        let mut completion_fence_fds = info.completion_fence_fds.clone();
        let completion_fence = if info.create_completion_fence {
            let fence = self.fences.create();
            completion_fence_fds.push(fence.fd());
            Some(fence.fd())
        } else {
            None
        };

        let num_nodes = info.trigger.nodes.len();
        let id = {
            let mut table = self.txns.lock();
            let id = table.alloc_id();
            table.waiting.insert(
                id,
                Transaction {
                    id,
                    entries: info.entries,
                    progress: TriggerProgress::new(info.trigger.op, num_nodes),
                    phase: TxnPhase::Waiting,
                    emit_success_event_id: info.emit_success_event_id,
                    emit_error_event_id: info.emit_error_event_id,
                    completion_fence_fds,
                    cancel_status: None,
                    event_nodes: Vec::new(),
                    trigger_fence_fds: Vec::new(),
                },
            );
            id
        };

        let mut needs_schedule = false;
        for plan in plans {
            match plan {
                NodePlan::Event { event_id, counter } => {
                    let registered = {
                        let mut table = self.txns.lock();
                        let alive = match table.waiting.get_mut(&id) {
                            Some(txn) if txn.phase == TxnPhase::Waiting => {
                                txn.event_nodes.push((event_id, counter));
                                true
                            }
                            _ => false,
                        };
                        if alive {
                            table.register_event(event_id, id, counter);
                        }
                        alive
                    };
                    if registered {
                        self.bump_event_enable(event_id, 1);
                    }
                }
                NodePlan::Fence(fence) => match fence.attach(self.id, id) {
                    AttachOutcome::Pending => {
                        let mut table = self.txns.lock();
                        if let Some(txn) = table.waiting.get_mut(&id) {
                            txn.trigger_fence_fds.push(fence.fd());
                        }
                    }
                    AttachOutcome::AlreadyOk => {
                        needs_schedule |= self.apply_firing(id, 0);
                    }
                    AttachOutcome::AlreadyErr(status) => {
                        needs_schedule |= self.apply_firing(id, status);
                    }
                },
            }
        }

        // Trigger-less (and fully pre-satisfied) submissions go straight to
        // the process queue.
        {
            let mut table = self.txns.lock();
            if let Some(txn) = table.waiting.get_mut(&id) {
                if txn.phase == TxnPhase::Waiting && txn.progress.readiness() == Readiness::Run {
                    table.enqueue_ready(id);
                    needs_schedule = true;
                }
            }
        }
        if needs_schedule {
            self.schedule();
        }
        Ok(SubmitResult { id, trigger_fence_fds, completion_fence_fd: completion_fence })
    }

    /// Cancel by id. Before execution this is synchronous and side-effect
    /// free on the device; mid-execution the executor stops at the next entry
    /// boundary; after completion the id is simply gone.
    pub fn cancel(self: &Arc<Self>, txn_id: TxnId) -> Result<(), ErrorCode> {
        let txn = {
            let mut table = self.txns.lock();
            if let Some(running) = &table.running {
                if running.id == txn_id {
                    running.cancel.store(true, Ordering::Release);
                    return Ok(());
                }
            }
            if !table.waiting.contains_key(&txn_id) {
                return Err(ErrorCode::NotFound);
            }
            self.unlink_locked(&mut table, txn_id);
            table.process_queue.retain(|id| *id != txn_id);
            table.waiting.remove(&txn_id)
        };
        if let Some(txn) = txn {
            for fd in &txn.completion_fence_fds {
                match signal_fence(&self.fences, &self.registry, *fd, TXN_CANCELED_STATUS) {
                    Ok(()) | Err(ErrorCode::AlreadySignaled) => {}
                    Err(err) => tracing::warn!(fd = *fd, %err, "completion fence signal failed"),
                }
            }
            tracing::debug!(client = self.id, txn = txn_id, "transaction cancelled");
        }
        Ok(())
    }

    /// Atomically supersede any waiting transaction registered on the same
    /// trigger events, then submit `info`.
    pub fn replace(self: &Arc<Self>, info: TransactionInfo) -> Result<SubmitResult, ErrorCode> {
        let mut stale: Vec<TxnId> = {
            let table = self.txns.lock();
            info.trigger
                .nodes
                .iter()
                .filter_map(|node| match node {
                    TriggerNode::Event { event_id, .. } => Some(table.ids_on_event(*event_id)),
                    _ => None,
                })
                .flatten()
                .collect()
        };
        stale.sort_unstable();
        stale.dedup();
        for txn_id in stale {
            let _ = self.cancel(txn_id);
        }
        self.submit(info)
    }

    // -- Synchronous register io ----------------------------------------------

    /// Run a program in the calling context, holding the bus mutex for
    /// devices on a shared transport. Read results land in `entries`.
    pub async fn reg_io(&self, entries: &mut [IoEntry]) -> Result<(), ErrorCode> {
        validate_entries(entries)?;
        if self.device.enable_count() == 0 {
            return Err(ErrorCode::Busy);
        }
        let _bus = match self.device.bus() {
            Some(bus) => Some(bus.lock_bus().await),
            None => None,
        };
        self.execute_entries(entries, None).await?;
        Ok(())
    }

    // -- Events ---------------------------------------------------------------

    pub fn event_flags(&self, event_id: u64) -> u32 {
        self.flags.lock().get(&event_id).copied().unwrap_or(0)
    }

    /// Update delivery flags; 0↔non-zero transitions adjust the device-level
    /// enable count and fire the event-enable hook on aggregate edges.
    pub fn event_control_set(&self, controls: &[EventControl]) {
        for control in controls {
            let old = self
                .flags
                .lock()
                .insert(control.event_id, control.flags)
                .unwrap_or(0);
            if old == 0 && control.flags != 0 {
                self.bump_event_enable(control.event_id, 1);
            } else if old != 0 && control.flags == 0 {
                self.bump_event_enable(control.event_id, -1);
            }
        }
    }

    fn bump_event_enable(&self, event_id: u64, delta: i64) {
        use crate::event::EnableTransition;
        match self.device.events.adjust_enable(event_id, delta) {
            EnableTransition::Enabled => self.device.ops().event_enable(event_id, true),
            EnableTransition::Disabled => self.device.ops().event_enable(event_id, false),
            EnableTransition::Unchanged => {}
        }
    }

    /// Non-blocking dequeue, error queue first.
    pub fn dequeue_event(&self, capacity: usize) -> Result<EventRecord, DequeueError> {
        self.queues.lock().dequeue(capacity)
    }

    /// Block until an event arrives or `timeout` elapses.
    pub async fn wait_event(&self, timeout: Duration) -> Result<EventRecord, ErrorCode> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.event_wake.notified();
            tokio::pin!(notified);
            if let Ok(record) = self.queues.lock().dequeue(usize::MAX) {
                return Ok(record);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ErrorCode::Timeout);
            }
            if tokio::time::timeout(deadline - now, &mut notified).await.is_err() {
                return Err(ErrorCode::Timeout);
            }
        }
    }

    pub fn pending_events(&self) -> usize {
        self.queues.lock().len()
    }

    // -- Device lifecycle -----------------------------------------------------

    /// Enable the device on behalf of this client. A second enable by the
    /// same client collapses to a no-op success.
    pub async fn device_enable(&self) -> Result<(), ErrorCode> {
        if self.is_enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        self.device.enable().await?;
        self.is_enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Disable: stop periodic work, wait out in-flight executions, drop the
    /// event queues, then release the device refcount.
    pub async fn device_disable(self: &Arc<Self>) -> Result<(), ErrorCode> {
        if !self.is_enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        self.cancel_all_periodic();
        {
            let _inflight = self.run_lock.lock().await;
        }
        self.queues.lock().clear();
        self.device.events.reset_disabled();
        self.device.disable().await?;
        self.is_enabled.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled.load(Ordering::Acquire)
    }

    /// Reset runs its program synchronously, but only against an enabled
    /// device; otherwise it logs and skips.
    pub async fn device_reset(&self, entries: &mut [IoEntry]) -> Result<(), ErrorCode> {
        if self.device.enable_count() == 0 {
            tracing::warn!(device = %self.device.name, "reset skipped: device not enabled");
            return Ok(());
        }
        self.reg_io(entries).await
    }

    // -- Periodic io ----------------------------------------------------------

    /// Register a periodic program; starts (or joins) the period's timer.
    pub fn periodic_submit(self: &Arc<Self>, info: PeriodicIoInfo) -> Result<u64, ErrorCode> {
        if !self.device.supports_io() {
            return Err(ErrorCode::NotSupported);
        }
        validate_entries(&info.entries)?;
        if info.period_ns == 0 || info.batch_size == 0 {
            return Err(ErrorCode::InvalidArg);
        }
        let (id, new_timer) = {
            let mut table = self.periodic.lock();
            let id = table.alloc_id();
            table.entries.insert(
                id,
                PeriodicEntry {
                    id,
                    entries: info.entries,
                    period_ns: info.period_ns,
                    batch_size: info.batch_size,
                    emit_event_id: info.emit_event_id,
                    pending_tick: false,
                    batch: Vec::new(),
                },
            );
            let new_timer = match table.timers.get_mut(&info.period_ns) {
                Some(slot) => {
                    slot.refs += 1;
                    None
                }
                None => {
                    let cancel = self.shutdown.child_token();
                    table
                        .timers
                        .insert(info.period_ns, TimerSlot { cancel: cancel.clone(), refs: 1 });
                    Some(cancel)
                }
            };
            (id, new_timer)
        };
        if let Some(cancel) = new_timer {
            self.spawn_timer(info.period_ns, cancel);
        }
        tracing::debug!(client = self.id, periodic = id, period_ns = info.period_ns, "periodic io registered");
        Ok(id)
    }

    /// Cancel by id; drops any queued tick and emits a partial batch.
    pub fn periodic_cancel(self: &Arc<Self>, id: u64) -> Result<(), ErrorCode> {
        let removed = self.periodic.lock().remove(id);
        let Some((entry, expired_timer)) = removed else {
            return Err(ErrorCode::NotFound);
        };
        if let Some(cancel) = expired_timer {
            cancel.cancel();
        }
        self.flush_periodic_batch(entry);
        Ok(())
    }

    fn cancel_all_periodic(self: &Arc<Self>) {
        let ids = self.periodic.lock().ids();
        for id in ids {
            let _ = self.periodic_cancel(id);
        }
    }

    fn flush_periodic_batch(self: &Arc<Self>, entry: PeriodicEntry) {
        if entry.batch.is_empty() {
            return;
        }
        if let Some(event_id) = entry.emit_event_id {
            let batch = PeriodicBatch { id: entry.id, ret: 0, executions: entry.batch };
            let payload = Bytes::from(serde_json::to_vec(&batch).unwrap_or_default());
            self.device.emit_event(event_id, payload);
        }
    }

    fn spawn_timer(self: &Arc<Self>, period_ns: u64, cancel: CancellationToken) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_nanos(period_ns.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Consume the interval's immediate first tick: the first
            // execution happens one period after submit.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                client.on_periodic_tick(period_ns);
            }
        });
    }

    fn on_periodic_tick(self: &Arc<Self>, period_ns: u64) {
        if self.periodic.lock().queue_ticks(period_ns) {
            self.schedule();
        }
    }

    fn pop_tick(&self) -> Option<(u64, Vec<IoEntry>)> {
        let mut table = self.periodic.lock();
        while let Some(id) = table.tick_queue.pop_front() {
            if let Some(entry) = table.entries.get_mut(&id) {
                return Some((id, std::mem::take(&mut entry.entries)));
            }
        }
        None
    }

    async fn run_periodic_ticks(self: &Arc<Self>) {
        while let Some((id, mut entries)) = self.pop_tick() {
            let result = self.execute_entries(&mut entries, None).await;
            let results = collect_read_results(&entries);
            let mut emit = None;
            let mut error = None;
            {
                let mut table = self.periodic.lock();
                if let Some(entry) = table.entries.get_mut(&id) {
                    entry.entries = entries;
                    entry.pending_tick = false;
                    match result {
                        Ok(_) => {
                            entry.batch.push(results);
                            if entry.batch.len() >= entry.batch_size {
                                let executions = std::mem::take(&mut entry.batch);
                                if let Some(event_id) = entry.emit_event_id {
                                    let batch = PeriodicBatch { id, ret: 0, executions };
                                    emit = Some((event_id, batch));
                                }
                            }
                        }
                        Err(code) => {
                            let batch =
                                PeriodicBatch { id, ret: code.errno(), executions: vec![results] };
                            error = Some(batch);
                        }
                    }
                }
            }
            if let Some((event_id, batch)) = emit {
                let payload = Bytes::from(serde_json::to_vec(&batch).unwrap_or_default());
                self.device.emit_event(event_id, payload);
            }
            if let Some(batch) = error {
                let payload = Bytes::from(serde_json::to_vec(&batch).unwrap_or_default());
                self.push_error_record(EVENT_ID_PERIODIC_IO_FAILURE, payload);
            }
        }
    }

    // -- Teardown -------------------------------------------------------------

    /// Cancel all outstanding work and detach from the device and registry.
    pub async fn disconnect(self: &Arc<Self>) {
        self.cancel_all_periodic();
        let waiting: Vec<TxnId> = self.txns.lock().waiting.keys().copied().collect();
        for txn_id in waiting {
            let _ = self.cancel(txn_id);
        }
        {
            let _inflight = self.run_lock.lock().await;
        }
        self.shutdown.cancel();
        self.device.detach_client(self.id);
        self.registry.remove(self.id);
        tracing::debug!(client = self.id, device = %self.device.name, "client disconnected");
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
