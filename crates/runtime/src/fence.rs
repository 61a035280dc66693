// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fences: shareable, signal-once status handles.
//!
//! A fence starts unsignaled and transitions exactly once to a final status
//! (`0` for success, a negative errno for failure). Transactions waiting on a
//! fence are tracked as `(client, transaction-id)` buckets of plain ids,
//! never owning references, handed back to the caller on signal for trigger
//! re-evaluation. Fds are runtime-scoped handles allocated by [`FenceTable`];
//! binding them to process file descriptors is the external channel glue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::ErrorCode;
use crate::{ClientId, TxnId};

/// Buckets drained from a fence at signal time: per-client pending ids.
pub type DrainedBuckets = Vec<(ClientId, Vec<TxnId>)>;

/// Outcome of attaching a transaction to a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The fence is pending; the transaction will be re-evaluated on signal.
    Pending,
    /// Already signaled ok; treat the predicate as satisfied.
    AlreadyOk,
    /// Already signaled with an error status.
    AlreadyErr(i32),
}

#[derive(Debug)]
struct FenceInner {
    status: Option<i32>,
    buckets: HashMap<ClientId, Vec<TxnId>>,
}

/// A signal-once status handle.
#[derive(Debug)]
pub struct Fence {
    fd: u32,
    inner: Mutex<FenceInner>,
    tx: watch::Sender<Option<i32>>,
}

impl Fence {
    fn new(fd: u32) -> Arc<Self> {
        let (tx, _) = watch::channel(None);
        Arc::new(Self {
            fd,
            inner: Mutex::new(FenceInner { status: None, buckets: HashMap::new() }),
            tx,
        })
    }

    pub fn fd(&self) -> u32 {
        self.fd
    }

    /// Non-blocking status read. `None` while unsignaled.
    pub fn status(&self) -> Option<i32> {
        self.inner.lock().status
    }

    /// True once the fence holds a final status (the poll contract).
    pub fn is_signaled(&self) -> bool {
        self.status().is_some()
    }

    /// Transition unsignaled → `status`, waking waiters and draining the
    /// dependent-transaction buckets for the caller to dispatch.
    pub fn signal(&self, status: i32) -> Result<DrainedBuckets, ErrorCode> {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.status.is_some() {
                return Err(ErrorCode::AlreadySignaled);
            }
            inner.status = Some(status);
            inner.buckets.drain().collect::<Vec<_>>()
        };
        self.tx.send_replace(Some(status));
        Ok(drained)
    }

    /// Observe status transitions without holding the fence alive. Used by
    /// the external poll glue.
    pub fn subscribe(&self) -> watch::Receiver<Option<i32>> {
        self.tx.subscribe()
    }

    /// Wait until the fence signals; returns the final status.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(status) = *rx.borrow_and_update() {
                return status;
            }
            if rx.changed().await.is_err() {
                // Sender gone: drop path already published a final status.
                return self.status().unwrap_or(ErrorCode::Faulted.errno());
            }
        }
    }

    /// Register a pending transaction, or report the already-signaled status.
    pub fn attach(&self, client: ClientId, txn: TxnId) -> AttachOutcome {
        let mut inner = self.inner.lock();
        match inner.status {
            Some(0) => AttachOutcome::AlreadyOk,
            Some(err) => AttachOutcome::AlreadyErr(err),
            None => {
                inner.buckets.entry(client).or_default().push(txn);
                AttachOutcome::Pending
            }
        }
    }

    /// Unlink a pending transaction (cancellation path).
    pub fn detach(&self, client: ClientId, txn: TxnId) {
        let mut inner = self.inner.lock();
        if let Some(bucket) = inner.buckets.get_mut(&client) {
            bucket.retain(|id| *id != txn);
            if bucket.is_empty() {
                inner.buckets.remove(&client);
            }
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // Releasing an unsignaled fence is a client-side bug: waiters would
        // hang forever, so fail them and log it.
        let unsignaled = self.inner.lock().status.is_none();
        if unsignaled {
            tracing::warn!(fd = self.fd, "fence dropped while unsignaled");
            self.tx.send_replace(Some(ErrorCode::Faulted.errno()));
        }
    }
}

// -- Fd table ------------------------------------------------------------------

/// Registry of live fences, keyed by runtime-scoped fd.
#[derive(Default)]
pub struct FenceTable {
    next_fd: AtomicU32,
    fences: RwLock<HashMap<u32, Arc<Fence>>>,
}

impl FenceTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { next_fd: AtomicU32::new(1), fences: RwLock::new(HashMap::new()) })
    }

    /// Allocate a fresh unsignaled fence and hand out its fd.
    pub fn create(&self) -> Arc<Fence> {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        let fence = Fence::new(fd);
        self.fences.write().insert(fd, Arc::clone(&fence));
        fence
    }

    pub fn get(&self, fd: u32) -> Result<Arc<Fence>, ErrorCode> {
        self.fences.read().get(&fd).cloned().ok_or(ErrorCode::BadFd)
    }

    /// Drop the table's reference. The fence object survives as long as any
    /// attached transaction or waiter still holds it.
    pub fn close(&self, fd: u32) -> Result<(), ErrorCode> {
        self.fences.write().remove(&fd).map(|_| ()).ok_or(ErrorCode::BadFd)
    }

    pub fn len(&self) -> usize {
        self.fences.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.read().is_empty()
    }
}

#[cfg(test)]
#[path = "fence_tests.rs"]
mod tests;
