// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory register back-end.
//!
//! Backs virtual and test devices with a sparse byte-addressed register file.
//! [`SlowRegisterIo`] wraps any back-end with a per-access delay and a shared
//! access journal, which is how the bus-serialization behavior is observed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ErrorCode;
use crate::hal::{AccessSize, RegisterIo};

/// Sparse little-endian register file. Unwritten bytes read as zero.
#[derive(Default)]
pub struct MemRegisterIo {
    bytes: Mutex<HashMap<u64, u8>>,
}

impl MemRegisterIo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a register value, little-endian at `offset`.
    pub fn preset(&self, offset: u64, value: u64, size: AccessSize) {
        let mut bytes = self.bytes.lock();
        for i in 0..size.bytes() {
            bytes.insert(offset + i as u64, (value >> (8 * i)) as u8);
        }
    }

    fn load(&self, offset: u64, size: AccessSize) -> u64 {
        let bytes = self.bytes.lock();
        let mut value = 0u64;
        for i in 0..size.bytes() {
            let b = *bytes.get(&(offset + i as u64)).unwrap_or(&0);
            value |= (b as u64) << (8 * i);
        }
        value
    }

    fn store(&self, offset: u64, value: u64, size: AccessSize) {
        let mut bytes = self.bytes.lock();
        for i in 0..size.bytes() {
            bytes.insert(offset + i as u64, (value >> (8 * i)) as u8);
        }
    }
}

#[async_trait]
impl RegisterIo for MemRegisterIo {
    async fn read(&self, offset: u64, size: AccessSize) -> Result<u64, ErrorCode> {
        Ok(self.load(offset, size))
    }

    async fn write(&self, offset: u64, value: u64, size: AccessSize) -> Result<(), ErrorCode> {
        self.store(offset, value & size.mask(), size);
        Ok(())
    }

    async fn read_block(&self, offset: u64, buf: &mut [u8]) -> Result<(), ErrorCode> {
        let bytes = self.bytes.lock();
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = *bytes.get(&(offset + i as u64)).unwrap_or(&0);
        }
        Ok(())
    }

    async fn write_block(&self, offset: u64, data: &[u8]) -> Result<(), ErrorCode> {
        let mut bytes = self.bytes.lock();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(offset + i as u64, *b);
        }
        Ok(())
    }
}

// -- Access journaling ---------------------------------------------------------

/// One recorded register access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    /// Tag of the back-end that performed the access (usually the device name).
    pub tag: String,
    pub offset: u64,
    pub value: u64,
    pub write: bool,
}

/// Journal shared between back-ends so cross-device ordering is observable.
pub type AccessJournal = Arc<Mutex<Vec<AccessRecord>>>;

pub fn new_journal() -> AccessJournal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Wraps a back-end with a fixed per-access latency and journaling.
///
/// The latency models a slow shared transport; two devices wrapping the same
/// journal expose any interleaving of their programs.
pub struct SlowRegisterIo {
    inner: Arc<dyn RegisterIo>,
    tag: String,
    delay: Duration,
    journal: AccessJournal,
}

impl SlowRegisterIo {
    pub fn new(
        inner: Arc<dyn RegisterIo>,
        tag: impl Into<String>,
        delay: Duration,
        journal: AccessJournal,
    ) -> Arc<Self> {
        Arc::new(Self { inner, tag: tag.into(), delay, journal })
    }

    fn record(&self, offset: u64, value: u64, write: bool) {
        self.journal.lock().push(AccessRecord { tag: self.tag.clone(), offset, value, write });
    }
}

#[async_trait]
impl RegisterIo for SlowRegisterIo {
    async fn read(&self, offset: u64, size: AccessSize) -> Result<u64, ErrorCode> {
        tokio::time::sleep(self.delay).await;
        let value = self.inner.read(offset, size).await?;
        self.record(offset, value, false);
        Ok(value)
    }

    async fn write(&self, offset: u64, value: u64, size: AccessSize) -> Result<(), ErrorCode> {
        tokio::time::sleep(self.delay).await;
        self.inner.write(offset, value, size).await?;
        self.record(offset, value, true);
        Ok(())
    }

    async fn read_block(&self, offset: u64, buf: &mut [u8]) -> Result<(), ErrorCode> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_block(offset, buf).await?;
        self.record(offset, buf.len() as u64, false);
        Ok(())
    }

    async fn write_block(&self, offset: u64, data: &[u8]) -> Result<(), ErrorCode> {
        tokio::time::sleep(self.delay).await;
        self.inner.write_block(offset, data).await?;
        self.record(offset, data.len() as u64, true);
        Ok(())
    }

    fn native_size(&self) -> AccessSize {
        self.inner.native_size()
    }
}

#[cfg(test)]
#[path = "mem_tests.rs"]
mod tests;
