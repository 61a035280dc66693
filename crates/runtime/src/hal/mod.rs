// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hardware abstraction seams.
//!
//! The runtime never talks to hardware directly: every register access goes
//! through a device's [`RegisterIo`] capability, and device-class specific
//! behavior (power hooks, event routing to hardware, memory barriers) hangs
//! off [`DeviceOps`]. Production back-ends (MMIO blocks, I²C adapters, SPI
//! controllers) live outside this crate; the in-memory back-end in
//! [`mem`](crate::hal::mem) exists for virtual devices and tests.

pub mod mem;

use async_trait::async_trait;

use crate::error::ErrorCode;

/// Width of a single register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccessSize {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
}

impl AccessSize {
    pub fn bytes(&self) -> usize {
        match self {
            Self::Bits8 => 1,
            Self::Bits16 => 2,
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }

    /// Value mask for this width.
    pub fn mask(&self) -> u64 {
        match self {
            Self::Bits8 => 0xff,
            Self::Bits16 => 0xffff,
            Self::Bits32 => 0xffff_ffff,
            Self::Bits64 => u64::MAX,
        }
    }
}

/// Register access capability of one device.
///
/// A call may suspend (an I²C transfer blocks on the adapter); callers must
/// not hold short locks across these methods.
#[async_trait]
pub trait RegisterIo: Send + Sync {
    /// Read a single value of `size` at `offset`.
    async fn read(&self, offset: u64, size: AccessSize) -> Result<u64, ErrorCode>;

    /// Write a single value of `size` at `offset`.
    async fn write(&self, offset: u64, value: u64, size: AccessSize) -> Result<(), ErrorCode>;

    /// Read `buf.len()` bytes starting at `offset`.
    async fn read_block(&self, offset: u64, buf: &mut [u8]) -> Result<(), ErrorCode>;

    /// Write `data` starting at `offset`.
    async fn write_block(&self, offset: u64, data: &[u8]) -> Result<(), ErrorCode>;

    /// The access width used when an io-entry does not name one.
    fn native_size(&self) -> AccessSize {
        AccessSize::Bits32
    }
}

/// Device-class hooks invoked by the runtime on lifecycle and event edges.
///
/// All methods have no-op defaults; virtual devices install nothing.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    /// Power up / prepare the device. Called on the 0→1 enable transition.
    async fn enable(&self) -> Result<(), ErrorCode> {
        Ok(())
    }

    /// Power down the device. Called on the 1→0 enable transition.
    async fn disable(&self) -> Result<(), ErrorCode> {
        Ok(())
    }

    /// Aggregate enable state for `event_id` changed (first enable or last
    /// disable across all clients).
    fn event_enable(&self, _event_id: u64, _enabled: bool) {}

    /// An event was accepted and counted. Runs on the emission path; must not
    /// block.
    fn event_emitted(&self, _event_id: u64, _counter: u64) {}

    /// Memory-barrier bracket around an io-entry program.
    fn io_barrier(&self, _read: bool, _write: bool) {}
}

/// Hooks that do nothing; used where a device needs ops identity but no
/// behavior.
pub struct NopDeviceOps;

#[async_trait]
impl DeviceOps for NopDeviceOps {}
