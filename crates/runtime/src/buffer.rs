// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client buffer tables.
//!
//! The real enrollment/allocation machinery (dma-buf, IOMMU mapping) is an
//! external collaborator; the runtime tracks handles so command semantics
//! (double-enroll, unknown-handle, cpu-access on a freed buffer) are
//! enforceable and observable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Direction flags for cpu-access begin/end.
pub const CPU_ACCESS_READ: u32 = 1 << 0;
pub const CPU_ACCESS_WRITE: u32 = 1 << 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledBuffer {
    pub handle: u64,
    pub dma_addr: u64,
    pub flags: u32,
}

pub struct AllocatedBuffer {
    pub handle: u64,
    pub data: Vec<u8>,
    pub flags: u32,
}

/// Enrolled + allocated buffer handles of one client.
#[derive(Default)]
pub struct BufferTable {
    next_handle: u64,
    next_dma_addr: u64,
    enrolled: HashMap<u64, EnrolledBuffer>,
    allocated: HashMap<u64, AllocatedBuffer>,
}

impl BufferTable {
    /// Enroll an externally allocated buffer; returns its device address.
    pub fn enroll(&mut self, handle: u64, flags: u32) -> Result<u64, ErrorCode> {
        if self.enrolled.contains_key(&handle) {
            return Err(ErrorCode::Busy);
        }
        // Synthetic address space: 4K-aligned, never reused within a client.
        self.next_dma_addr += 0x1000;
        let dma_addr = self.next_dma_addr;
        self.enrolled.insert(handle, EnrolledBuffer { handle, dma_addr, flags });
        Ok(dma_addr)
    }

    pub fn disenroll(&mut self, dma_addr: u64) -> Result<(), ErrorCode> {
        let handle = self
            .enrolled
            .values()
            .find(|buf| buf.dma_addr == dma_addr)
            .map(|buf| buf.handle)
            .ok_or(ErrorCode::NotFound)?;
        self.enrolled.remove(&handle);
        Ok(())
    }

    /// Allocate a runtime-owned buffer; returns a fresh handle.
    pub fn alloc(&mut self, size: usize, flags: u32) -> Result<u64, ErrorCode> {
        if size == 0 {
            return Err(ErrorCode::InvalidArg);
        }
        self.next_handle += 1;
        let handle = self.next_handle;
        self.allocated.insert(handle, AllocatedBuffer { handle, data: vec![0; size], flags });
        Ok(handle)
    }

    pub fn free(&mut self, handle: u64) -> Result<(), ErrorCode> {
        self.allocated.remove(&handle).map(|_| ()).ok_or(ErrorCode::NotFound)
    }

    /// Validate a cpu-access request against a live allocation.
    pub fn cpu_access(&self, handle: u64, flags: u32) -> Result<(), ErrorCode> {
        if flags & (CPU_ACCESS_READ | CPU_ACCESS_WRITE) == 0 {
            return Err(ErrorCode::InvalidArg);
        }
        if self.allocated.contains_key(&handle) || self.enrolled.contains_key(&handle) {
            Ok(())
        } else {
            Err(ErrorCode::NotFound)
        }
    }

    pub fn enrolled_count(&self) -> usize {
        self.enrolled.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
