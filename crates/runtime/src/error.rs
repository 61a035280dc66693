// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes shared across the command channel and all subsystems.
///
/// Command handlers surface these as a negative `ret` in the packet result so
/// a chain keeps processing after a per-packet failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    InvalidArg,
    NoMemory,
    Overflow,
    Busy,
    Timeout,
    AlreadySignaled,
    BadFd,
    NotSupported,
    Faulted,
}

impl ErrorCode {
    /// Errno-style integer used as the `ret` field of a command result and as
    /// a fence error status.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => -2,
            Self::InvalidArg => -22,
            Self::NoMemory => -12,
            Self::Overflow => -75,
            Self::Busy => -16,
            Self::Timeout => -110,
            Self::AlreadySignaled => -114,
            Self::BadFd => -9,
            Self::NotSupported => -95,
            Self::Faulted => -14,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidArg => "INVALID_ARG",
            Self::NoMemory => "NO_MEMORY",
            Self::Overflow => "OVERFLOW",
            Self::Busy => "BUSY",
            Self::Timeout => "TIMEOUT",
            Self::AlreadySignaled => "ALREADY_SIGNALED",
            Self::BadFd => "BAD_FD",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Faulted => "FAULTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
