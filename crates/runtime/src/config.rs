// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceType;
use crate::error::ErrorCode;

/// Configuration for the regmux runtime binary.
#[derive(Debug, Clone, clap::Parser)]
pub struct RuntimeArgs {
    /// Path to the topology JSON file (buses and devices).
    #[arg(long, env = "REGMUX_TOPOLOGY")]
    pub topology: PathBuf,

    /// Command script to run against the brought-up topology.
    #[arg(long, env = "REGMUX_SCRIPT")]
    pub script: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, env = "REGMUX_LOG_JSON")]
    pub log_json: bool,
}

/// One shared transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSpec {
    pub name: String,
    /// Simulated per-access latency of the transport, in microseconds.
    #[serde(default)]
    pub transfer_delay_us: u64,
}

/// One mediated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceType,
    /// Name of the shared bus this device hangs off, if any.
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default)]
    pub clocks: Vec<String>,
    #[serde(default)]
    pub regs: Vec<String>,
    #[serde(default)]
    pub priority: u32,
}

/// The device/bus layout the runtime mediates. Probing, clock trees, pin
/// control and the rest of platform bring-up live in the configuration
/// collaborator; this is only what the mediation core needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub buses: Vec<BusSpec>,
    pub devices: Vec<DeviceSpec>,
}

impl Topology {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let topology: Topology = serde_json::from_str(&contents)?;
        Ok(topology)
    }

    pub fn validate(&self) -> Result<(), ErrorCode> {
        let mut names = std::collections::HashSet::new();
        for bus in &self.buses {
            if !names.insert(bus.name.as_str()) {
                return Err(ErrorCode::InvalidArg);
            }
        }
        let mut device_names = std::collections::HashSet::new();
        for device in &self.devices {
            if !device_names.insert(device.name.as_str()) {
                return Err(ErrorCode::InvalidArg);
            }
            if let Some(bus) = &device.bus {
                if !self.buses.iter().any(|spec| &spec.name == bus) {
                    return Err(ErrorCode::NotFound);
                }
            }
            // Shared-transport devices must name their bus.
            if device.kind == DeviceType::I2c && device.bus.is_none() {
                return Err(ErrorCode::InvalidArg);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
