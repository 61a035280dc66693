// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for end-to-end scenario tests.
//!
//! Builds runtimes with observable back-ends: devices on a simulated shared
//! bus record every register access into one journal, so cross-device
//! ordering is checkable from the outside.

use std::sync::Arc;
use std::time::Duration;

use regmux::hal::mem::{new_journal, AccessJournal, MemRegisterIo, SlowRegisterIo};
use regmux::{DeviceType, Runtime};

/// A runtime with two I²C devices sharing one bus, their accesses journaled.
pub struct SharedBusRig {
    pub runtime: Arc<Runtime>,
    pub journal: AccessJournal,
    pub device_a: regmux::DeviceId,
    pub device_b: regmux::DeviceId,
}

/// Build two devices on the bus `i2c-0`, each access taking `delay`.
pub fn shared_bus_rig(delay: Duration) -> SharedBusRig {
    let runtime = Runtime::new();
    let journal = new_journal();

    let mut ids = Vec::new();
    for name in ["led-a", "led-b"] {
        let backing = SlowRegisterIo::new(MemRegisterIo::new(), name, delay, journal.clone());
        let device = runtime.add_device(
            name,
            DeviceType::I2c,
            Some(backing),
            None,
            Some("i2c-0"),
            Vec::new(),
            Vec::new(),
            0,
        );
        ids.push(device.id);
    }

    SharedBusRig { runtime, journal, device_a: ids[0], device_b: ids[1] }
}

/// Check that all accesses of each tag form one contiguous run in the
/// journal: programs on a shared bus never interleave.
pub fn assert_no_interleaving(journal: &AccessJournal) {
    let log = journal.lock();
    let mut seen_complete: Vec<&str> = Vec::new();
    let mut current: Option<&str> = None;
    for record in log.iter() {
        let tag = record.tag.as_str();
        if current != Some(tag) {
            assert!(
                !seen_complete.contains(&tag),
                "accesses of {tag} interleave with another device's program: {log:?}"
            );
            if let Some(prev) = current.take() {
                seen_complete.push(prev);
            }
            current = Some(tag);
        }
    }
}
