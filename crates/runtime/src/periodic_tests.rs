// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tokio_util::sync::CancellationToken;

use super::{PeriodicEntry, PeriodicTable, TimerSlot};

fn entry(id: u64, period_ns: u64) -> PeriodicEntry {
    PeriodicEntry {
        id,
        entries: Vec::new(),
        period_ns,
        batch_size: 1,
        emit_event_id: None,
        pending_tick: false,
        batch: Vec::new(),
    }
}

#[test]
fn ticks_queue_only_idle_entries_of_the_period() {
    let mut table = PeriodicTable::default();
    table.entries.insert(1, entry(1, 100));
    table.entries.insert(2, entry(2, 100));
    table.entries.insert(3, entry(3, 500));

    assert!(table.queue_ticks(100));
    assert_eq!(table.tick_queue.len(), 2);

    // Entry 1 and 2 are pending; a second tick of the same period queues
    // nothing new.
    assert!(!table.queue_ticks(100));
    assert_eq!(table.tick_queue.len(), 2);

    assert!(table.queue_ticks(500));
    assert_eq!(table.tick_queue.len(), 3);
}

#[test]
fn remove_drops_queued_tick_and_releases_last_timer() {
    let mut table = PeriodicTable::default();
    table.entries.insert(1, entry(1, 100));
    table.entries.insert(2, entry(2, 100));
    table.timers.insert(100, TimerSlot { cancel: CancellationToken::new(), refs: 2 });
    table.queue_ticks(100);

    let (_, expired) = table.remove(1).unwrap();
    assert!(expired.is_none(), "timer still has one user");
    assert_eq!(table.tick_queue.len(), 1);

    let (_, expired) = table.remove(2).unwrap();
    assert!(expired.is_some(), "last user releases the timer");
    assert!(table.tick_queue.is_empty());
    assert!(table.timers.is_empty());
}

#[test]
fn remove_unknown_id_is_none() {
    let mut table = PeriodicTable::default();
    assert!(table.remove(9).is_none());
}
