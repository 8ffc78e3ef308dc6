//! Performance counters: count how often the engine takes each shortcut.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::*;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    DirTraversalSkipped,
    FileUnchanged,
    DirObjectReused,
    HeadPresent,
    HeadAbsent,
    ObjectUpload,
    GreyListRefresh,
    GreyListExpiry,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at program exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::DirTraversalSkipped => "directory traversals skipped",
        Op::FileUnchanged => "unchanged files reused",
        Op::DirObjectReused => "directory objects reused",
        Op::HeadPresent => "objects already on the server",
        Op::HeadAbsent => "objects the server lacked",
        Op::ObjectUpload => "objects uploaded",
        Op::GreyListRefresh => "grey-list refreshes",
        Op::GreyListExpiry => "grey-list expiries",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}
