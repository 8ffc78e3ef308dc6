//! Worker status and engine events for UI consumers.
//!
//! Instead of listener interfaces, the engine publishes to a bounded
//! channel; a slow consumer drops events rather than stalling uploads.

use std::sync::Mutex;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};

use tracing::*;

use crate::hashing::ObjSeq;
use crate::store::SnapshotKind;

/// What one worker thread is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Scanning,
    Uploading,
    Finishing,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Name of the object being worked on.
    pub object: String,
    /// Progress fraction for multi-chunk files.
    pub fraction: Option<f64>,
}

/// Per-worker status slots, polled by UIs.
#[derive(Default)]
pub struct StatusBoard {
    slots: Mutex<Vec<WorkerStatus>>,
}

impl StatusBoard {
    pub fn set(&self, ndx: usize, state: WorkerState, object: &str, fraction: Option<f64>) {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() <= ndx {
            slots.resize(ndx + 1, WorkerStatus::default());
        }
        slots[ndx] = WorkerStatus {
            state,
            object: object.to_owned(),
            fraction,
        };
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.slots.lock().unwrap().clone()
    }
}

/// Events published by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A root hash became publishable. The committer assembles the device
    /// root and posts the history entry in response.
    Snapshot {
        kind: SnapshotKind,
        root: ObjSeq,
        treesize: u64,
    },
    /// The work queue drained and every worker went idle.
    RunFinished { cancelled: bool },
}

#[derive(Clone)]
pub struct EventSink {
    tx: SyncSender<Event>,
}

pub fn channel() -> (EventSink, Receiver<Event>) {
    let (tx, rx) = sync_channel(64);
    (EventSink { tx }, rx)
}

impl EventSink {
    pub fn publish(&self, ev: Event) {
        match self.tx.try_send(ev) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => trace!("Dropping event for slow consumer: {ev:?}"),
            // Nobody listening is fine.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_board_grows_on_demand() {
        let board = StatusBoard::default();
        board.set(2, WorkerState::Scanning, "some/dir", None);
        let slots = board.snapshot();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].state, WorkerState::Idle);
        assert_eq!(slots[2].state, WorkerState::Scanning);
        assert_eq!(slots[2].object, "some/dir");
    }

    #[test]
    fn events_flow_and_overflow_quietly() {
        let (sink, rx) = channel();
        for _ in 0..100 {
            sink.publish(Event::RunFinished { cancelled: false });
        }
        // The bounded channel kept the first 64 and dropped the rest.
        assert_eq!(rx.try_iter().count(), 64);
    }
}
