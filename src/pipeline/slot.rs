//! Single-slot holder for the newest encoded preview frame
//!
//! Backed by a `tokio::sync::watch` channel: one value behind a lock plus a
//! broadcast wake. Publishing overwrites whatever is resident, so viewers that
//! miss a frame simply wait for the next one. Closing the slot wakes every
//! waiter with end-of-stream.

use bytes::Bytes;
use chrono::{DateTime, Local};
use tokio::sync::watch;

/// One encoded preview frame.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    /// Publish sequence number, strictly increasing per slot
    pub sequence: u64,
    pub jpeg: Bytes,
    pub captured_at: DateTime<Local>,
}

#[derive(Debug, Default)]
struct SlotState {
    latest: Option<PreviewFrame>,
    published: u64,
    closed: bool,
}

/// Overwrite-always latest-frame cell shared between the transcoder and viewers.
#[derive(Debug)]
pub struct PreviewSlot {
    tx: watch::Sender<SlotState>,
}

impl Default for PreviewSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SlotState::default());
        Self { tx }
    }

    /// Replace the resident frame and wake every subscriber.
    ///
    /// Returns the sequence number assigned, or `None` once the slot is closed.
    pub fn publish(&self, jpeg: Bytes, captured_at: DateTime<Local>) -> Option<u64> {
        let mut assigned = None;
        self.tx.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.published += 1;
            state.latest = Some(PreviewFrame {
                sequence: state.published,
                jpeg,
                captured_at,
            });
            assigned = Some(state.published);
            true
        });
        assigned
    }

    /// Mark end-of-stream. Waiters wake and observe `None`; later publishes
    /// are ignored.
    pub fn close(&self) {
        self.tx.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.closed = true;
            state.latest = None;
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    /// The resident frame, if any.
    pub fn latest(&self) -> Option<PreviewFrame> {
        self.tx.borrow().latest.clone()
    }

    /// Subscribe to future publishes. The currently resident frame counts as
    /// already seen.
    pub fn subscribe(&self) -> PreviewSubscriber {
        let rx = self.tx.subscribe();
        let last_seen = rx.borrow().published;
        PreviewSubscriber { rx, last_seen }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A viewer's handle on the slot.
#[derive(Debug)]
pub struct PreviewSubscriber {
    rx: watch::Receiver<SlotState>,
    last_seen: u64,
}

impl PreviewSubscriber {
    /// Wait for a frame newer than the last one returned.
    ///
    /// Returns `None` when the slot is closed or dropped.
    pub async fn next_frame(&mut self) -> Option<PreviewFrame> {
        loop {
            {
                let state = self.rx.borrow_and_update();
                if state.closed {
                    return None;
                }
                if let Some(frame) = &state.latest {
                    if frame.sequence > self.last_seen {
                        self.last_seen = frame.sequence;
                        return Some(frame.clone());
                    }
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }
}
