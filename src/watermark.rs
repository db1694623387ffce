use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct WatermarkState {
    head: Option<u64>,
    closed: bool,
}

/// The monotonically advancing head sequence number of the dispatch
/// queue, plus a wait primitive.
///
/// This is the only ordering primitive partition readers use to discover
/// new work: the dispatcher calls [`set`](Watermark::set) after routing
/// each event, and a reader gated behind a critical section waits here
/// for the section's closing seqno to have been ingested before it
/// consults the section gate.
///
/// The head never decreases. `set` with a smaller value is a no-op, so a
/// late caller cannot move other waiters backwards.
#[derive(Debug, Default)]
pub struct Watermark {
    state: Mutex<WatermarkState>,
    advanced: Condvar,
}

impl Watermark {
    /// A watermark that has not observed any seqno yet.
    pub fn new() -> Watermark {
        Watermark::default()
    }

    /// Advance the head to `seqno` if that is an advance; wake all
    /// waiters either way.
    pub fn set(&self, seqno: u64) {
        let mut state = self.state.lock();
        if state.head.map_or(true, |h| seqno > h) {
            state.head = Some(seqno);
            self.advanced.notify_all();
        }
    }

    /// Snapshot of the head; `None` before the first `set`.
    pub fn get(&self) -> Option<u64> {
        self.state.lock().head
    }

    /// Block until the head is at least `seqno`, returning the head
    /// observed. Returns [`Error::Canceled`] once the watermark has been
    /// closed, even if the target was never reached.
    pub fn wait_until(&self, seqno: u64) -> Result<u64> {
        let mut state = self.state.lock();
        loop {
            if let Some(head) = state.head {
                if head >= seqno {
                    return Ok(head);
                }
            }
            if state.closed {
                return Err(Error::Canceled);
            }
            self.advanced.wait(&mut state);
        }
    }

    /// Latch the closed flag and wake all waiters. Idempotent; the head
    /// itself is never corrupted by closing.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.advanced.notify_all();
    }
}
