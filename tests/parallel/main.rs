//! Multithreaded scenario tests for the dispatch queue and the stage
//! loop, plus the shared fixtures they drive.

mod ordering;
mod stage;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use replicore::{
    Applier, CancelToken, Error, EventHeader, Extractor, Payload, ReplEvent, Result,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn data_event(seqno: u64) -> ReplEvent {
    ReplEvent::new(
        seqno,
        format!("binlog.000001:{seqno}"),
        Payload::Statement(format!("insert into t values ({seqno})")),
    )
}

/// One step a [`TestExtractor`] performs.
pub enum Feed {
    /// Hand out an event.
    Event(ReplEvent),
    /// Fail the extract call.
    Fail(String),
    /// Latch the cancel token mid-stream and report an empty poll.
    Cancel,
}

/// An extractor over a fixed script. When the script runs dry it
/// latches the cancel token, the way a real extractor surfaces a closed
/// upstream, so stage loops driven by it exit at the next iteration.
pub struct TestExtractor {
    feed: VecDeque<Feed>,
    cancel_when_drained: CancelToken,
}

impl TestExtractor {
    pub fn new(events: impl IntoIterator<Item = ReplEvent>, cancel: CancelToken) -> TestExtractor {
        TestExtractor {
            feed: events.into_iter().map(Feed::Event).collect(),
            cancel_when_drained: cancel,
        }
    }

    pub fn scripted(feed: impl IntoIterator<Item = Feed>, cancel: CancelToken) -> TestExtractor {
        TestExtractor {
            feed: feed.into_iter().collect(),
            cancel_when_drained: cancel,
        }
    }
}

impl Extractor for TestExtractor {
    fn extract(&mut self) -> Result<Option<ReplEvent>> {
        match self.feed.pop_front() {
            Some(Feed::Event(event)) => Ok(Some(event)),
            Some(Feed::Fail(message)) => Err(Error::Extraction {
                message,
                source: None,
            }),
            Some(Feed::Cancel) => {
                self.cancel_when_drained.cancel();
                Ok(None)
            }
            None => {
                self.cancel_when_drained.cancel();
                Ok(None)
            }
        }
    }

    fn has_more(&self) -> bool {
        !self.feed.is_empty()
    }
}

/// Every call a [`RecordingApplier`] observes, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplierCall {
    Apply {
        seqno: u64,
        commit: bool,
        rollback: bool,
        /// `(from, to)` seqnos when the event is a filtered-range
        /// stand-in.
        filtered: Option<(u64, u64)>,
    },
    Commit,
    Rollback,
    Position {
        seqno: u64,
        commit: bool,
        recoverable: bool,
    },
}

/// An applier that records every call and can be scripted to fail on
/// chosen seqnos.
#[derive(Clone, Default)]
pub struct RecordingApplier {
    calls: Arc<Mutex<Vec<ApplierCall>>>,
    fail_on: Arc<Mutex<Vec<u64>>>,
}

impl RecordingApplier {
    pub fn new() -> RecordingApplier {
        RecordingApplier::default()
    }

    /// Fail the first apply of each listed seqno.
    pub fn fail_on(self, seqnos: impl IntoIterator<Item = u64>) -> RecordingApplier {
        self.fail_on.lock().unwrap().extend(seqnos);
        self
    }

    pub fn calls(&self) -> Vec<ApplierCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The commit flags of the apply calls, in order.
    pub fn commit_flags(&self) -> Vec<bool> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApplierCall::Apply { commit, .. } => Some(commit),
                _ => None,
            })
            .collect()
    }
}

impl Applier for RecordingApplier {
    fn apply(&mut self, event: &ReplEvent, commit: bool, rollback: bool, _sync_thl: bool) -> Result<()> {
        {
            let mut fail_on = self.fail_on.lock().unwrap();
            if let Some(at) = fail_on.iter().position(|s| *s == event.seqno()) {
                fail_on.remove(at);
                return Err(Error::application(
                    event.seqno(),
                    event.event_id(),
                    "injected apply failure",
                ));
            }
        }
        let filtered = match event.payload() {
            Payload::FilteredRange { from, to } => Some((from.seqno, to.seqno)),
            _ => None,
        };
        self.calls.lock().unwrap().push(ApplierCall::Apply {
            seqno: event.seqno(),
            commit,
            rollback,
            filtered,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push(ApplierCall::Commit);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push(ApplierCall::Rollback);
        Ok(())
    }

    fn update_position(&mut self, header: &EventHeader, commit: bool, recoverable: bool) -> Result<()> {
        self.calls.lock().unwrap().push(ApplierCall::Position {
            seqno: header.seqno,
            commit,
            recoverable,
        });
        Ok(())
    }
}
