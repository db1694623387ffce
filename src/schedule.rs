use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::event::{EventHeader, ReplEvent};

/// What the stage loop should do with the event it just extracted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Filter and apply it.
    Proceed,
    /// Skip it, update the position without committing, poll again.
    ContinueNext,
    /// Skip it, update the position at the next commit boundary, poll
    /// again.
    ContinueNextCommit,
    /// Update the position without committing and leave the loop.
    Quit,
}

/// Matches event headers for schedule rules.
pub enum HeaderMatcher {
    /// Inclusive seqno range; `None` bounds are open.
    SeqnoRange {
        /// Lowest matching seqno, if bounded below.
        start: Option<u64>,
        /// Highest matching seqno, if bounded above.
        end: Option<u64>,
    },
    /// Exact upstream position string.
    EventId(String),
    /// Arbitrary predicate.
    Predicate(Box<dyn Fn(&EventHeader) -> bool + Send>),
}

impl HeaderMatcher {
    fn matches(&self, header: &EventHeader) -> bool {
        match self {
            HeaderMatcher::SeqnoRange { start, end } => {
                start.map_or(true, |s| header.seqno >= s)
                    && end.map_or(true, |e| header.seqno <= e)
            }
            HeaderMatcher::EventId(id) => header.event_id == *id,
            HeaderMatcher::Predicate(f) => f(header),
        }
    }
}

impl fmt::Debug for HeaderMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderMatcher::SeqnoRange { start, end } => f
                .debug_struct("SeqnoRange")
                .field("start", start)
                .field("end", end)
                .finish(),
            HeaderMatcher::EventId(id) => f.debug_tuple("EventId").field(id).finish(),
            HeaderMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A latched cancellation flag shared between a stage task, its
/// schedule, and whoever administers them. Once set it stays set; the
/// task observes it at the next loop head and exits without advancing
/// its position.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, unset token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Latch the flag. Idempotent; there is no way to unset it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Read the latch.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The phases the stage loop accounts for separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Pulling the next event from the extractor.
    Extract,
    /// Running the filter chain.
    Filter,
    /// Applying to the downstream.
    Apply,
}

/// Cumulative wall-clock spent per phase.
#[derive(Debug, Default)]
pub struct IntervalTimers {
    totals: [Duration; 3],
}

impl IntervalTimers {
    /// Run `f`, charging its wall-clock to `phase`.
    pub fn time<T>(&mut self, phase: Phase, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let out = f();
        self.totals[phase as usize] += started.elapsed();
        out
    }

    /// Total time charged to `phase` so far.
    pub fn total(&self, phase: Phase) -> Duration {
        self.totals[phase as usize]
    }
}

/// Advises the stage loop event by event and tracks its progress.
///
/// A schedule is a list of rules, each a [`HeaderMatcher`] with a
/// non-`Proceed` disposition. [`advise`](Schedule::advise) returns the
/// first matching rule's disposition, `Quit` once the cancel token is
/// latched, and `Proceed` otherwise. Alongside advice it records the
/// last processed and last committed headers: the committed header is
/// the restart point, and only commits move it.
pub struct Schedule {
    cancel: CancelToken,
    rules: Vec<(HeaderMatcher, Disposition)>,
    timers: IntervalTimers,
    last_processed: Option<EventHeader>,
    last_committed: Option<EventHeader>,
    events_processed: u64,
}

impl Default for Schedule {
    fn default() -> Schedule {
        Schedule::new(CancelToken::new())
    }
}

impl Schedule {
    /// A rule-less schedule driven by `cancel`.
    pub fn new(cancel: CancelToken) -> Schedule {
        Schedule {
            cancel,
            rules: Vec::new(),
            timers: IntervalTimers::default(),
            last_processed: None,
            last_committed: None,
            events_processed: 0,
        }
    }

    /// The token this schedule (and its task) watch.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Append a rule. Rules are consulted in insertion order; the first
    /// match wins. `Proceed` rules are pointless and rejected by debug
    /// assertion.
    pub fn add_rule(&mut self, matcher: HeaderMatcher, disposition: Disposition) {
        debug_assert!(disposition != Disposition::Proceed);
        self.rules.push((matcher, disposition));
    }

    /// Skip every event in the inclusive seqno range. With `commit` the
    /// skip still commits at block boundaries so the position advances
    /// durably.
    pub fn skip_seqno_range(&mut self, start: u64, end: u64, commit: bool) {
        let disposition = if commit {
            Disposition::ContinueNextCommit
        } else {
            Disposition::ContinueNext
        };
        self.add_rule(
            HeaderMatcher::SeqnoRange {
                start: Some(start),
                end: Some(end),
            },
            disposition,
        );
    }

    /// Leave the loop at the first event with `seqno > last`, so that
    /// `last` is the final seqno processed.
    pub fn stop_after_seqno(&mut self, last: u64) {
        self.add_rule(
            HeaderMatcher::SeqnoRange {
                start: Some(last + 1),
                end: None,
            },
            Disposition::Quit,
        );
    }

    /// Advice for one extracted event.
    pub fn advise(&self, event: &ReplEvent) -> Disposition {
        if self.cancel.is_canceled() {
            return Disposition::Quit;
        }
        let header = event.header();
        for (matcher, disposition) in &self.rules {
            if matcher.matches(&header) {
                debug!("schedule rule {matcher:?} -> {disposition:?} for {event}");
                return *disposition;
            }
        }
        Disposition::Proceed
    }

    /// True once the cancel token has been latched.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Record a successfully processed (applied or skipped) event.
    pub fn record_processed(&mut self, header: EventHeader) {
        self.events_processed += 1;
        self.last_processed = Some(header);
    }

    /// Record a commit; `header` becomes the restart point.
    pub fn record_committed(&mut self, header: EventHeader) {
        self.last_committed = Some(header);
    }

    /// Header of the most recently processed event.
    pub fn last_processed(&self) -> Option<&EventHeader> {
        self.last_processed.as_ref()
    }

    /// The restart point: header of the most recently committed event.
    pub fn last_committed(&self) -> Option<&EventHeader> {
        self.last_committed.as_ref()
    }

    /// Cumulative count of processed events.
    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// The phase timers.
    pub fn timers(&self) -> &IntervalTimers {
        &self.timers
    }

    /// Mutable access for the stage loop's measurements.
    pub fn timers_mut(&mut self) -> &mut IntervalTimers {
        &mut self.timers
    }
}
