use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{metadata, EventHeader, ReplEvent};
use crate::schedule::{Disposition, Phase, Schedule};
use crate::{Applier, Extractor, Filter};

/// What to do when an extractor or applier call fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Dispatch an error notification and stop the task. The default.
    Stop,
    /// Log and carry on at the next poll. The failing event's position
    /// is not advanced.
    Warn,
}

/// Stage task configuration. Plain data with consuming builder methods.
#[derive(Clone, Debug)]
pub struct StageConfig {
    /// Commit after this many transactions; 1 disables batching.
    pub block_commit_rows: u32,
    /// Policy for extraction failures.
    pub extractor_policy: FailurePolicy,
    /// Policy for apply failures (and filter failures, which escalate to
    /// application class).
    pub applier_policy: FailurePolicy,
    /// Forwarded to the applier on every apply; tells it to keep its THL
    /// position in lockstep with the extractor.
    pub sync_thl_with_extractor: bool,
    /// Dispatch an in-sequence notification on the first iteration.
    pub auto_sync: bool,
}

impl Default for StageConfig {
    fn default() -> StageConfig {
        StageConfig {
            block_commit_rows: 10,
            extractor_policy: FailurePolicy::Stop,
            applier_policy: FailurePolicy::Stop,
            sync_thl_with_extractor: true,
            auto_sync: false,
        }
    }
}

impl StageConfig {
    /// Set the block-commit size; must be at least 1.
    pub fn block_commit_rows(self, block_commit_rows: u32) -> StageConfig {
        assert!(block_commit_rows >= 1, "block commit size must be at least 1");
        StageConfig {
            block_commit_rows,
            ..self
        }
    }

    /// Set the extractor failure policy.
    pub fn extractor_policy(self, extractor_policy: FailurePolicy) -> StageConfig {
        StageConfig {
            extractor_policy,
            ..self
        }
    }

    /// Set the applier failure policy.
    pub fn applier_policy(self, applier_policy: FailurePolicy) -> StageConfig {
        StageConfig {
            applier_policy,
            ..self
        }
    }

    /// Set THL/extractor position lockstep.
    pub fn sync_thl_with_extractor(self, sync_thl_with_extractor: bool) -> StageConfig {
        StageConfig {
            sync_thl_with_extractor,
            ..self
        }
    }

    /// Enable the in-sequence notification on startup.
    pub fn auto_sync(self, auto_sync: bool) -> StageConfig {
        StageConfig { auto_sync, ..self }
    }
}

/// Notable things that happen inside a stage task, delivered to the
/// observer callback. This is how embedders inject monitoring without
/// the task knowing about it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageEvent {
    /// The task entered its loop and is processing in sequence.
    InSequence,
    /// An extraction failed; under the stop policy the task is about to
    /// exit.
    ExtractorError {
        /// Description of the failure.
        message: String,
    },
    /// An apply (or escalated filter) failed, with the restart
    /// coordinates of the event that did not commit.
    ApplierError {
        /// Description of the failure.
        message: String,
        /// Seqno of the failing event.
        seqno: u64,
        /// Upstream position of the failing event.
        event_id: String,
    },
    /// The stream switched logical sources, forcing a commit boundary.
    /// Mid-fragment switches cannot force one and are only reported.
    ServiceChange {
        /// Previous service tag.
        old: String,
        /// New service tag.
        new: String,
        /// True when the switch happened inside a fragmented
        /// transaction.
        mid_fragment: bool,
    },
}

type Observer = Box<dyn FnMut(&StageEvent) + Send>;

/// A single-threaded stage loop binding an extractor, a filter chain,
/// and an applier.
///
/// Each iteration extracts one event, consults the schedule, runs the
/// filters, and applies, committing in blocks of
/// [`block_commit_rows`](StageConfig::block_commit_rows) transactions.
/// Failure handling is policy-driven and cancellation is cooperative:
/// the loop tests its schedule's latch at the head of every iteration
/// and unwinds any open transaction on the way out.
pub struct StageTask<E: Extractor, A: Applier> {
    name: String,
    extractor: E,
    filters: Vec<Box<dyn Filter>>,
    applier: A,
    schedule: Schedule,
    config: StageConfig,
    observer: Option<Observer>,
    /// Transactions applied since the last commit.
    block_event_count: u32,
    /// Applied-but-uncommitted work exists.
    dirty: bool,
    last_applied: Option<EventHeader>,
    /// Header to record as processed at the top of the next iteration.
    pending_record: Option<EventHeader>,
    last_service: Option<String>,
    /// True while inside a fragmented transaction.
    in_fragment: bool,
    /// Headers of the first and last events of the current suppressed
    /// run.
    suppressed: Option<(EventHeader, EventHeader)>,
}

impl<E: Extractor, A: Applier> StageTask<E, A> {
    /// A stage task with no filters and no observer.
    pub fn new(
        name: impl Into<String>,
        extractor: E,
        applier: A,
        schedule: Schedule,
        config: StageConfig,
    ) -> StageTask<E, A> {
        StageTask {
            name: name.into(),
            extractor,
            filters: Vec::new(),
            applier,
            schedule,
            config,
            observer: None,
            block_event_count: 0,
            dirty: false,
            last_applied: None,
            pending_record: None,
            last_service: None,
            in_fragment: false,
            suppressed: None,
        }
    }

    /// Append a filter to the chain. Filters run in insertion order.
    pub fn add_filter(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Install the observer callback.
    pub fn set_observer(&mut self, observer: impl FnMut(&StageEvent) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// The task's schedule, for progress inspection.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Run until the schedule quits, the task is canceled, or a
    /// stop-policy failure occurs.
    ///
    /// On an orderly exit any partial block is flushed with a final
    /// commit; on cancellation the open transaction is rolled back
    /// instead and `Ok` is still returned, since cancellation is not a
    /// failure. A fatal error re-persists the last committed position
    /// marked non-recoverable before surfacing.
    pub fn run(&mut self) -> Result<()> {
        info!("stage {} starting", self.name);
        match self.main_loop() {
            Ok(()) => {
                self.deliver_suppressed_range()?;
                self.applier.commit()?;
                if self.dirty {
                    if let Some(header) = self.last_applied.clone() {
                        self.schedule.record_committed(header);
                    }
                    self.dirty = false;
                    self.block_event_count = 0;
                }
                info!("stage {} finished", self.name);
                Ok(())
            }
            Err(Error::Canceled) => {
                info!("stage {} canceled, rolling back open transaction", self.name);
                if let Err(e) = self.applier.rollback() {
                    warn!("stage {} rollback failed: {e}", self.name);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(header) = self.schedule.last_committed().cloned() {
                    let _ = self.applier.update_position(&header, true, false);
                }
                Err(e)
            }
        }
    }

    fn main_loop(&mut self) -> Result<()> {
        let mut first_iteration = true;
        loop {
            if first_iteration && self.config.auto_sync {
                self.notify(StageEvent::InSequence);
            }
            first_iteration = false;

            if let Some(header) = self.pending_record.take() {
                self.schedule.record_processed(header);
            }

            if self.schedule.is_canceled() {
                return Err(Error::Canceled);
            }

            let extracted = self
                .schedule
                .timers_mut()
                .time(Phase::Extract, || self.extractor.extract());
            let event = match extracted {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(e) => {
                    self.notify(StageEvent::ExtractorError {
                        message: e.to_string(),
                    });
                    match self.config.extractor_policy {
                        FailurePolicy::Stop => return Err(e),
                        FailurePolicy::Warn => {
                            warn!("stage {} extraction failed, retrying: {e}", self.name);
                            continue;
                        }
                    }
                }
            };
            debug!("stage {} extracted {event}", self.name);

            self.detect_service_change(&event);
            self.in_fragment = !event.last_frag();

            match self.schedule.advise(&event) {
                Disposition::Proceed => {}
                Disposition::ContinueNext => {
                    self.update_position(&event, false)?;
                    continue;
                }
                Disposition::ContinueNextCommit => {
                    self.update_position(&event, true)?;
                    continue;
                }
                Disposition::Quit => {
                    self.update_position(&event, false)?;
                    return Ok(());
                }
            }

            let header = event.header();
            let filtered = match self.run_filters(event) {
                Ok(filtered) => filtered,
                Err(e) => {
                    if self.handle_apply_failure(&header, &e)? {
                        continue;
                    }
                    return Err(e);
                }
            };
            let event = match filtered {
                Some(event) => event,
                None => {
                    // Suppressed: extend the pending range and poll
                    // again. The position advances when the range is
                    // delivered.
                    match &mut self.suppressed {
                        None => self.suppressed = Some((header.clone(), header)),
                        Some((_, last)) => *last = header,
                    }
                    continue;
                }
            };
            self.deliver_suppressed_range()?;

            // Implicit commit points, decided before the event itself is
            // applied.
            let mut do_rollback = false;
            if event.fragno() == 0 && !event.last_frag() {
                self.flush_block()?;
            }
            if event.fragno() == 0 && event.has_metadata(metadata::ROLLBACK) {
                self.flush_block()?;
                do_rollback = true;
            }
            let unsafe_for_block = event.has_metadata(metadata::UNSAFE_FOR_BLOCK_COMMIT);
            if unsafe_for_block {
                self.flush_block()?;
            }

            let do_commit = if unsafe_for_block {
                true
            } else if self.config.block_commit_rows > 1 {
                event.last_frag() && {
                    self.block_event_count += 1;
                    self.block_event_count >= self.config.block_commit_rows
                        || !self.extractor.has_more()
                }
            } else {
                event.last_frag()
            };

            let sync_thl = self.config.sync_thl_with_extractor;
            let applied = self
                .schedule
                .timers_mut()
                .time(Phase::Apply, || {
                    self.applier.apply(&event, do_commit, do_rollback, sync_thl)
                });
            match applied {
                Ok(()) => {
                    let header = event.header();
                    self.last_applied = Some(header.clone());
                    self.pending_record = Some(header.clone());
                    if do_commit {
                        self.block_event_count = 0;
                        self.dirty = false;
                        self.schedule.record_committed(header);
                    } else {
                        self.dirty = true;
                    }
                }
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(e) => {
                    let header = event.header();
                    if self.handle_apply_failure(&header, &e)? {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run the filter chain. A filter failure other than cancellation is
    /// escalated to application class carrying the event's restart
    /// coordinates.
    fn run_filters(&mut self, event: ReplEvent) -> Result<Option<ReplEvent>> {
        if self.filters.is_empty() {
            return Ok(Some(event));
        }
        let header = event.header();
        let filters = &mut self.filters;
        let outcome = self.schedule.timers_mut().time(Phase::Filter, || {
            let mut current = event;
            for filter in filters.iter_mut() {
                match filter.filter(current)? {
                    Some(next) => current = next,
                    None => return Ok(None),
                }
            }
            Ok(Some(current))
        });
        match outcome {
            Ok(result) => Ok(result),
            Err(Error::Canceled) => Err(Error::Canceled),
            Err(e) => Err(Error::Application {
                seqno: header.seqno,
                event_id: header.event_id,
                message: format!("filter failed: {e}"),
                source: None,
            }),
        }
    }

    /// Returns `Ok(true)` when the warn policy swallows the failure.
    /// The failing event's position is never advanced.
    fn handle_apply_failure(&mut self, header: &EventHeader, error: &Error) -> Result<bool> {
        self.notify(StageEvent::ApplierError {
            message: error.to_string(),
            seqno: header.seqno,
            event_id: header.event_id.clone(),
        });
        match self.config.applier_policy {
            FailurePolicy::Stop => Ok(false),
            FailurePolicy::Warn => {
                warn!(
                    "stage {} apply failed at {}/{}, continuing: {error}",
                    self.name, header.seqno, header.fragno
                );
                Ok(true)
            }
        }
    }

    /// Block-commit aware service-change boundary: committing the
    /// pending block keeps transactions of different services out of one
    /// downstream commit.
    fn detect_service_change(&mut self, event: &ReplEvent) {
        if self.config.block_commit_rows <= 1 {
            return;
        }
        let old = match self.last_service.replace(event.service().to_owned()) {
            Some(old) if old != event.service() => old,
            _ => return,
        };
        if self.in_fragment {
            warn!(
                "stage {} service changed {} -> {} inside a fragmented transaction",
                self.name,
                old,
                event.service()
            );
        } else if let Err(e) = self.flush_block() {
            warn!("stage {} commit on service change failed: {e}", self.name);
        }
        self.notify(StageEvent::ServiceChange {
            old,
            new: event.service().to_owned(),
            mid_fragment: self.in_fragment,
        });
    }

    /// Commit any applied-but-uncommitted block and reset the block
    /// counter.
    fn flush_block(&mut self) -> Result<()> {
        if self.dirty {
            self.applier.commit()?;
            if let Some(header) = self.last_applied.clone() {
                self.schedule.record_committed(header);
            }
            self.dirty = false;
        }
        self.block_event_count = 0;
        Ok(())
    }

    /// Deliver the synthetic stand-in for a suppressed run, if one is
    /// pending, so restart positions advance monotonically.
    fn deliver_suppressed_range(&mut self) -> Result<()> {
        if let Some((from, to)) = self.suppressed.take() {
            debug!(
                "stage {} delivering filtered range {}..={}",
                self.name, from.seqno, to.seqno
            );
            let synthetic = ReplEvent::filtered_range(from, to);
            let sync_thl = self.config.sync_thl_with_extractor;
            self.applier.apply(&synthetic, false, false, sync_thl)?;
            let header = synthetic.header();
            self.last_applied = Some(header.clone());
            self.schedule.record_processed(header);
            self.dirty = true;
        }
        Ok(())
    }

    /// Position update for events the schedule skipped: recapitulates
    /// the block-commit decision so control points force a commit only
    /// at block boundaries.
    fn update_position(&mut self, event: &ReplEvent, commit: bool) -> Result<()> {
        let header = event.header();
        let do_commit = commit
            && if self.config.block_commit_rows > 1 {
                self.block_event_count += 1;
                self.block_event_count >= self.config.block_commit_rows
                    || !self.extractor.has_more()
            } else {
                true
            };
        self.applier.update_position(&header, do_commit, true)?;
        if do_commit {
            self.block_event_count = 0;
            self.dirty = false;
            self.schedule.record_committed(header.clone());
        }
        self.schedule.record_processed(header);
        Ok(())
    }

    fn notify(&mut self, event: StageEvent) {
        if let Some(observer) = &mut self.observer {
            observer(&event);
        }
    }
}
