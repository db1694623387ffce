use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::event::{ControlEvent, ControlKind, EventHeader, ReplEvent};
use crate::partition::{Assignment, Partitioner};
use crate::reader::{PartitionReader, ReaderCore};
use crate::watermark::Watermark;

/// A contiguous range of seqnos whose partitioner marked them critical,
/// all routed to one partition. While the front section of the queue is
/// unretired, no other partition may deliver an event ordered at or
/// after its start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CriticalSection {
    /// The partition that owns (executes) the section.
    pub partition: u32,
    /// First seqno of the section.
    pub start_seqno: u64,
    /// Last seqno of the section; `start_seqno <= end_seqno`.
    pub end_seqno: u64,
}

impl CriticalSection {
    fn new(partition: u32, seqno: u64) -> CriticalSection {
        CriticalSection {
            partition,
            start_seqno: seqno,
            end_seqno: seqno,
        }
    }
}

struct SectionState {
    /// The section still being extended by consecutive critical events.
    /// Not yet visible to readers: events ordered after it cannot exist
    /// until a later event closes it into `queue`.
    pending: Option<CriticalSection>,
    /// Closed sections in strictly increasing `start_seqno` order. Only
    /// the front gates delivery.
    queue: VecDeque<CriticalSection>,
    /// Last data seqno each partition has delivered to its consumer.
    delivered: Vec<Option<u64>>,
    closed: bool,
}

/// Serializes critical sections across partitions.
///
/// This plays the role a dependency graph plays in a query runtime: it
/// encodes which partitions may not proceed until another has finished,
/// guarded by its own mutex and condvar. Readers consult it before every
/// data delivery; the dispatcher feeds it from the producer thread.
pub(crate) struct SectionGate {
    readers: Vec<Arc<ReaderCore>>,
    max_sections: usize,
    state: Mutex<SectionState>,
    changed: Condvar,
}

impl SectionGate {
    pub(crate) fn new(readers: Vec<Arc<ReaderCore>>, max_sections: usize) -> SectionGate {
        let partitions = readers.len();
        SectionGate {
            readers,
            max_sections,
            state: Mutex::new(SectionState {
                pending: None,
                queue: VecDeque::new(),
                delivered: vec![None; partitions],
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Advance the critical-section state machine for one ingested
    /// event. Called in stream order by the dispatcher.
    pub(crate) fn observe(&self, assignment: Assignment, seqno: u64, wait: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if assignment.critical {
            match state.pending.take() {
                None => {
                    debug!(
                        "critical section opens at {seqno} on partition {}",
                        assignment.partition
                    );
                    state.pending = Some(CriticalSection::new(assignment.partition, seqno));
                }
                Some(mut section) if section.partition == assignment.partition => {
                    section.end_seqno = seqno;
                    state.pending = Some(section);
                }
                Some(section) => {
                    self.enqueue_locked(&mut state, section, wait)?;
                    state.pending = Some(CriticalSection::new(assignment.partition, seqno));
                }
            }
        } else if let Some(section) = state.pending.take() {
            self.enqueue_locked(&mut state, section, wait)?;
        }
        Ok(())
    }

    /// Close the pending section into the bounded FIFO, waiting a
    /// bounded time for space. A FIFO that stays full past the wait is a
    /// sizing defect, not a transient, so it surfaces as an invariant.
    fn enqueue_locked(
        &self,
        state: &mut MutexGuard<'_, SectionState>,
        section: CriticalSection,
        wait: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + wait;
        while state.queue.len() >= self.max_sections && !state.closed {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Invariant(format!(
                    "critical section queue full for {wait:?} (capacity {})",
                    self.max_sections
                )));
            }
            self.changed.wait_for(state, deadline - now);
        }
        if state.closed {
            return Err(Error::Canceled);
        }
        debug!(
            "critical section [{}, {}] on partition {} queued",
            section.start_seqno, section.end_seqno, section.partition
        );
        state.queue.push_back(section);
        // The owner may already have delivered the whole section: it was
        // routed before anything could close the section into the queue.
        self.try_retire(state);
        Ok(())
    }

    /// Block `partition` until delivering a data event at `seqno` no
    /// longer violates the front section. Waits on the watermark for the
    /// section's closing seqno first, then on retirement. Ungated events
    /// pass freely even after close, so shutdown still drains; a gated
    /// wait observes close as cancellation.
    pub(crate) fn await_clearance(
        &self,
        partition: u32,
        seqno: u64,
        watermark: &Watermark,
    ) -> Result<()> {
        loop {
            let gated_end = {
                let state = self.state.lock();
                match Self::gating_end(&state, partition, seqno) {
                    None => return Ok(()),
                    Some(_) if state.closed => return Err(Error::Canceled),
                    Some(end) => end,
                }
            };
            watermark.wait_until(gated_end)?;
            let mut state = self.state.lock();
            loop {
                match Self::gating_end(&state, partition, seqno) {
                    None => return Ok(()),
                    Some(_) if state.closed => return Err(Error::Canceled),
                    // The front moved to a later section; re-wait the
                    // watermark for its end before sleeping again.
                    Some(end) if end != gated_end => break,
                    Some(_) => self.changed.wait(&mut state),
                }
            }
        }
    }

    fn gating_end(state: &SectionState, partition: u32, seqno: u64) -> Option<u64> {
        match state.queue.front() {
            Some(cs) if cs.partition != partition && seqno >= cs.start_seqno => Some(cs.end_seqno),
            _ => None,
        }
    }

    /// Record a data delivery and retire the front section if it is now
    /// complete.
    pub(crate) fn note_delivered(&self, partition: u32, seqno: u64) {
        let mut state = self.state.lock();
        let slot = &mut state.delivered[partition as usize];
        if slot.map_or(true, |prev| seqno > prev) {
            *slot = Some(seqno);
        }
        self.try_retire(&mut state);
    }

    /// Pop every leading section whose owner has delivered its closing
    /// event and whose bystander partitions have drained everything
    /// ordered before it. Popping unblocks gated readers and frees FIFO
    /// space for the producer.
    fn try_retire(&self, state: &mut SectionState) {
        let mut retired = false;
        while let Some(front) = state.queue.front().copied() {
            let owner = front.partition as usize;
            let owner_done = state.delivered[owner].map_or(false, |d| d >= front.end_seqno);
            if !owner_done {
                break;
            }
            let others_drained = self.readers.iter().enumerate().all(|(i, core)| {
                i == owner
                    || core
                        .min_pending_data_seqno()
                        .map_or(true, |s| s >= front.start_seqno)
            });
            if !others_drained {
                break;
            }
            debug!(
                "critical section [{}, {}] on partition {} retired",
                front.start_seqno, front.end_seqno, front.partition
            );
            state.queue.pop_front();
            retired = true;
        }
        if retired {
            self.changed.notify_all();
        }
    }

    pub(crate) fn pending_partition(&self) -> Option<u32> {
        self.state.lock().pending.map(|cs| cs.partition)
    }

    pub(crate) fn has_open_section(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_some() || !state.queue.is_empty()
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.changed.notify_all();
    }
}

/// A predicate over transaction-closing events. The dispatcher removes a
/// predicate the first time it matches and broadcasts a SYNC so every
/// partition observes the matched position.
#[derive(Clone, Debug)]
pub enum WatchPredicate {
    /// Matches the first event with `seqno >= target`.
    SeqnoAtLeast(u64),
    /// Matches the event whose upstream position equals the string.
    EventId(String),
}

impl WatchPredicate {
    fn matches(&self, header: &EventHeader) -> bool {
        match self {
            WatchPredicate::SeqnoAtLeast(target) => header.seqno >= *target,
            WatchPredicate::EventId(id) => header.event_id == *id,
        }
    }
}

/// Configuration of a [`ParallelQueue`]. Plain data with consuming
/// builder methods; `QueueConfig::default()` is a working single-lane
/// setup.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Number of partitions (readers).
    pub partitions: u32,
    /// Capacity of each reader's data queue.
    pub max_size: usize,
    /// Capacity of each reader's control queue.
    pub max_control_events: usize,
    /// Capacity of the critical-section FIFO.
    pub max_sections: usize,
    /// Broadcast a SYNC every this many transactions.
    pub sync_interval: u32,
    /// Whether interval syncs are generated at all.
    pub sync_enabled: bool,
    /// How long a bounded queue may stay full before the condition is
    /// treated as a sizing invariant violation.
    pub resource_wait: Duration,
    /// Task id forwarded to the partitioner.
    pub task_id: u32,
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            partitions: 1,
            max_size: 1024,
            max_control_events: 64,
            max_sections: 64,
            sync_interval: 100,
            sync_enabled: true,
            resource_wait: Duration::from_secs(10),
            task_id: 0,
        }
    }
}

impl QueueConfig {
    /// Set the partition count.
    pub fn partitions(self, partitions: u32) -> QueueConfig {
        QueueConfig { partitions, ..self }
    }

    /// Set the per-reader data queue capacity.
    pub fn max_size(self, max_size: usize) -> QueueConfig {
        QueueConfig { max_size, ..self }
    }

    /// Set the per-reader control queue capacity.
    pub fn max_control_events(self, max_control_events: usize) -> QueueConfig {
        QueueConfig {
            max_control_events,
            ..self
        }
    }

    /// Set the critical-section FIFO capacity.
    pub fn max_sections(self, max_sections: usize) -> QueueConfig {
        QueueConfig {
            max_sections,
            ..self
        }
    }

    /// Set the automatic SYNC interval, in transactions.
    pub fn sync_interval(self, sync_interval: u32) -> QueueConfig {
        QueueConfig {
            sync_interval,
            ..self
        }
    }

    /// Enable or disable interval syncs.
    pub fn sync_enabled(self, sync_enabled: bool) -> QueueConfig {
        QueueConfig {
            sync_enabled,
            ..self
        }
    }

    /// Set the bounded wait applied to full internal queues.
    pub fn resource_wait(self, resource_wait: Duration) -> QueueConfig {
        QueueConfig {
            resource_wait,
            ..self
        }
    }
}

struct Counters {
    transactions: CachePadded<AtomicU64>,
    serializations: CachePadded<AtomicU64>,
    discards: CachePadded<AtomicU64>,
    events: CachePadded<AtomicU64>,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            transactions: CachePadded::new(AtomicU64::new(0)),
            serializations: CachePadded::new(AtomicU64::new(0)),
            discards: CachePadded::new(AtomicU64::new(0)),
            events: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

struct QueueShared {
    config: QueueConfig,
    cores: Vec<Arc<ReaderCore>>,
    watermark: Arc<Watermark>,
    gate: Arc<SectionGate>,
    counters: Counters,
    stop_requested: AtomicBool,
    watch: Mutex<Vec<WatchPredicate>>,
    last_inserted: Mutex<Option<EventHeader>>,
    current_service: Mutex<Option<String>>,
}

impl QueueShared {
    fn shutdown(&self) {
        self.watermark.close();
        self.gate.close();
        for core in &self.cores {
            core.close();
        }
    }

    fn broadcast(&self, control: &ControlEvent) -> Result<()> {
        for core in &self.cores {
            core.put_control(control.clone())?;
        }
        Ok(())
    }

    fn status(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        let head = self
            .watermark
            .get()
            .map_or_else(|| "-1".to_owned(), |h| h.to_string());
        map.insert("head_seqno".to_owned(), head);
        map.insert("max_size".to_owned(), self.config.max_size.to_string());
        map.insert(
            "event_count".to_owned(),
            self.counters.events.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "discard_count".to_owned(),
            self.counters.discards.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "transaction_count".to_owned(),
            self.counters.transactions.load(Ordering::Relaxed).to_string(),
        );
        map.insert("queues".to_owned(), self.config.partitions.to_string());
        map.insert(
            "sync_enabled".to_owned(),
            self.config.sync_enabled.to_string(),
        );
        map.insert(
            "sync_interval".to_owned(),
            self.config.sync_interval.to_string(),
        );
        map.insert(
            "serialized".to_owned(),
            self.gate.has_open_section().to_string(),
        );
        map.insert(
            "serialization_count".to_owned(),
            self.counters
                .serializations
                .load(Ordering::Relaxed)
                .to_string(),
        );
        map.insert(
            "stop_requested".to_owned(),
            self.stop_requested.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "critical_partition".to_owned(),
            self.gate
                .pending_partition()
                .map_or_else(|| "-1".to_owned(), |p| p.to_string()),
        );
        map.insert(
            "current_service".to_owned(),
            self.current_service.lock().clone().unwrap_or_default(),
        );
        for (i, core) in self.cores.iter().enumerate() {
            let (data, ctrl) = core.depths();
            map.insert(i.to_string(), format!("data={data} control={ctrl}"));
        }
        map
    }
}

/// A cloneable administrative handle onto a [`ParallelQueue`]: status,
/// stop requests, watch predicates, and shutdown, callable from any
/// thread while the producer owns the queue itself.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<QueueShared>,
}

impl QueueHandle {
    /// Snapshot of queue state as a flat string map.
    pub fn status(&self) -> BTreeMap<String, String> {
        self.shared.status()
    }

    /// Ask the dispatcher to broadcast a STOP after the next
    /// transaction-closing event it ingests.
    pub fn request_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Watch for a matching transaction-closing event; the match forces
    /// a SYNC broadcast and removes the predicate.
    pub fn watch_for(&self, predicate: WatchPredicate) {
        self.shared.watch.lock().push(predicate);
    }

    /// Current head seqno, if any event has been ingested.
    pub fn head_seqno(&self) -> Option<u64> {
        self.shared.watermark.get()
    }

    /// Header of the most recently ingested event.
    pub fn last_inserted(&self) -> Option<EventHeader> {
        self.shared.last_inserted.lock().clone()
    }

    /// Close the watermark, the section gate, and every reader. Readers
    /// drain what they already hold, then observe cancellation.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

/// The parallel dispatch queue: single producer, N partition readers.
///
/// The upstream extractor thread owns this value and feeds it the
/// totally-ordered event stream via [`put`](ParallelQueue::put); each
/// partition worker owns one [`PartitionReader`]. The queue routes data
/// events by partitioner assignment, folds critical events into
/// serialized sections, advances the shared watermark, and injects
/// control events (SYNC, STOP) at transaction boundaries.
pub struct ParallelQueue {
    shared: Arc<QueueShared>,
    partitioner: Box<dyn Partitioner>,
    /// `(seqno, fragno, last_frag)` of the previous put, for stream
    /// invariant checks. Producer-thread state, unsynchronized.
    last_put: Option<(u64, u32, bool)>,
    sync_counter: u32,
}

impl ParallelQueue {
    /// Build a queue and its readers. The readers are handed to the
    /// partition worker threads; the queue stays with the producer.
    pub fn new(
        config: QueueConfig,
        partitioner: Box<dyn Partitioner>,
    ) -> (ParallelQueue, Vec<PartitionReader>) {
        assert!(config.partitions > 0, "partition count must be positive");
        let cores: Vec<Arc<ReaderCore>> = (0..config.partitions)
            .map(|i| {
                Arc::new(ReaderCore::new(
                    i,
                    config.max_size,
                    config.max_control_events,
                ))
            })
            .collect();
        let watermark = Arc::new(Watermark::new());
        let gate = Arc::new(SectionGate::new(cores.clone(), config.max_sections));
        let readers = cores
            .iter()
            .enumerate()
            .map(|(i, core)| {
                PartitionReader::new(i as u32, Arc::clone(core), Arc::clone(&gate), Arc::clone(&watermark))
            })
            .collect();
        let shared = Arc::new(QueueShared {
            config,
            cores,
            watermark,
            gate,
            counters: Counters::new(),
            stop_requested: AtomicBool::new(false),
            watch: Mutex::new(Vec::new()),
            last_inserted: Mutex::new(None),
            current_service: Mutex::new(None),
        });
        (
            ParallelQueue {
                shared,
                partitioner,
                last_put: None,
                sync_counter: 0,
            },
            readers,
        )
    }

    /// An administrative handle usable from other threads.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Ingest the next event of the stream.
    ///
    /// Events must arrive with strictly increasing `(seqno, fragno)`
    /// tuples and gap-free fragments; violations are invariant errors.
    /// Blocks when the target reader's queue is full. The only failure
    /// kinds are [`Error::Canceled`] and [`Error::Invariant`].
    pub fn put(&mut self, event: ReplEvent) -> Result<()> {
        let seqno = event.seqno();
        let fragno = event.fragno();
        self.check_stream_order(seqno, fragno)?;
        let config = &self.shared.config;

        if event.last_frag() {
            self.shared
                .counters
                .transactions
                .fetch_add(1, Ordering::Relaxed);
        }

        // Nothing to route; the position still advances so SYNC and
        // restart logic downstream see the seqno.
        if event.payload().is_empty() {
            debug!("discarding empty event {event}");
            self.shared.counters.discards.fetch_add(1, Ordering::Relaxed);
            self.shared.watermark.set(seqno);
            self.last_put = Some((seqno, fragno, event.last_frag()));
            return Ok(());
        }

        let assignment = self.partitioner.assign(&event, config.task_id);
        if assignment.partition >= config.partitions {
            return Err(Error::Invariant(format!(
                "partitioner returned partition {} of {}",
                assignment.partition, config.partitions
            )));
        }
        if assignment.critical {
            self.shared
                .counters
                .serializations
                .fetch_add(1, Ordering::Relaxed);
        }
        self.shared
            .gate
            .observe(assignment, seqno, config.resource_wait)?;

        let event = Arc::new(event);
        self.shared.cores[assignment.partition as usize].put_event(Arc::clone(&event))?;
        self.shared.counters.events.fetch_add(1, Ordering::Relaxed);
        self.shared.watermark.set(seqno);

        let header = event.header();
        *self.shared.last_inserted.lock() = Some(header.clone());
        *self.shared.current_service.lock() = Some(event.service().to_owned());

        if event.last_frag() {
            self.inject_controls(&event, header)?;
        }
        self.last_put = Some((seqno, fragno, event.last_frag()));
        Ok(())
    }

    /// Post-event control injection, evaluated only at transaction
    /// boundaries.
    fn inject_controls(&mut self, event: &ReplEvent, header: EventHeader) -> Result<()> {
        let config = &self.shared.config;
        let seqno = event.seqno();

        if self.shared.stop_requested.swap(false, Ordering::SeqCst) {
            debug!("broadcasting STOP at {seqno}");
            self.shared.broadcast(
                &ControlEvent::new(ControlKind::Stop, seqno).with_header(header.clone()),
            )?;
        }

        let mut needs_sync = false;
        {
            let mut watch = self.shared.watch.lock();
            let before = watch.len();
            watch.retain(|p| !p.matches(&header));
            if watch.len() != before {
                debug!("watch predicate matched at {seqno}");
                needs_sync = true;
            }
        }
        if config.sync_enabled {
            self.sync_counter += 1;
            if self.sync_counter >= config.sync_interval {
                needs_sync = true;
                self.sync_counter = 0;
            }
        }
        if event.is_heartbeat() {
            needs_sync = true;
        }
        if needs_sync {
            self.shared
                .broadcast(&ControlEvent::new(ControlKind::Sync, seqno).with_header(header))?;
        }
        Ok(())
    }

    fn check_stream_order(&self, seqno: u64, fragno: u32) -> Result<()> {
        match self.last_put {
            None => {
                if fragno != 0 {
                    return Err(Error::Invariant(format!(
                        "stream starts mid-transaction at {seqno}/{fragno}"
                    )));
                }
            }
            Some((last_seqno, last_fragno, last_closed)) => {
                if seqno < last_seqno || (seqno == last_seqno && fragno <= last_fragno) {
                    return Err(Error::Invariant(format!(
                        "seqno went backward: {seqno}/{fragno} after {last_seqno}/{last_fragno}"
                    )));
                }
                if seqno == last_seqno && fragno != last_fragno + 1 {
                    return Err(Error::Invariant(format!(
                        "fragment gap: {seqno}/{fragno} after {last_seqno}/{last_fragno}"
                    )));
                }
                if seqno > last_seqno && !last_closed {
                    return Err(Error::Invariant(format!(
                        "transaction {last_seqno} never closed before {seqno}"
                    )));
                }
                if seqno > last_seqno && fragno != 0 {
                    return Err(Error::Invariant(format!(
                        "transaction {seqno} starts at fragment {fragno}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Push a control event into every reader's control queue. Ordering
    /// across readers is not synchronized, but each reader individually
    /// sees controls in broadcast order.
    pub fn broadcast_control(&self, control: ControlEvent) -> Result<()> {
        self.shared.broadcast(&control)
    }

    /// See [`QueueHandle::request_stop`].
    pub fn request_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
    }

    /// See [`QueueHandle::watch_for`].
    pub fn watch_for(&self, predicate: WatchPredicate) {
        self.shared.watch.lock().push(predicate);
    }

    /// See [`QueueHandle::status`].
    pub fn status(&self) -> BTreeMap<String, String> {
        self.shared.status()
    }

    /// Close the queue: readers drain their remaining items and then
    /// observe cancellation. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Drop for ParallelQueue {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
