#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! Replicore is the ordering-and-dispatch core of a database
//! replication pipeline. It ingests a totally-ordered stream of
//! committed transactions, fans it out to N partition readers while
//! serializing the critical sections that must not run concurrently
//! across partitions, drives extractor → filter → applier stage loops
//! with block-commit batching and restart-point tracking, and plans
//! chunked parallel snapshots of large tables.
//!
//! The crate is deliberately a single-process engine built on OS
//! threads: one extractor thread feeds a [`ParallelQueue`], each
//! partition worker drains a [`PartitionReader`] into a [`StageTask`],
//! and a [`ChunkPlanner`] thread feeds snapshot workers over a bounded
//! channel. Durable log storage, database drivers, and wire decoding
//! stay behind the [`Extractor`], [`Applier`], and
//! [`chunk::TableInspector`] traits.

mod dispatch;
mod error;
mod event;
mod partition;
mod reader;
mod schedule;
mod stage;
mod watermark;

pub mod chunk;

pub use crate::dispatch::{
    CriticalSection, ParallelQueue, QueueConfig, QueueHandle, WatchPredicate,
};
pub use crate::error::{Error, Result};
pub use crate::event::{
    metadata, ControlEvent, ControlKind, EventHeader, Payload, ReplEvent, RowChange, RowOp,
};
pub use crate::partition::{
    Assignment, HashPartitioner, Partitioner, PartitionerFactory, PartitionerRegistry,
    RoundRobinPartitioner,
};
pub use crate::reader::{PartitionReader, QueueItem};
pub use crate::schedule::{
    CancelToken, Disposition, HeaderMatcher, IntervalTimers, Phase, Schedule,
};
pub use crate::stage::{FailurePolicy, StageConfig, StageEvent, StageTask};
pub use crate::watermark::Watermark;

pub use crate::chunk::{ChunkPlanner, NumericChunk, PlannerConfig};

/// Pulls events out of the upstream log (or a THL segment).
///
/// `extract` returning `Ok(None)` means "nothing right now, poll
/// again"; end-of-input is not a concept the core knows about, because
/// replication streams do not end. Implementations are expected to
/// honor their task's [`CancelToken`] by returning
/// [`Error::Canceled`] from a blocked call once it is latched.
pub trait Extractor: Send {
    /// The next event of the stream, or `None` on an empty poll.
    fn extract(&mut self) -> Result<Option<ReplEvent>>;

    /// True while more input is immediately available without blocking.
    /// The stage loop commits a partial block when this goes false.
    fn has_more(&self) -> bool;
}

/// Transforms or suppresses events between extraction and apply.
///
/// Returning `Ok(None)` suppresses the event; the stage loop later
/// hands the applier a single [`Payload::FilteredRange`] stand-in for
/// the whole suppressed run. Failures are escalated as
/// application-class errors.
pub trait Filter: Send {
    /// Transform `event`, pass it through unchanged, or suppress it.
    fn filter(&mut self, event: ReplEvent) -> Result<Option<ReplEvent>>;
}

/// Writes events to the downstream database and owns the persisted
/// restart position.
///
/// The stage loop batches transactions between commits; `apply` with
/// `commit = false` stages work that a later `apply(commit = true)` or
/// explicit [`commit`](Applier::commit) makes durable together with the
/// position of the last staged event. Implementations must persist the
/// restart header atomically with the data they commit.
pub trait Applier: Send {
    /// Apply one event. `rollback` marks a transaction that rolled back
    /// upstream; `sync_thl` asks the applier to keep its log position in
    /// lockstep with the extractor.
    fn apply(&mut self, event: &ReplEvent, commit: bool, rollback: bool, sync_thl: bool)
        -> Result<()>;

    /// Commit everything applied since the last commit.
    fn commit(&mut self) -> Result<()>;

    /// Discard everything applied since the last commit.
    fn rollback(&mut self) -> Result<()>;

    /// Update the persisted position without applying data. With
    /// `commit` the position becomes durable immediately. `recoverable`
    /// is false only when a failing task records its last good position
    /// on the way down.
    fn update_position(&mut self, header: &EventHeader, commit: bool, recoverable: bool)
        -> Result<()>;
}
