use std::fmt;

use rustc_hash::FxHashMap;

/// Metadata keys the core recognizes. Anything else travels opaquely.
pub mod metadata {
    /// Marks a heartbeat transaction; forces a SYNC broadcast.
    pub const HEARTBEAT: &str = "HEARTBEAT";
    /// Marks a transaction that rolled back upstream.
    pub const ROLLBACK: &str = "ROLLBACK";
    /// Marks an event that must not share a commit block with others.
    pub const UNSAFE_FOR_BLOCK_COMMIT: &str = "UNSAFE_FOR_BLOCK_COMMIT";
    /// Overrides the shard key used by the hash partitioner.
    pub const SERVICE: &str = "SERVICE";
}

/// One row-change entry inside an event payload. The core never
/// interprets these; they exist so payloads have enough shape to test
/// routing and batching against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowChange {
    /// Schema the change applies to.
    pub schema: String,
    /// Table the change applies to.
    pub table: String,
    /// Kind of change.
    pub op: RowOp,
}

/// The kind of a [`RowChange`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowOp {
    /// Row insertion.
    Insert,
    /// Row update.
    Update,
    /// Row deletion.
    Delete,
}

/// The opaque payload of a replicated event.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Payload {
    /// An ordered batch of row changes.
    Rows(Vec<RowChange>),
    /// A SQL statement.
    Statement(String),
    /// A synthetic marker standing in for a contiguous run of events that
    /// filters suppressed; appliers advance their restart position past
    /// the range without applying data.
    FilteredRange {
        /// Header of the first suppressed event.
        from: EventHeader,
        /// Header of the last suppressed event.
        to: EventHeader,
    },
    /// No payload at all. The dispatcher discards these on ingest.
    #[default]
    Empty,
}

impl Payload {
    /// True when there is nothing to route or apply.
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// A replicated event: an ordered batch of row changes or a statement,
/// plus the positioning metadata that orders it in the stream.
///
/// Within one `seqno` the fragnos form a gap-free `0..=F` prefix and
/// exactly the maximal fragno carries `last_frag`. The dispatcher rejects
/// streams that violate this.
#[derive(Clone, Debug)]
pub struct ReplEvent {
    seqno: u64,
    fragno: u32,
    last_frag: bool,
    event_id: String,
    service: String,
    metadata: FxHashMap<String, String>,
    payload: Payload,
}

impl ReplEvent {
    /// A whole-transaction event (fragno 0, `last_frag` set) on the
    /// default service. Use the `with_*` builders to refine it.
    pub fn new(seqno: u64, event_id: impl Into<String>, payload: Payload) -> ReplEvent {
        ReplEvent {
            seqno,
            fragno: 0,
            last_frag: true,
            event_id: event_id.into(),
            service: "default".to_owned(),
            metadata: FxHashMap::default(),
            payload,
        }
    }

    /// Place this event at `fragno` within its transaction.
    pub fn with_fragment(self, fragno: u32, last_frag: bool) -> ReplEvent {
        ReplEvent {
            fragno,
            last_frag,
            ..self
        }
    }

    /// Tag this event with the logical source it originated from.
    pub fn with_service(self, service: impl Into<String>) -> ReplEvent {
        ReplEvent {
            service: service.into(),
            ..self
        }
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> ReplEvent {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sequence number; monotonically non-decreasing across the stream.
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Fragment index within the transaction.
    pub fn fragno(&self) -> u32 {
        self.fragno
    }

    /// True on the event that closes its transaction.
    pub fn last_frag(&self) -> bool {
        self.last_frag
    }

    /// Opaque upstream position string.
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Logical source tag.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Metadata lookup.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// True when the metadata key is present at all.
    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    /// The payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// True for heartbeat transactions.
    pub fn is_heartbeat(&self) -> bool {
        self.has_metadata(metadata::HEARTBEAT)
    }

    /// The minimal restart descriptor for this event.
    pub fn header(&self) -> EventHeader {
        EventHeader {
            seqno: self.seqno,
            fragno: self.fragno,
            last_frag: self.last_frag,
            event_id: self.event_id.clone(),
            source_id: self.service.clone(),
        }
    }

    /// The synthetic event delivered in place of a suppressed run. It
    /// carries the positioning of the last suppressed event so restart
    /// positions advance monotonically.
    pub fn filtered_range(from: EventHeader, to: EventHeader) -> ReplEvent {
        ReplEvent {
            seqno: to.seqno,
            fragno: to.fragno,
            last_frag: to.last_frag,
            event_id: to.event_id.clone(),
            service: to.source_id.clone(),
            metadata: FxHashMap::default(),
            payload: Payload::FilteredRange { from, to },
        }
    }
}

impl fmt::Display for ReplEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event({}/{})", self.seqno, self.fragno)?;
        if self.last_frag {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// The minimal restart descriptor. Every successfully processed event
/// yields one of these, and the header of the most recently *committed*
/// event is the only thing an applier needs to persist to resume without
/// gap or duplicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventHeader {
    /// Sequence number.
    pub seqno: u64,
    /// Fragment index.
    pub fragno: u32,
    /// Whether the event closed its transaction.
    pub last_frag: bool,
    /// Opaque upstream position string.
    pub event_id: String,
    /// Logical source the event originated from.
    pub source_id: String,
}

/// The kind of a control event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    /// Position marker broadcast to keep partitions loosely aligned.
    Sync,
    /// Orderly stop at the seqno carried by the event.
    Stop,
    /// Re-seeds a reader's position when it joins an already-running
    /// queue.
    Enroll,
}

/// An out-of-band marker synthesized by the dispatcher and broadcast to
/// every partition reader. Never upstream data: consumers treat it as a
/// position update.
#[derive(Clone, Debug)]
pub struct ControlEvent {
    /// What the marker means.
    pub kind: ControlKind,
    /// The seqno at which it was injected.
    pub seqno: u64,
    /// Restart descriptor of the event that triggered the injection, when
    /// one exists.
    pub header: Option<EventHeader>,
}

impl ControlEvent {
    /// A control event of `kind` injected at `seqno`.
    pub fn new(kind: ControlKind, seqno: u64) -> ControlEvent {
        ControlEvent {
            kind,
            seqno,
            header: None,
        }
    }

    /// Attach the triggering event's header.
    pub fn with_header(self, header: EventHeader) -> ControlEvent {
        ControlEvent {
            header: Some(header),
            ..self
        }
    }
}
