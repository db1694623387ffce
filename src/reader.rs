use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::dispatch::SectionGate;
use crate::error::{Error, Result};
use crate::event::{ControlEvent, ReplEvent};
use crate::watermark::Watermark;

/// What a partition reader hands its consumer.
#[derive(Clone, Debug)]
pub enum QueueItem {
    /// A data event routed to this partition.
    Event(Arc<ReplEvent>),
    /// A control marker broadcast by the dispatcher.
    Control(ControlEvent),
}

impl QueueItem {
    /// The seqno the item is ordered at.
    pub fn seqno(&self) -> u64 {
        match self {
            QueueItem::Event(ev) => ev.seqno(),
            QueueItem::Control(c) => c.seqno,
        }
    }
}

/// Which queue the next item comes from. Decided under the reader lock,
/// consumed after the section gate has been cleared.
enum Front {
    Data(u64),
    Control,
}

struct ReaderState {
    data: VecDeque<Arc<ReplEvent>>,
    ctrl: VecDeque<ControlEvent>,
    closed: bool,
}

/// The queues of one partition: a bounded data FIFO fed by the
/// dispatcher's router and a bounded control FIFO fed by broadcasts.
/// Single producer (the dispatcher), single consumer (the partition
/// worker holding the [`PartitionReader`]).
pub(crate) struct ReaderCore {
    index: u32,
    max_data: usize,
    max_ctrl: usize,
    state: Mutex<ReaderState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl ReaderCore {
    pub(crate) fn new(index: u32, max_data: usize, max_ctrl: usize) -> ReaderCore {
        ReaderCore {
            index,
            max_data,
            max_ctrl,
            state: Mutex::new(ReaderState {
                data: VecDeque::new(),
                ctrl: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue a data event; blocks while the data queue is full.
    pub(crate) fn put_event(&self, event: Arc<ReplEvent>) -> Result<()> {
        let mut state = self.state.lock();
        while state.data.len() >= self.max_data && !state.closed {
            debug!("reader {} data queue full, producer waiting", self.index);
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(Error::Canceled);
        }
        state.data.push_back(event);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue a control event; blocks while the control queue is full.
    pub(crate) fn put_control(&self, control: ControlEvent) -> Result<()> {
        let mut state = self.state.lock();
        while state.ctrl.len() >= self.max_ctrl && !state.closed {
            debug!("reader {} control queue full, producer waiting", self.index);
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(Error::Canceled);
        }
        state.ctrl.push_back(control);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Decide which queue the next item comes from, blocking while both
    /// are empty. A closed reader drains its remaining items before
    /// reporting cancellation.
    fn wait_front(&self) -> Result<Front> {
        let mut state = self.state.lock();
        loop {
            match (state.data.front(), state.ctrl.front()) {
                // A control event at seqno S is delivered after every
                // data event with seqno < S and before any with seqno
                // > S; on a tie the data event goes first.
                (Some(d), Some(c)) if c.seqno < d.seqno() => return Ok(Front::Control),
                (Some(d), _) => return Ok(Front::Data(d.seqno())),
                (None, Some(_)) => return Ok(Front::Control),
                (None, None) if state.closed => return Err(Error::Canceled),
                (None, None) => self.not_empty.wait(&mut state),
            }
        }
    }

    fn pop_data(&self) -> Arc<ReplEvent> {
        let mut state = self.state.lock();
        let ev = state.data.pop_front().expect("data queue emptied under single consumer");
        self.not_full.notify_one();
        ev
    }

    fn pop_control(&self) -> ControlEvent {
        let mut state = self.state.lock();
        let c = state.ctrl.pop_front().expect("control queue emptied under single consumer");
        self.not_full.notify_one();
        c
    }

    /// Seqno of the oldest queued data event, if any. Consulted by the
    /// section gate when deciding whether this partition has drained
    /// everything ordered before a critical section.
    pub(crate) fn min_pending_data_seqno(&self) -> Option<u64> {
        self.state.lock().data.front().map(|ev| ev.seqno())
    }

    /// Current queue depths `(data, control)`.
    pub(crate) fn depths(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.data.len(), state.ctrl.len())
    }

    /// Wake both sides; subsequent puts fail and gets drain then fail.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// The consumer handle of one partition.
///
/// `get` merges the partition's data and control queues in seqno order
/// and enforces the critical-section gate: a data event ordered at or
/// after an unretired critical section owned by another partition is not
/// delivered until the section retires. Control events are position
/// markers and pass the gate freely.
pub struct PartitionReader {
    index: u32,
    core: Arc<ReaderCore>,
    gate: Arc<SectionGate>,
    watermark: Arc<Watermark>,
}

impl PartitionReader {
    pub(crate) fn new(
        index: u32,
        core: Arc<ReaderCore>,
        gate: Arc<SectionGate>,
        watermark: Arc<Watermark>,
    ) -> PartitionReader {
        PartitionReader {
            index,
            core,
            gate,
            watermark,
        }
    }

    /// Which partition this reader serves.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Next item in seqno order. Blocks on an empty reader, on the
    /// critical-section gate, and returns [`Error::Canceled`] once the
    /// queue has been shut down and drained.
    pub fn get(&mut self) -> Result<QueueItem> {
        match self.core.wait_front()? {
            Front::Control => Ok(QueueItem::Control(self.core.pop_control())),
            Front::Data(seqno) => {
                self.gate
                    .await_clearance(self.index, seqno, &self.watermark)?;
                let event = self.core.pop_data();
                self.gate.note_delivered(self.index, seqno);
                Ok(QueueItem::Event(event))
            }
        }
    }
}
