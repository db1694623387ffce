//! Per-reader ordering and control broadcast placement under threaded
//! consumption.

use crossbeam_utils::thread;
use replicore::{
    ControlKind, HashPartitioner, ParallelQueue, PartitionReader, Payload, QueueConfig, QueueItem,
    ReplEvent, RoundRobinPartitioner,
};

use crate::{data_event, init_logging};

/// Drain every reader on its own thread until shutdown, returning the
/// items each one observed.
fn drain_threaded(
    queue: ParallelQueue,
    readers: Vec<PartitionReader>,
    produce: impl FnOnce(&mut ParallelQueue),
) -> Vec<Vec<QueueItem>> {
    let mut queue = queue;
    thread::scope(|scope| {
        let handles: Vec<_> = readers
            .into_iter()
            .map(|mut reader| {
                scope.spawn(move |_| {
                    let mut items = Vec::new();
                    while let Ok(item) = reader.get() {
                        items.push(item);
                    }
                    items
                })
            })
            .collect();
        produce(&mut queue);
        queue.shutdown();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
    .unwrap()
}

#[test]
fn readers_observe_extractor_order() {
    init_logging();
    const PARTITIONS: u32 = 4;
    const EVENTS: u64 = 400;
    let config = QueueConfig::default()
        .partitions(PARTITIONS)
        .max_size(16) // force producer backpressure
        .sync_interval(50);
    let (queue, readers) =
        ParallelQueue::new(config, Box::new(HashPartitioner::new(PARTITIONS)));
    let services = ["accounts", "billing", "inventory", "audit", "sessions"];

    let collected = drain_threaded(queue, readers, |queue| {
        for seqno in 1..=EVENTS {
            let service = services[(seqno % services.len() as u64) as usize];
            queue
                .put(data_event(seqno).with_service(service))
                .unwrap();
        }
    });

    let mut delivered = 0u64;
    for items in &collected {
        // Data events strictly increase per reader; every item seqno is
        // non-decreasing since controls slot in at their position.
        let mut last_data = None;
        let mut last_seqno = 0;
        for item in items {
            assert!(item.seqno() >= last_seqno, "seqno regressed in a reader");
            last_seqno = item.seqno();
            if let QueueItem::Event(ev) = item {
                if let Some(prev) = last_data {
                    assert!(ev.seqno() > prev, "data order violated");
                }
                last_data = Some(ev.seqno());
                delivered += 1;
            }
        }
    }
    assert_eq!(delivered, EVENTS, "every routed event must be delivered once");
}

#[test]
fn sync_reaches_every_reader_in_position() {
    init_logging();
    let config = QueueConfig::default().partitions(2).sync_interval(2);
    let (queue, readers) =
        ParallelQueue::new(config, Box::new(RoundRobinPartitioner::new(2)));

    let collected = drain_threaded(queue, readers, |queue| {
        for seqno in 1..=6 {
            queue.put(data_event(seqno)).unwrap();
        }
    });

    for items in &collected {
        let syncs: Vec<u64> = items
            .iter()
            .filter_map(|item| match item {
                QueueItem::Control(c) if c.kind == ControlKind::Sync => Some(c.seqno),
                _ => None,
            })
            .collect();
        assert_eq!(syncs, vec![2, 4, 6]);
        // No data event beyond a sync point may precede it.
        for (index, item) in items.iter().enumerate() {
            if let QueueItem::Control(c) = item {
                for earlier in &items[..index] {
                    assert!(earlier.seqno() <= c.seqno);
                }
            }
        }
    }
}

#[test]
fn fragmented_transactions_stay_in_order() {
    init_logging();
    let config = QueueConfig::default().partitions(2);
    let (queue, readers) =
        ParallelQueue::new(config, Box::new(HashPartitioner::new(2)));

    let collected = drain_threaded(queue, readers, |queue| {
        for seqno in 1..=50 {
            let frags = 1 + (seqno % 3) as u32;
            for fragno in 0..frags {
                let event = ReplEvent::new(
                    seqno,
                    format!("binlog.000001:{seqno}:{fragno}"),
                    Payload::Statement("w".into()),
                )
                .with_fragment(fragno, fragno == frags - 1)
                .with_service(if seqno % 2 == 0 { "even" } else { "odd" });
                queue.put(event).unwrap();
            }
        }
    });

    for items in &collected {
        let mut last = None;
        for item in items {
            if let QueueItem::Event(ev) = item {
                let key = (ev.seqno(), ev.fragno());
                if let Some(prev) = last {
                    assert!(key > prev, "fragment order violated: {key:?} after {prev:?}");
                }
                last = Some(key);
            }
        }
    }
}
