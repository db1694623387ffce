use std::hash::{BuildHasherDefault, Hasher};

use indexmap::IndexMap;
use rustc_hash::FxHasher;

use crate::error::{Error, Result};
use crate::event::{metadata, ReplEvent};

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// Where an event goes, and whether it must be serialized globally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assignment {
    /// Target partition, in `0..partitions`.
    pub partition: u32,
    /// A critical event must not execute concurrently with any event
    /// routed to a different partition; the dispatcher folds runs of
    /// critical events into critical sections.
    pub critical: bool,
}

/// Maps an event to a partition.
///
/// Implementations are pure: they may look at the event and the task
/// hint, and nothing else. The dispatcher calls this once per event on
/// the producer thread, so no internal synchronization is needed either.
pub trait Partitioner: Send {
    /// Assign `event` to a partition. `task_id` identifies the calling
    /// dispatch task for partitioners that key off it.
    fn assign(&self, event: &ReplEvent, task_id: u32) -> Assignment;
}

/// The shard key the default partitioner hashes: the `SERVICE` metadata
/// entry when present, the event's service tag otherwise.
pub fn shard_key(event: &ReplEvent) -> &str {
    event
        .metadata(metadata::SERVICE)
        .unwrap_or_else(|| event.service())
}

/// Default partitioner: hashes the shard key modulo the partition count.
///
/// Events with an empty shard key cannot be placed consistently, so they
/// are routed to partition 0 and marked critical, which serializes them
/// against all lanes.
#[derive(Debug)]
pub struct HashPartitioner {
    partitions: u32,
}

impl HashPartitioner {
    /// A hash partitioner over `partitions` lanes.
    pub fn new(partitions: u32) -> HashPartitioner {
        assert!(partitions > 0, "partition count must be positive");
        HashPartitioner { partitions }
    }
}

impl Partitioner for HashPartitioner {
    fn assign(&self, event: &ReplEvent, _task_id: u32) -> Assignment {
        let key = shard_key(event);
        if key.is_empty() {
            return Assignment {
                partition: 0,
                critical: true,
            };
        }
        let mut hasher = FxHasher::default();
        hasher.write(key.as_bytes());
        Assignment {
            partition: (hasher.finish() % u64::from(self.partitions)) as u32,
            critical: false,
        }
    }
}

/// Round-robins transactions across lanes by seqno. Never critical.
/// Useful for tests and for single-source deployments where no shard key
/// exists but ordering within a transaction is enough.
#[derive(Debug)]
pub struct RoundRobinPartitioner {
    partitions: u32,
}

impl RoundRobinPartitioner {
    /// A round-robin partitioner over `partitions` lanes.
    pub fn new(partitions: u32) -> RoundRobinPartitioner {
        assert!(partitions > 0, "partition count must be positive");
        RoundRobinPartitioner { partitions }
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn assign(&self, event: &ReplEvent, _task_id: u32) -> Assignment {
        Assignment {
            partition: (event.seqno() % u64::from(self.partitions)) as u32,
            critical: false,
        }
    }
}

/// Factory signature for registry entries.
pub type PartitionerFactory = fn(u32) -> Box<dyn Partitioner>;

/// A closed set of named partitioners plus a registration hook.
///
/// Deployments pick a partitioner by short symbolic name in
/// configuration; embedders may register additional factories under new
/// names. There is no runtime class loading: an unknown name is an
/// invariant error at configuration time.
pub struct PartitionerRegistry {
    factories: FxIndexMap<&'static str, PartitionerFactory>,
}

impl Default for PartitionerRegistry {
    fn default() -> PartitionerRegistry {
        let mut registry = PartitionerRegistry {
            factories: FxIndexMap::default(),
        };
        registry.register("hash", |n| Box::new(HashPartitioner::new(n)));
        registry.register("round-robin", |n| Box::new(RoundRobinPartitioner::new(n)));
        registry
    }
}

impl PartitionerRegistry {
    /// The registry pre-seeded with the built-in partitioners.
    pub fn new() -> PartitionerRegistry {
        PartitionerRegistry::default()
    }

    /// Associate `name` with a factory. Re-registering a name replaces
    /// the previous factory.
    pub fn register(&mut self, name: &'static str, factory: PartitionerFactory) {
        self.factories.insert(name, factory);
    }

    /// Instantiate the partitioner registered under `name` for
    /// `partitions` lanes.
    pub fn create(&self, name: &str, partitions: u32) -> Result<Box<dyn Partitioner>> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory(partitions)),
            None => Err(Error::Invariant(format!("unknown partitioner {name:?}"))),
        }
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}
