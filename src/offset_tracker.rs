//! Offset tracker - accumulates the highest processed offset per partition
//! between commits.
//!
//! The event loop stores next-to-read offsets (the message offset plus one),
//! so a snapshot can be handed to the commit RPC verbatim. Entries are
//! removed as the broker confirms them and the whole map is cleared on
//! rebalance, so the tracker only ever holds offsets the current assignment
//! is still responsible for.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::debug;

use crate::types::{Partition, PartitionOffset};

struct TrackedOffset {
    /// Next offset to consume for this partition.
    offset: i64,
    /// Messages processed since this key entered the map.
    counter: usize,
}

/// Per-partition high-water accumulator with processed counters.
///
/// All access is serialized by the owning consumer's event loop; the
/// concurrent map keeps the tracker `Sync` without any further locking.
#[derive(Default)]
pub struct OffsetTracker {
    entries: DashMap<Partition, TrackedOffset>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a processed offset. The stored offset never regresses while
    /// the key is present; the counter advances on every call.
    pub fn add(&self, po: PartitionOffset) {
        self.entries
            .entry(po.partition().clone())
            .and_modify(|entry| {
                if po.offset() > entry.offset {
                    entry.offset = po.offset();
                }
                entry.counter += 1;
            })
            .or_insert_with(|| TrackedOffset {
                offset: po.offset(),
                counter: 1,
            });
    }

    /// Snapshot of the tracked offsets, commit-ready, plus the processed
    /// count per partition.
    pub fn snapshot(&self) -> (Vec<PartitionOffset>, HashMap<Partition, usize>) {
        let mut offsets = Vec::with_capacity(self.entries.len());
        let mut counts = HashMap::with_capacity(self.entries.len());
        for entry in self.entries.iter() {
            offsets.push(PartitionOffset::new(entry.key().clone(), entry.value().offset));
            counts.insert(entry.key().clone(), entry.value().counter);
        }
        (offsets, counts)
    }

    /// Drop the entry with the matching partition key, whatever its offset.
    pub fn remove(&self, po: &PartitionOffset) {
        if self.entries.remove(po.partition()).is_some() {
            debug!(
                topic = po.topic(),
                partition = po.partition_number(),
                "dropped tracked offset"
            );
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Total processed count across all entries.
    pub fn counter(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().counter).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
