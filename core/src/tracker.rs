//! Per-partition progress of records between "pulled" and "durably written".
//!
//! Offsets are tracked when a record is received and acknowledged once its bulk
//! write resolved (success, or a fatal failure that has been reported). The safe
//! offset of a partition only moves over a contiguous prefix of acknowledged
//! offsets, so a record still being retried holds back everything after it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::source::Partition;

#[derive(Debug, Default)]
struct PartitionProgress {
    /// Tracked offsets that are not yet part of the safe prefix, with their ack flag.
    pending: BTreeMap<i64, bool>,
    safe: Option<i64>,
}

impl PartitionProgress {
    fn advance(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if !*entry.get() {
                break;
            }
            let (offset, _) = entry.remove_entry();
            self.safe = Some(offset);
        }
    }
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: RwLock<HashMap<Partition, Arc<Mutex<PartitionProgress>>>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, partition: &Partition) -> Arc<Mutex<PartitionProgress>> {
        if let Some(entry) = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
        {
            return Arc::clone(entry);
        }
        let mut partitions = self
            .partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(partitions.entry(partition.clone()).or_default())
    }

    fn existing(&self, partition: &Partition) -> Option<Arc<Mutex<PartitionProgress>>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .cloned()
    }

    /// Starts tracking a received record. Offsets at or below the safe offset
    /// (redelivered after a rebalance) are ignored.
    pub fn track(&self, partition: &Partition, offset: i64) {
        let entry = self.entry(partition);
        let mut progress = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if progress.safe.is_some_and(|safe| offset <= safe) {
            debug!(%partition, offset, "ignoring offset below safe point");
            return;
        }
        progress.pending.entry(offset).or_insert(false);
    }

    /// Marks the write of `offset` as resolved.
    pub fn record_ack(&self, partition: &Partition, offset: i64) {
        let Some(entry) = self.existing(partition) else {
            warn!(%partition, offset, "ack for untracked partition");
            return;
        };
        let mut progress = entry.lock().unwrap_or_else(PoisonError::into_inner);
        match progress.pending.get_mut(&offset) {
            Some(acked) => *acked = true,
            None => {
                debug!(%partition, offset, "ack for untracked offset");
                return;
            }
        }
        progress.advance();
    }

    /// Highest offset of `partition` below which every tracked record is acknowledged.
    pub fn safe_offset(&self, partition: &Partition) -> Option<i64> {
        let entry = self.existing(partition)?;
        let progress = entry.lock().unwrap_or_else(PoisonError::into_inner);
        progress.safe
    }

    /// Safe offsets of every partition that has one.
    pub fn safe_offsets(&self) -> Vec<(Partition, i64)> {
        let partitions = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        partitions
            .iter()
            .filter_map(|(partition, entry)| {
                let progress = entry.lock().unwrap_or_else(PoisonError::into_inner);
                progress.safe.map(|safe| (partition.clone(), safe))
            })
            .collect()
    }

    /// Tracked offsets that are not yet covered by a safe offset.
    pub fn outstanding(&self) -> usize {
        let partitions = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        partitions
            .values()
            .map(|entry| {
                let progress = entry.lock().unwrap_or_else(PoisonError::into_inner);
                progress.pending.len()
            })
            .sum()
    }
}
