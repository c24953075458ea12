use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::source::Record;

/// Records bound for one index, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub index: String,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.records.iter().map(Record::size).sum()
    }
}

#[derive(Debug, Default)]
struct OpenBatch {
    records: Vec<Record>,
    bytes: usize,
}

impl OpenBatch {
    fn take(&mut self, index: &str) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        self.bytes = 0;
        Some(Batch {
            index: index.to_string(),
            records: mem::take(&mut self.records),
        })
    }
}

/// Accumulates records into one open batch per target index.
///
/// Lock order is always the index map first, then a single index entry. The map
/// lock is released before the entry is touched on the offer path, so offers to
/// different indices only contend on the short map lookup.
pub struct RecordBatcher {
    max_items: usize,
    max_bytes: usize,
    open: Mutex<HashMap<String, Arc<Mutex<OpenBatch>>>>,
}

impl RecordBatcher {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            max_bytes: max_bytes.max(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Appends `record` to the open batch of `index`.
    ///
    /// Returns the previously open batch when the record does not fit in it; the
    /// record then starts the next batch. A record larger than the byte limit is
    /// never split, it simply ends up alone in its batch.
    pub fn offer(&self, index: &str, record: Record) -> Option<Batch> {
        let entry = {
            let mut open = lock(&self.open);
            Arc::clone(open.entry(index.to_string()).or_default())
        };
        let mut batch = lock(&*entry);

        let size = record.size();
        let overflows = batch.records.len() + 1 > self.max_items
            || batch.bytes.saturating_add(size) > self.max_bytes;
        let closed = if overflows { batch.take(index) } else { None };

        batch.bytes += size;
        batch.records.push(record);

        if let Some(closed) = &closed {
            debug!(
                index = %closed.index,
                items = closed.len(),
                "bulk batch full"
            );
        }
        closed
    }

    /// Closes and returns the open batch of `index`, if it holds anything.
    pub fn flush_index(&self, index: &str) -> Option<Batch> {
        let entry = lock(&self.open).get(index).cloned()?;
        let mut batch = lock(&*entry);
        batch.take(index)
    }

    /// Closes and returns every non-empty open batch. Idle index entries are
    /// dropped so that time-suffixed indices do not accumulate.
    pub fn flush(&self) -> Vec<Batch> {
        let mut open = lock(&self.open);
        let mut flushed = Vec::new();

        open.retain(|index, entry| {
            let taken = lock(&**entry).take(index);
            match taken {
                Some(batch) => {
                    flushed.push(batch);
                    true
                }
                // nobody else holds the entry while we hold the map lock
                None => Arc::strong_count(entry) > 1,
            }
        });

        flushed
    }

    /// Number of records waiting in open batches.
    pub fn pending(&self) -> usize {
        let open = lock(&self.open);
        open.values().map(|entry| lock(&**entry).records.len()).sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
