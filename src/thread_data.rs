//! Per-thread containers of a runtime
//!
//! Each observed thread owns one [`ThreadData`] slot addressed by its
//! ordinal. Only the owning thread touches its slot while the program runs;
//! the finalizing thread reads all of them once the application threads are
//! quiesced. Every slot sits behind its own mutex, so the owner's lock is
//! uncontended on the hot path.

use crate::bundle::{Bundle, BundleArena};
use crate::critical_trace::ChainHandle;
use crate::hash_table::HashTable;
use crate::metrics::ThreadMetrics;
use crate::thread_info::{self, ThreadRecord};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug)]
pub struct ThreadData {
    pub record: ThreadRecord,
    pub bundles: BundleArena,
    pub metrics: ThreadMetrics,
    pub names: HashTable,
    /// Cached handle of this thread's CPU chain
    pub cpu_chain: Option<ChainHandle>,
    /// Bundles left open by earlier owners of a recycled ordinal
    pub orphaned: Vec<Bundle>,
}

impl ThreadData {
    fn new(record: ThreadRecord, max_bundles: usize) -> Self {
        Self {
            record,
            bundles: BundleArena::new(max_bundles),
            metrics: ThreadMetrics::new(),
            names: HashTable::new(),
            cpu_chain: None,
            orphaned: Vec::new(),
        }
    }
}

type Slot = Arc<Mutex<ThreadData>>;

fn lock(slot: &Slot) -> MutexGuard<'_, ThreadData> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ordinal-indexed slots of every thread seen by one runtime
#[derive(Debug)]
pub struct ThreadRegistry {
    slots: RwLock<Vec<Option<Slot>>>,
    max_bundles: usize,
}

impl ThreadRegistry {
    pub fn new(max_bundles: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            max_bundles,
        }
    }

    /// Slot of the calling thread, created on first touch
    pub fn current(&self) -> Slot {
        let record = thread_info::current();
        if let Some(slot) = self.get(record.index) {
            let mut data = lock(&slot);
            // a recycled ordinal now belongs to a different OS thread
            if data.record.os_tid != record.os_tid {
                let orphaned = data.bundles.drain_open();
                if !orphaned.is_empty() {
                    tracing::debug!(
                        "Thread {} (TID={}) exited with {} open bundle(s)",
                        data.record.index,
                        data.record.os_tid,
                        orphaned.len()
                    );
                }
                data.orphaned.extend(orphaned);
                data.record = record;
                data.cpu_chain = None;
            }
            drop(data);
            return slot;
        }

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots.len() <= record.index {
            slots.resize_with(record.index + 1, || None);
        }
        Arc::clone(
            slots[record.index]
                .get_or_insert_with(|| Arc::new(Mutex::new(ThreadData::new(record, self.max_bundles)))),
        )
    }

    pub fn get(&self, index: usize) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .and_then(Clone::clone)
    }

    /// Every slot in ordinal order
    pub fn all(&self) -> Vec<Slot> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Import every thread's hash table and region statistics into the
    /// first slot's, returning copies of the merged tables
    pub fn merge_into_first(&self) -> (HashTable, ThreadMetrics) {
        let slots = self.all();
        let Some((first, rest)) = slots.split_first() else {
            return (HashTable::new(), ThreadMetrics::new());
        };

        let mut names = HashTable::new();
        let mut metrics = ThreadMetrics::new();
        for slot in rest {
            let data = lock(slot);
            names.import(&data.names);
            metrics.merge(&data.metrics);
        }

        let mut zero = lock(first);
        zero.names.import(&names);
        zero.metrics.merge(&metrics);
        for slot in rest {
            lock(slot).metrics.reset();
        }
        (zero.names.clone(), zero.metrics.clone())
    }
}
