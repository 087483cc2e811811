//! Per-thread instrumentation bundles
//!
//! A bundle is the measurement handle of one open region. Each thread owns a
//! [`BundleArena`]: bundles live in an index-addressed slab, and a LIFO stack
//! of indices tracks which ones are open. Every pushed bundle must be popped;
//! whatever is still open at finalize is drained, stopped, and reported as a
//! leak by the caller.

use crate::category::Category;
use crate::clock;
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

/// Index of a bundle inside its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleId(usize);

/// Measurement handle of one region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub label: String,
    pub hash: u64,
    pub category: Category,
    /// Internal thread ordinal
    pub thread: usize,
    pub os_tid: i64,
    pub start_ns: u64,
    pub stop_ns: Option<u64>,
    /// Thread CPU time at start, when the cpu clock is measured
    pub cpu_start_ns: Option<u64>,
}

impl Bundle {
    pub fn new(label: &str, hash: u64, category: Category, thread: usize, os_tid: i64) -> Self {
        Self {
            label: label.to_string(),
            hash,
            category,
            thread,
            os_tid,
            start_ns: clock::now_ns(),
            stop_ns: None,
            cpu_start_ns: None,
        }
    }

    /// Stamp the stop time (idempotent)
    pub fn stop(&mut self) {
        if self.stop_ns.is_none() {
            self.stop_ns = Some(clock::now_ns().max(self.start_ns));
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_ns.is_none()
    }

    pub fn elapsed_ns(&self) -> u64 {
        self.stop_ns
            .unwrap_or_else(clock::now_ns)
            .saturating_sub(self.start_ns)
    }
}

/// Slab of bundles plus the stack of open ones
#[derive(Debug)]
pub struct BundleArena {
    slots: Vec<Option<Bundle>>,
    free: Vec<usize>,
    stack: Vec<BundleId>,
    capacity: usize,
}

impl BundleArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            stack: Vec::new(),
            capacity,
        }
    }

    /// Store an open bundle and push it on the stack
    pub fn push(&mut self, bundle: Bundle) -> Result<BundleId> {
        let thread = bundle.thread;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(bundle);
                index
            }
            None => {
                if self.slots.len() >= self.capacity {
                    return Err(RuntimeError::Allocation {
                        thread,
                        capacity: self.capacity,
                    });
                }
                self.slots.push(Some(bundle));
                self.slots.len() - 1
            }
        };
        let id = BundleId(index);
        self.stack.push(id);
        Ok(id)
    }

    /// Close the top-most open bundle with `label`
    ///
    /// Returns `None` when no open bundle carries the label.
    pub fn pop(&mut self, label: &str) -> Option<Bundle> {
        let position = self.stack.iter().rposition(|id| {
            self.slots[id.0]
                .as_ref()
                .is_some_and(|b| b.label == label)
        })?;

        if position + 1 != self.stack.len() {
            tracing::warn!(
                "Region '{}' popped out of order ({} region(s) opened after it are still open)",
                label,
                self.stack.len() - position - 1
            );
        }

        let id = self.stack.remove(position);
        self.release(id)
    }

    /// Stop and remove every open bundle, top of the stack first
    pub fn drain_open(&mut self) -> Vec<Bundle> {
        let mut drained = Vec::with_capacity(self.stack.len());
        while let Some(id) = self.stack.pop() {
            if let Some(bundle) = self.release(id) {
                drained.push(bundle);
            }
        }
        drained
    }

    fn release(&mut self, id: BundleId) -> Option<Bundle> {
        let mut bundle = self.slots.get_mut(id.0)?.take()?;
        bundle.stop();
        self.free.push(id.0);
        Some(bundle)
    }

    pub fn get(&self, id: BundleId) -> Option<&Bundle> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Number of open bundles
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Label of the innermost open bundle
    pub fn top_label(&self) -> Option<&str> {
        self.stack
            .last()
            .and_then(|id| self.get(*id))
            .map(|b| b.label.as_str())
    }
}
