//! Timestamps and sequence ids
//!
//! Two clocks are used by the runtime:
//!
//! - a monotonic nanosecond clock relative to a process-wide epoch, shared by
//!   every thread so that start/stop timestamps of different threads are
//!   comparable
//! - a [`SequenceCounter`], a logical clock handing out strictly increasing
//!   ids. Critical-trace parents are always allocated before their children,
//!   so a parent's id is always smaller than the child's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Pin the epoch (called during library initialization)
pub fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds since the process epoch
pub fn now_ns() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Monotonic logical counter
///
/// # Example
///
/// ```
/// use critrace::clock::SequenceCounter;
///
/// static IDS: SequenceCounter = SequenceCounter::new();
///
/// let a = IDS.tick();
/// let b = IDS.tick();
/// assert!(a < b);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    counter: AtomicU64,
}

impl SequenceCounter {
    /// Create a counter starting at 0
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Create a counter whose first tick returns `initial_value`
    pub const fn with_value(initial_value: u64) -> Self {
        Self {
            counter: AtomicU64::new(initial_value),
        }
    }

    /// Return the next id
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure every future id is greater than `observed`
    pub fn sync(&self, observed: u64) {
        self.counter.fetch_max(observed + 1, Ordering::SeqCst);
    }

    /// The id the next tick will return
    pub fn now(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
