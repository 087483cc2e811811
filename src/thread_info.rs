//! Per-thread records and thread state
//!
//! Every thread that touches the runtime gets an internal ordinal on first
//! touch. Ordinals index the per-thread containers of the runtime; the first
//! thread gets 0. With recycling enabled an exiting thread hands its ordinal
//! back, so long-running programs that churn short-lived threads keep the
//! containers dense. Finalization turns recycling off so the ordinals seen
//! during the merge stay stable.
//!
//! The thread state and the ordinal live in const-initialized thread-locals
//! so the sampling signal handler can read them without allocating.

use nix::unistd::gettid;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Marker for "no ordinal assigned yet"
const UNASSIGNED: usize = usize::MAX;

/// Per-thread state used to suppress instrumentation and sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    Enabled,
    Disabled,
    /// Inside the runtime's own machinery
    Internal,
    /// Thread has finished (or is finalizing)
    Completed,
}

/// Identity of one observed thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// Internal ordinal
    pub index: usize,
    /// OS thread id
    pub os_tid: i64,
}

static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);
static FREE_INDICES: Mutex<Vec<usize>> = Mutex::new(Vec::new());
static RECYCLE_IDS: AtomicBool = AtomicBool::new(true);
static SAMPLING_ON_FUTURE_THREADS: AtomicBool = AtomicBool::new(true);

thread_local! {
    static STATE: Cell<ThreadState> = const { Cell::new(ThreadState::Enabled) };
    static INDEX: Cell<usize> = const { Cell::new(UNASSIGNED) };
    static OS_TID: Cell<i64> = const { Cell::new(0) };
    static RELEASE: IndexRelease = const { IndexRelease };
    static CHILD_SAMPLING: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
}

/// Returns the thread's ordinal to the free list when the thread exits
struct IndexRelease;

impl Drop for IndexRelease {
    fn drop(&mut self) {
        let index = INDEX.try_with(|c| c.get()).unwrap_or(UNASSIGNED);
        if index != UNASSIGNED && RECYCLE_IDS.load(Ordering::SeqCst) {
            FREE_INDICES
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(index);
        }
    }
}

fn allocate_index() -> usize {
    if RECYCLE_IDS.load(Ordering::SeqCst) {
        let mut free = FREE_INDICES.lock().unwrap_or_else(|e| e.into_inner());
        // lowest free ordinal first keeps containers dense
        if let Some(pos) = free
            .iter()
            .enumerate()
            .min_by_key(|(_, idx)| **idx)
            .map(|(pos, _)| pos)
        {
            return free.swap_remove(pos);
        }
    }
    NEXT_INDEX.fetch_add(1, Ordering::SeqCst)
}

/// Record of the calling thread, assigning an ordinal on first touch
pub fn current() -> ThreadRecord {
    let index = INDEX.with(|cell| {
        let index = cell.get();
        if index != UNASSIGNED {
            return index;
        }
        let index = allocate_index();
        cell.set(index);
        OS_TID.with(|tid| tid.set(i64::from(gettid().as_raw())));
        // touching the destructor-bearing local registers the release hook
        RELEASE.with(|_| ());
        index
    });
    ThreadRecord {
        index,
        os_tid: OS_TID.with(Cell::get),
    }
}

/// Ordinal of the calling thread
pub fn index() -> usize {
    current().index
}

/// Ordinal without assignment; safe to call from a signal handler
pub fn index_if_assigned() -> Option<usize> {
    INDEX
        .try_with(|cell| cell.get())
        .ok()
        .filter(|idx| *idx != UNASSIGNED)
}

/// Number of ordinals handed out so far
pub fn max_assigned() -> usize {
    NEXT_INDEX.load(Ordering::SeqCst)
}

/// Enable or disable ordinal recycling
pub fn set_recycle_ids(enabled: bool) {
    RECYCLE_IDS.store(enabled, Ordering::SeqCst);
}

pub fn recycle_ids() -> bool {
    RECYCLE_IDS.load(Ordering::SeqCst)
}

/// State of the calling thread
pub fn thread_state() -> ThreadState {
    STATE.try_with(Cell::get).unwrap_or(ThreadState::Completed)
}

/// Set the calling thread's state, returning the previous one
pub fn set_thread_state(state: ThreadState) -> ThreadState {
    STATE
        .try_with(|cell| cell.replace(state))
        .unwrap_or(ThreadState::Completed)
}

/// Sets the thread state for a scope and restores the previous one on drop
#[must_use = "the previous thread state is restored when the guard drops"]
pub struct ScopedThreadState {
    previous: ThreadState,
}

impl ScopedThreadState {
    pub fn new(state: ThreadState) -> Self {
        Self {
            previous: set_thread_state(state),
        }
    }
}

impl Drop for ScopedThreadState {
    fn drop(&mut self) {
        // a thread marked Completed stays completed
        if thread_state() != ThreadState::Completed {
            set_thread_state(self.previous);
        }
    }
}

/// Whether threads spawned from here should be sampled
pub fn sampling_on_child_threads() -> bool {
    CHILD_SAMPLING
        .try_with(|stack| stack.borrow().last().copied())
        .ok()
        .flatten()
        .unwrap_or_else(|| SAMPLING_ON_FUTURE_THREADS.load(Ordering::SeqCst))
}

pub fn push_sampling_on_child_threads(enabled: bool) {
    let _ = CHILD_SAMPLING.try_with(|stack| stack.borrow_mut().push(enabled));
}

pub fn pop_sampling_on_child_threads() {
    let _ = CHILD_SAMPLING.try_with(|stack| stack.borrow_mut().pop());
}

/// Global default for threads with no explicit policy
pub fn set_sampling_on_all_future_threads(enabled: bool) {
    SAMPLING_ON_FUTURE_THREADS.store(enabled, Ordering::SeqCst);
}

/// Pushes a child-thread sampling policy for a scope
#[must_use = "the policy is popped when the guard drops"]
pub struct ScopedChildSampling;

impl ScopedChildSampling {
    pub fn new(enabled: bool) -> Self {
        push_sampling_on_child_threads(enabled);
        Self
    }
}

impl Drop for ScopedChildSampling {
    fn drop(&mut self) {
        pop_sampling_on_child_threads();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_current_is_stable() {
        let a = current();
        let b = current();
        assert_eq!(a, b);
        assert!(a.os_tid > 0);
        assert_eq!(index_if_assigned(), Some(a.index));
    }

    #[test]
    fn test_threads_get_distinct_indices() {
        let here = index();
        let there = thread::spawn(index).join().unwrap();
        // the spawned thread is still alive when it reads its index, so it
        // cannot have been handed ours
        assert_ne!(here, there);
    }

    #[test]
    fn test_unassigned_thread_has_no_index() {
        let seen = thread::spawn(index_if_assigned).join().unwrap();
        assert_eq!(seen, None);
    }

    #[test]
    fn test_scoped_thread_state_restores() {
        thread::spawn(|| {
            assert_eq!(thread_state(), ThreadState::Enabled);
            {
                let _guard = ScopedThreadState::new(ThreadState::Internal);
                assert_eq!(thread_state(), ThreadState::Internal);
            }
            assert_eq!(thread_state(), ThreadState::Enabled);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_completed_state_sticks() {
        thread::spawn(|| {
            {
                let _guard = ScopedThreadState::new(ThreadState::Internal);
                set_thread_state(ThreadState::Completed);
            }
            assert_eq!(thread_state(), ThreadState::Completed);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_child_sampling_stack() {
        thread::spawn(|| {
            let default = sampling_on_child_threads();
            {
                let _off = ScopedChildSampling::new(false);
                assert!(!sampling_on_child_threads());
                {
                    let _on = ScopedChildSampling::new(true);
                    assert!(sampling_on_child_threads());
                }
                assert!(!sampling_on_child_threads());
            }
            assert_eq!(sampling_on_child_threads(), default);
        })
        .join()
        .unwrap();
    }
}
