//! Lifecycle state and the lock-free guards around it
//!
//! ```text
//! PreInit ──init_library──▶ Init ──activation──▶ Active ──finalize──▶ Finalized
//! ```
//!
//! The state only moves forward. Every public entry point resolves its
//! first-call race with its own [`OnceFlag`]: the flag is claimed before the
//! body runs, so a concurrent second caller returns immediately instead of
//! blocking behind a lock held across the whole initialization. The price is
//! a narrow window where a second caller compares its arguments against a
//! first call that has not finished applying them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Process-wide lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    PreInit = 0,
    Init = 1,
    Active = 2,
    Finalized = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::PreInit,
            1 => LifecycleState::Init,
            2 => LifecycleState::Active,
            _ => LifecycleState::Finalized,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::PreInit => "PreInit",
            LifecycleState::Init => "Init",
            LifecycleState::Active => "Active",
            LifecycleState::Finalized => "Finalized",
        };
        f.write_str(name)
    }
}

/// Atomically updated lifecycle state with forward-only transitions
#[derive(Debug)]
pub struct StateCell {
    value: AtomicU8,
}

impl StateCell {
    pub const fn new() -> Self {
        Self {
            value: AtomicU8::new(LifecycleState::PreInit as u8),
        }
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.value.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`
    ///
    /// Fails (returning the observed state) when another thread already moved
    /// the state or when the transition would go backward.
    pub fn transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> std::result::Result<(), LifecycleState> {
        if to <= from {
            return Err(self.get());
        }
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }

    /// Advance to `to` from whatever earlier state is current
    ///
    /// Never moves backward; returns the state before the call.
    pub fn advance(&self, to: LifecycleState) -> LifecycleState {
        LifecycleState::from_u8(self.value.fetch_max(to as u8, Ordering::SeqCst))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare-and-set "once" flag guarding one entry point
#[derive(Debug, Default)]
pub struct OnceFlag {
    claimed: AtomicBool,
}

impl OnceFlag {
    pub const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
        }
    }

    /// Claim the flag; true only for the first caller
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }
}

/// Outcome of comparing a call's arguments with the captured ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgsCheck<T> {
    /// First call; arguments captured
    First,
    /// Same arguments as the captured ones
    Same,
    /// Different arguments; carries the captured value and the invocation number
    Conflict { captured: T, invocation: usize },
}

/// Arguments captured on the first call of an entry point
///
/// The mutex is held only for the comparison, never across the entry
/// point's body.
#[derive(Debug)]
pub struct CapturedArgs<T> {
    value: Mutex<Option<T>>,
    calls: AtomicUsize,
}

impl<T: Clone + PartialEq> CapturedArgs<T> {
    pub const fn new() -> Self {
        Self {
            value: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Record a call and compare it against the first one
    pub fn check(&self, args: &T) -> ArgsCheck<T> {
        let invocation = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.value.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            None => {
                *slot = Some(args.clone());
                ArgsCheck::First
            }
            Some(captured) if captured == args => ArgsCheck::Same,
            Some(captured) => ArgsCheck::Conflict {
                captured: captured.clone(),
                invocation,
            },
        }
    }

    /// Replace the captured arguments (keep-last conflict policy)
    pub fn replace(&self, args: T) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(args);
    }

    pub fn get(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<T: Clone + PartialEq> Default for CapturedArgs<T> {
    fn default() -> Self {
        Self::new()
    }
}
