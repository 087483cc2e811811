//! Signal-driven call-stack sampler
//!
//! `setup()` installs a `SIGPROF` handler and arms `ITIMER_PROF`, so the
//! kernel interrupts whichever thread is burning CPU at the configured
//! frequency. The handler runs in signal context: it may not allocate or
//! take locks, so it only copies raw instruction pointers into a fixed,
//! preallocated table of atomic slots. Symbol resolution and aggregation
//! happen later in [`post_process`], outside signal context.
//!
//! Delivery is gated twice: a process-wide flag (`block_signals` /
//! `unblock_signals`) that the handler checks first, and the calling
//! thread's signal mask. Threads that are not `Enabled` are never sampled.

use crate::clock;
use crate::error::{Result, RuntimeError};
use crate::thread_info::{self, ThreadState};
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Samples kept per run
pub const MAX_SAMPLES: usize = 4096;
/// Frames kept per sample
pub const MAX_DEPTH: usize = 32;

const NO_THREAD: usize = usize::MAX;

struct SampleSlot {
    thread: AtomicUsize,
    ts: AtomicU64,
    /// Written last; nonzero marks a committed sample
    depth: AtomicUsize,
    frames: [AtomicUsize; MAX_DEPTH],
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO_FRAME: AtomicUsize = AtomicUsize::new(0);

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: SampleSlot = SampleSlot {
    thread: AtomicUsize::new(NO_THREAD),
    ts: AtomicU64::new(0),
    depth: AtomicUsize::new(0),
    frames: [ZERO_FRAME; MAX_DEPTH],
};

static SLOTS: [SampleSlot; MAX_SAMPLES] = [EMPTY_SLOT; MAX_SAMPLES];
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);
static DROPPED: AtomicU64 = AtomicU64::new(0);

static DELIVERY_OPEN: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);
static PREVIOUS_ACTION: Mutex<Option<SigAction>> = Mutex::new(None);
static WARMED: AtomicBool = AtomicBool::new(false);

/// Force the unwinder's one-time lazy allocation
///
/// Must run before the handler is armed so stack walks in signal context
/// never allocate.
pub fn warm_up() {
    if !WARMED.swap(true, Ordering::SeqCst) {
        let mut frames = 0usize;
        backtrace::trace(|_| {
            frames += 1;
            frames < 4
        });
        tracing::trace!("Unwinder warmed up ({frames} frame(s))");
    }
}

extern "C" fn on_sigprof(_signal: libc::c_int) {
    // SAFETY: errno is thread-local; restored before returning
    let saved_errno = unsafe { *libc::__errno_location() };
    record_sample();
    unsafe { *libc::__errno_location() = saved_errno };
}

fn record_sample() {
    if !DELIVERY_OPEN.load(Ordering::Relaxed) {
        return;
    }
    if thread_info::thread_state() != ThreadState::Enabled {
        return;
    }

    let index = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
    let Some(slot) = SLOTS.get(index) else {
        DROPPED.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let mut depth = 0usize;
    // SAFETY: the unwinder was warmed up before the handler was installed,
    // and the handler never runs re-entrantly on the same thread (SIGPROF
    // is masked while its handler runs).
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            slot.frames[depth].store(frame.ip() as usize, Ordering::Relaxed);
            depth += 1;
            depth < MAX_DEPTH
        });
    }

    slot.thread.store(
        thread_info::index_if_assigned().unwrap_or(NO_THREAD),
        Ordering::Relaxed,
    );
    slot.ts.store(clock::now_ns(), Ordering::Relaxed);
    slot.depth.store(depth, Ordering::Release);
}

fn profiling_timer(freq_hz: u32) -> libc::itimerval {
    let period_us = if freq_hz == 0 {
        0
    } else {
        (1_000_000 / i64::from(freq_hz)).max(1)
    };
    let interval = libc::timeval {
        tv_sec: (period_us / 1_000_000) as libc::time_t,
        tv_usec: (period_us % 1_000_000) as libc::suseconds_t,
    };
    libc::itimerval {
        it_interval: interval,
        it_value: interval,
    }
}

fn arm_timer(freq_hz: u32) -> Result<()> {
    let timer = profiling_timer(freq_hz);
    // SAFETY: plain syscall with a valid itimerval
    let rc = unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(RuntimeError::Signal(nix::errno::Errno::last()));
    }
    Ok(())
}

fn sigprof_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGPROF);
    set
}

/// Install the handler and arm the timer
///
/// Delivery stays closed until [`unblock_signals`].
pub fn setup(freq_hz: u32) -> Result<()> {
    if freq_hz == 0 {
        return Err(RuntimeError::Config(
            "sampling frequency must be > 0".to_string(),
        ));
    }
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    warm_up();

    let action = SigAction::new(
        SigHandler::Handler(on_sigprof),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics and preallocated statics
    let previous = match unsafe { sigaction(Signal::SIGPROF, &action) } {
        Ok(previous) => previous,
        Err(err) => {
            INSTALLED.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
    };
    *PREVIOUS_ACTION.lock().unwrap_or_else(|e| e.into_inner()) = Some(previous);

    if let Err(err) = arm_timer(freq_hz) {
        restore_previous_action();
        INSTALLED.store(false, Ordering::SeqCst);
        return Err(err);
    }
    tracing::debug!("Signal sampler armed at {freq_hz} Hz");
    Ok(())
}

fn restore_previous_action() {
    if let Some(previous) = PREVIOUS_ACTION
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
    {
        // a SIGPROF still in flight must not hit the default (terminate) action
        let restored = if previous.handler() == SigHandler::SigDfl {
            SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty())
        } else {
            previous
        };
        // SAFETY: reinstalling the action that was in place before setup
        if let Err(err) = unsafe { sigaction(Signal::SIGPROF, &restored) } {
            tracing::warn!("Failed to restore the previous SIGPROF action: {err}");
        }
    }
}

/// Disarm the timer and restore the previous handler
pub fn shutdown() {
    DELIVERY_OPEN.store(false, Ordering::SeqCst);
    if !INSTALLED.swap(false, Ordering::SeqCst) {
        return;
    }
    if let Err(err) = arm_timer(0) {
        tracing::warn!("Failed to disarm the profiling timer: {err}");
    }
    restore_previous_action();
    tracing::debug!("Signal sampler shut down");
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Close delivery process-wide and mask SIGPROF on the calling thread
pub fn block_signals() {
    DELIVERY_OPEN.store(false, Ordering::SeqCst);
    if let Err(err) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigprof_set()), None) {
        tracing::debug!("pthread_sigmask(SIG_BLOCK) failed: {err}");
    }
}

/// Open delivery process-wide and unmask SIGPROF on the calling thread
pub fn unblock_signals() {
    if let Err(err) = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&sigprof_set()), None) {
        tracing::debug!("pthread_sigmask(SIG_UNBLOCK) failed: {err}");
    }
    DELIVERY_OPEN.store(true, Ordering::SeqCst);
}

/// Mask SIGPROF on the calling thread only
pub fn block_current_thread() {
    if let Err(err) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigprof_set()), None) {
        tracing::debug!("pthread_sigmask(SIG_BLOCK) failed: {err}");
    }
}

pub fn delivery_open() -> bool {
    DELIVERY_OPEN.load(Ordering::SeqCst)
}

/// Number of committed samples not yet post-processed
pub fn pending_samples() -> usize {
    NEXT_SLOT.load(Ordering::SeqCst).min(MAX_SAMPLES)
}

/// One resolved sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub ts: u64,
    pub thread: Option<usize>,
    /// Innermost frame outside the sampler
    pub function: String,
}

/// Aggregated result of one sampling run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleReport {
    pub samples: Vec<Sample>,
    pub counts: BTreeMap<String, u64>,
    pub dropped: u64,
}

fn is_sampler_frame(name: &str) -> bool {
    name.contains("backtrace::")
        || name.contains("critrace::sampling")
        || name.contains("__restore_rt")
        || name.contains("sigreturn")
}

fn resolve_ip(ip: usize, cache: &mut HashMap<usize, Option<String>>) -> Option<String> {
    cache
        .entry(ip)
        .or_insert_with(|| {
            let mut name = None;
            backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
                if name.is_none() {
                    name = symbol.name().map(|n| format!("{n:#}"));
                }
            });
            name
        })
        .clone()
}

/// Resolve and aggregate the captured samples, then clear the table
///
/// Call after [`shutdown`].
pub fn post_process() -> SampleReport {
    let count = pending_samples();
    let mut cache = HashMap::new();
    let mut report = SampleReport {
        dropped: DROPPED.swap(0, Ordering::SeqCst),
        ..Default::default()
    };

    for slot in &SLOTS[..count] {
        let depth = slot.depth.swap(0, Ordering::Acquire);
        if depth == 0 {
            continue;
        }
        let function = (0..depth.min(MAX_DEPTH))
            .map(|i| slot.frames[i].load(Ordering::Relaxed))
            .filter_map(|ip| resolve_ip(ip, &mut cache))
            .find(|name| !is_sampler_frame(name))
            .unwrap_or_else(|| "<unknown>".to_string());

        let thread = slot.thread.swap(NO_THREAD, Ordering::Relaxed);
        *report.counts.entry(function.clone()).or_insert(0) += 1;
        report.samples.push(Sample {
            ts: slot.ts.load(Ordering::Relaxed),
            thread: (thread != NO_THREAD).then_some(thread),
            function,
        });
    }
    NEXT_SLOT.store(0, Ordering::SeqCst);

    if report.dropped > 0 {
        tracing::warn!(
            "Sample table full: {} sample(s) dropped",
            report.dropped
        );
    }
    tracing::debug!("Post-processed {} sample(s)", report.samples.len());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::{Duration, Instant};

    #[test]
    fn test_timer_period() {
        let timer = profiling_timer(100);
        assert_eq!(timer.it_interval.tv_sec, 0);
        assert_eq!(timer.it_interval.tv_usec, 10_000);
        let off = profiling_timer(0);
        assert_eq!(off.it_value.tv_usec, 0);
        assert_eq!(off.it_value.tv_sec, 0);
    }

    #[test]
    fn test_sampler_frame_filter() {
        assert!(is_sampler_frame("backtrace::backtrace::trace_unsynchronized"));
        assert!(is_sampler_frame("critrace::sampling::record_sample"));
        assert!(!is_sampler_frame("app::solve"));
    }

    #[test]
    #[serial]
    fn test_zero_frequency_rejected() {
        assert!(setup(0).is_err());
        assert!(!is_installed());
    }

    #[test]
    #[serial]
    fn test_blocked_sampler_records_nothing() {
        setup(1000).unwrap();
        block_signals();
        let _ = post_process();

        let deadline = Instant::now() + Duration::from_millis(50);
        let mut x = 0u64;
        while Instant::now() < deadline {
            x = x.wrapping_add(std::hint::black_box(1));
        }

        shutdown();
        assert!(post_process().samples.is_empty());
        assert!(x > 0);
    }

    #[test]
    #[serial]
    fn test_busy_loop_is_sampled() {
        warm_up();
        setup(1000).unwrap();
        assert!(is_installed());
        unblock_signals();

        let deadline = Instant::now() + Duration::from_millis(300);
        let mut x = 0u64;
        while Instant::now() < deadline {
            x = x.wrapping_add(std::hint::black_box(1));
        }

        block_signals();
        shutdown();
        assert!(!is_installed());

        let report = post_process();
        assert!(x > 0);
        assert!(!report.samples.is_empty());
        assert_eq!(
            report.counts.values().sum::<u64>(),
            report.samples.len() as u64
        );
        assert_eq!(pending_samples(), 0);
    }
}
