//! In-process trace session
//!
//! ```text
//! push/pop ──encode──▶ SegQueue (staged) ──flush──▶ PacketBuffer ──read──▶ bytes
//! ```
//!
//! Packets are MessagePack-encoded [`TracePacket`]s. Encoding happens on the
//! calling thread; the staging queue is lock-free so the hot path never
//! waits on the buffer lock. Once the staged bytes pass a threshold the
//! emitting thread drains the queue if the buffer lock is free, so the fill
//! policy bounds memory while recording, not just at stop. At most one
//! session may be live in a process.

pub mod buffer;
pub mod combine;

pub use buffer::{BufferStats, PacketBuffer};
pub use combine::{combine_multi_process, decode_trace, write, RankExchange, SingleProcess};

use crate::category::Category;
use crate::config::FillPolicy;
use crate::error::{Result, RuntimeError};
use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, TryLockError};

static SESSION_LIVE: AtomicBool = AtomicBool::new(false);

/// Upper bound on staged bytes before an emitting thread drains the queue
const MAX_STAGED_BYTES: usize = 256 * 1024;

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    pub buffer_size_bytes: usize,
    pub fill_policy: FillPolicy,
    pub shmem_size_hint_kb: u64,
    pub enabled: BTreeSet<Category>,
    pub disabled: BTreeSet<Category>,
}

impl TraceConfig {
    /// Build a session configuration
    ///
    /// An empty `categories` set enables every category. Unknown names are
    /// ignored with a warning.
    pub fn build(
        buffer_size_kb: u64,
        fill_policy: FillPolicy,
        shmem_size_hint_kb: u64,
        categories: &BTreeSet<String>,
    ) -> Self {
        let mut enabled = BTreeSet::new();
        for name in categories {
            match Category::ALL.iter().find(|c| c.as_str() == name.as_str()) {
                Some(category) => {
                    enabled.insert(*category);
                }
                None => tracing::warn!("Unknown trace category '{name}' ignored"),
            }
        }
        if categories.is_empty() {
            enabled.extend(Category::ALL);
        }
        let disabled = Category::ALL
            .iter()
            .copied()
            .filter(|c| !enabled.contains(c))
            .collect();

        Self {
            buffer_size_bytes: usize::try_from(buffer_size_kb.saturating_mul(1024))
                .unwrap_or(usize::MAX),
            fill_policy,
            shmem_size_hint_kb,
            enabled,
            disabled,
        }
    }

    pub fn is_enabled(&self, category: Category) -> bool {
        self.enabled.contains(&category)
    }
}

/// One track event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackEvent {
    SliceBegin {
        ts: u64,
        thread: usize,
        os_tid: i64,
        category: Category,
        name: String,
    },
    SliceEnd {
        ts: u64,
        thread: usize,
        os_tid: i64,
        category: Category,
        name: String,
    },
    Counter {
        ts: u64,
        category: Category,
        name: String,
        value: f64,
    },
    Instant {
        ts: u64,
        thread: usize,
        category: Category,
        name: String,
    },
}

impl TrackEvent {
    pub fn category(&self) -> Category {
        match self {
            TrackEvent::SliceBegin { category, .. }
            | TrackEvent::SliceEnd { category, .. }
            | TrackEvent::Counter { category, .. }
            | TrackEvent::Instant { category, .. } => *category,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TrackEvent::SliceBegin { name, .. }
            | TrackEvent::SliceEnd { name, .. }
            | TrackEvent::Counter { name, .. }
            | TrackEvent::Instant { name, .. } => name,
        }
    }
}

/// Event tagged with the producing process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePacket {
    pub pid: u32,
    pub event: TrackEvent,
}

impl TracePacket {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Configured = 0,
    Started = 1,
    Stopped = 2,
}

/// Handle to the process's trace session
#[derive(Debug)]
pub struct TraceSession {
    config: TraceConfig,
    pid: u32,
    state: AtomicU8,
    staged: SegQueue<Vec<u8>>,
    staged_bytes: AtomicUsize,
    flush_threshold: usize,
    buffer: Mutex<PacketBuffer>,
}

impl TraceSession {
    pub fn configure(config: TraceConfig) -> Self {
        tracing::debug!(
            "Trace session: {} KiB buffer, {:?}, disabled categories {:?}",
            config.buffer_size_bytes / 1024,
            config.fill_policy,
            config.disabled
        );
        let buffer = PacketBuffer::new(config.buffer_size_bytes, config.fill_policy);
        let flush_threshold = (config.buffer_size_bytes / 4).clamp(1, MAX_STAGED_BYTES);
        Self {
            config,
            pid: std::process::id(),
            state: AtomicU8::new(SessionState::Configured as u8),
            staged: SegQueue::new(),
            staged_bytes: AtomicUsize::new(0),
            flush_threshold,
            buffer: Mutex::new(buffer),
        }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            0 => SessionState::Configured,
            1 => SessionState::Started,
            _ => SessionState::Stopped,
        }
    }

    /// Open the session; fails if another session is live in the process
    pub fn start(&self) -> Result<()> {
        if self.state() != SessionState::Configured {
            return Ok(());
        }
        if SESSION_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RuntimeError::SessionActive);
        }
        self.state
            .store(SessionState::Started as u8, Ordering::SeqCst);
        tracing::debug!("Trace session started");
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.state() == SessionState::Started
    }

    /// Stage one event; returns false when it was filtered out
    pub fn emit(&self, event: TrackEvent) -> Result<bool> {
        if !self.is_recording() || !self.config.is_enabled(event.category()) {
            return Ok(false);
        }
        let packet = TracePacket {
            pid: self.pid,
            event,
        };
        let bytes = packet.encode()?;
        let len = bytes.len();
        // counted before the push so a concurrent drain never underflows
        let staged = self.staged_bytes.fetch_add(len, Ordering::AcqRel) + len;
        self.staged.push(bytes);
        if staged >= self.flush_threshold {
            // whoever holds the lock is already draining
            let buffer = match self.buffer.try_lock() {
                Ok(buffer) => Some(buffer),
                Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            };
            if let Some(mut buffer) = buffer {
                self.drain_into(&mut buffer);
            }
        }
        Ok(true)
    }

    /// Move staged packets into the buffer
    pub fn flush(&self) -> usize {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        self.drain_into(&mut buffer)
    }

    fn drain_into(&self, buffer: &mut PacketBuffer) -> usize {
        let mut moved = 0;
        while let Some(packet) = self.staged.pop() {
            self.staged_bytes.fetch_sub(packet.len(), Ordering::AcqRel);
            if buffer.push(packet) {
                moved += 1;
            }
        }
        moved
    }

    /// Bytes encoded but not yet moved into the buffer
    pub fn staged_bytes(&self) -> usize {
        self.staged_bytes.load(Ordering::Acquire)
    }

    /// Flush and close the session, releasing the process-wide slot
    pub fn stop(&self) {
        if self.state() != SessionState::Started {
            return;
        }
        self.flush();
        self.state
            .store(SessionState::Stopped as u8, Ordering::SeqCst);
        SESSION_LIVE.store(false, Ordering::SeqCst);

        let stats = self.stats();
        if stats.total_dropped > 0 {
            tracing::warn!(
                "Trace buffer dropped {} of {} packets ({:.1}%); consider a larger buffer",
                stats.total_dropped,
                stats.total_pushed,
                stats.drop_rate() * 100.0
            );
        }
        tracing::debug!("Trace session stopped");
    }

    /// Recorded bytes (only meaningful after `stop`)
    pub fn read(&self) -> Vec<u8> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bytes()
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).stats()
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if self.state() == SessionState::Started {
            SESSION_LIVE.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn all_categories() -> TraceConfig {
        TraceConfig::build(64, FillPolicy::Discard, 4096, &BTreeSet::new())
    }

    fn begin(name: &str, category: Category) -> TrackEvent {
        TrackEvent::SliceBegin {
            ts: 1,
            thread: 0,
            os_tid: 1,
            category,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_build_empty_enables_all() {
        let config = all_categories();
        assert_eq!(config.enabled.len(), Category::ALL.len());
        assert!(config.disabled.is_empty());
        assert_eq!(config.buffer_size_bytes, 64 * 1024);
    }

    #[test]
    fn test_build_disables_the_rest() {
        let categories: BTreeSet<String> = ["host".to_string(), "bogus".to_string()].into();
        let config = TraceConfig::build(1, FillPolicy::RingBuffer, 0, &categories);
        assert!(config.is_enabled(Category::Host));
        assert!(!config.is_enabled(Category::User));
        assert_eq!(config.disabled.len(), Category::ALL.len() - 1);
    }

    #[test]
    #[serial]
    fn test_emit_requires_started_session() {
        let session = TraceSession::configure(all_categories());
        assert!(!session.emit(begin("main", Category::Host)).unwrap());
        session.start().unwrap();
        assert!(session.emit(begin("main", Category::Host)).unwrap());
        session.stop();
        assert!(!session.emit(begin("late", Category::Host)).unwrap());

        let packets = decode_trace(&session.read()).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].event.name(), "main");
        assert_eq!(packets[0].pid, std::process::id());
    }

    #[test]
    #[serial]
    fn test_disabled_category_filtered() {
        let categories: BTreeSet<String> = ["user".to_string()].into();
        let session =
            TraceSession::configure(TraceConfig::build(64, FillPolicy::Discard, 0, &categories));
        session.start().unwrap();
        assert!(!session.emit(begin("coarse", Category::Host)).unwrap());
        assert!(session.emit(begin("fine", Category::User)).unwrap());
        session.stop();
        assert_eq!(decode_trace(&session.read()).unwrap().len(), 1);
    }

    #[test]
    #[serial]
    fn test_one_live_session_per_process() {
        let first = TraceSession::configure(all_categories());
        let second = TraceSession::configure(all_categories());
        first.start().unwrap();
        assert!(matches!(second.start(), Err(RuntimeError::SessionActive)));
        first.stop();
        second.start().unwrap();
        second.stop();
    }

    #[test]
    #[serial]
    fn test_dropping_started_session_releases_slot() {
        {
            let session = TraceSession::configure(all_categories());
            session.start().unwrap();
        }
        let next = TraceSession::configure(all_categories());
        assert!(next.start().is_ok());
        next.stop();
    }

    #[test]
    #[serial]
    fn test_staging_stays_bounded_while_recording() {
        for policy in [FillPolicy::Discard, FillPolicy::RingBuffer] {
            let session =
                TraceSession::configure(TraceConfig::build(4, policy, 0, &BTreeSet::new()));
            session.start().unwrap();
            for i in 0..2_000 {
                session.emit(begin(&format!("region-{i}"), Category::User)).unwrap();
                assert!(session.staged_bytes() < session.flush_threshold);
                assert!(session.stats().current_bytes <= 4 * 1024);
            }
            // most packets reached the buffer before stop
            assert!(session.stats().total_pushed > 1_900);
            session.stop();
            assert_eq!(session.staged_bytes(), 0);

            let stats = session.stats();
            assert_eq!(stats.total_pushed, 2_000);
            assert!(stats.total_dropped > 0);
            let packets = decode_trace(&session.read()).unwrap();
            let last = packets.last().unwrap().event.name().to_string();
            match policy {
                FillPolicy::Discard => assert_ne!(last, "region-1999"),
                FillPolicy::RingBuffer => assert_eq!(last, "region-1999"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_empty_session_reads_nothing() {
        let session = TraceSession::configure(all_categories());
        session.start().unwrap();
        session.stop();
        assert!(session.read().is_empty());
    }
}
