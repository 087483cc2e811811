//! Background process-level resource sampler
//!
//! A dedicated thread polls `getrusage` at a fixed interval and keeps the
//! readings in memory. `post_process()` turns them into counter events.

use crate::category::Category;
use crate::clock;
use crate::error::Result;
use crate::metrics::ResourceSnapshot;
use crate::thread_info::{self, ThreadState};
use crate::trace_session::TrackEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// One reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSample {
    pub ts: u64,
    pub usage: ResourceSnapshot,
}

#[derive(Debug)]
pub struct ProcessSampler {
    interval: Duration,
    stop: Arc<AtomicBool>,
    samples: Arc<Mutex<Vec<ProcessSample>>>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop: Arc::new(AtomicBool::new(false)),
            samples: Arc::new(Mutex::new(Vec::new())),
            handle: None,
        }
    }

    /// Start the polling thread (no-op if already running)
    pub fn setup(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.stop.store(false, Ordering::SeqCst);

        let stop = Arc::clone(&self.stop);
        let samples = Arc::clone(&self.samples);
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("critrace-process-sampler".to_string())
            .spawn(move || {
                thread_info::set_thread_state(ThreadState::Internal);
                crate::sampling::block_current_thread();
                loop {
                    match ResourceSnapshot::capture() {
                        Ok(usage) => samples
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(ProcessSample {
                                ts: clock::now_ns(),
                                usage,
                            }),
                        Err(err) => tracing::debug!("getrusage failed: {err}"),
                    }
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::park_timeout(interval);
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                }
            })?;
        self.handle = Some(handle);
        tracing::debug!("Process sampler started ({:?} interval)", self.interval);
        Ok(())
    }

    /// Stop and join the polling thread
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        handle.thread().unpark();
        if handle.join().is_err() {
            tracing::error!("Process sampler thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drain the readings as counter events
    pub fn post_process(&self) -> Vec<TrackEvent> {
        let samples = std::mem::take(&mut *self.samples.lock().unwrap_or_else(|e| e.into_inner()));
        let mut events = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            events.push(TrackEvent::Counter {
                ts: sample.ts,
                category: Category::ProcessSampling,
                name: "cpu_time_ms".to_string(),
                value: sample.usage.cpu_ns() as f64 / 1e6,
            });
            events.push(TrackEvent::Counter {
                ts: sample.ts,
                category: Category::ProcessSampling,
                name: "peak_rss_kb".to_string(),
                value: sample.usage.peak_rss_kb as f64,
            });
        }
        events
    }
}

impl Drop for ProcessSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
