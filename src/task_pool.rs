//! Background task pool for finalize-time post-processing
//!
//! Workers pull boxed closures from a `crossbeam` channel. The pool starts
//! empty and grows on demand; `join()` blocks until every submitted task has
//! run, which is the barrier between the critical-trace phases.

use crate::error::{Result, RuntimeError};
use crate::thread_info::{self, ThreadState};
use crossbeam::channel::{self, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Upper bound on workers regardless of configuration
pub const MAX_WORKERS: usize = 8;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Number of workers to use: `min(hardware, configured, 8)`, at least 1
pub fn pool_size(hardware: usize, configured: usize) -> usize {
    hardware.min(configured).min(MAX_WORKERS).max(1)
}

/// Available hardware parallelism
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<usize>,
    idle: Condvar,
    panicked: AtomicU64,
    completed: AtomicU64,
}

impl Shared {
    fn finish_one(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Lazily sized group of worker threads
pub struct TaskPool {
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.size())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPool {
    /// Create a pool with no workers
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::new()),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Grow the pool to at least `workers` threads
    pub fn initialize(&self, workers: usize) -> Result<()> {
        if self.is_shut_down() {
            return Err(RuntimeError::UsageSequencing {
                operation: "TaskPool::initialize",
                detail: "the pool has been shut down".to_string(),
            });
        }

        let mut handles = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        while handles.len() < workers {
            let receiver = self.receiver.clone();
            let shared = Arc::clone(&self.shared);
            let id = handles.len();
            let handle = std::thread::Builder::new()
                .name(format!("critrace-pool-{id}"))
                .spawn(move || worker_loop(receiver, shared))?;
            handles.push(handle);
        }
        tracing::debug!("Task pool size: {}", handles.len());
        Ok(())
    }

    /// Queue a task, starting one worker if the pool is empty
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.size() == 0 {
            self.initialize(1)?;
        }

        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(RuntimeError::UsageSequencing {
                operation: "TaskPool::submit",
                detail: "the pool has been shut down".to_string(),
            });
        };

        *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if sender.send(Box::new(task)).is_err() {
            self.shared.finish_one();
            return Err(RuntimeError::Invariant(
                "task pool channel disconnected".to_string(),
            ));
        }
        Ok(())
    }

    /// Block until every submitted task has completed
    pub fn join(&self) {
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = self
                .shared
                .idle
                .wait(pending)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Close the queue and join every worker
    pub fn shutdown(&self) {
        self.join();
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());

        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Task pool worker exited abnormally");
            }
        }
    }

    pub fn size(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn pending(&self) -> usize {
        *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Tasks that panicked (they still count as completed)
    pub fn panicked(&self) -> u64 {
        self.shared.panicked.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Task>, shared: Arc<Shared>) {
    // pool threads are runtime machinery, never instrumented
    thread_info::set_thread_state(ThreadState::Internal);

    while let Ok(task) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            shared.panicked.fetch_add(1, Ordering::SeqCst);
            tracing::error!("Task pool task panicked");
        }
        shared.finish_one();
    }
}
