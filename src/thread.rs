//! Spawning threads under the global runtime
//!
//! A thread started through [`spawn`] inherits two things from its parent:
//! the sampling-on-child-threads policy (the sampling signal is masked in the
//! child when the policy is off) and the parent's current critical-trace
//! node, which becomes the parent of the child's first top-level node.

use std::thread::JoinHandle;

/// Spawn a thread under the global runtime
pub fn spawn<F, T>(f: F) -> std::io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    crate::runtime().spawn(f)
}
