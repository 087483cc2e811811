//! Error taxonomy for the instrumentation runtime
//!
//! Four classes of failure exist:
//!
//! - **usage-sequencing** errors: conflicting re-initialization, settings
//!   mutation after activation
//! - **invariant violations**: state mismatches, unbalanced push/pop counts,
//!   cyclic trace chains
//! - **I/O errors**: the trace file could not be opened or written
//! - **resource leaks**: instrumentation handles still open at finalize
//!
//! Leaks are always recoverable and never become a `RuntimeError`; they are
//! logged and listed in the finalize report. Usage and invariant errors pass
//! through [`ErrorPolicy`], which makes them fatal only in strict (CI) mode.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("{operation} called in an invalid sequence: {detail}")]
    UsageSequencing {
        operation: &'static str,
        detail: String,
    },

    #[error(
        "{operation} called multiple times with different arguments:\n    \
         Invocation #1: {operation}({first})\n    \
         Invocation #{invocation}: {operation}({current})"
    )]
    ConflictingArguments {
        operation: &'static str,
        first: String,
        current: String,
        invocation: usize,
    },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Cycle detected in critical-trace chain at sequence id {seq} (thread {thread})")]
    CyclicChain { thread: usize, seq: u64 },

    #[error("Error opening trace output file '{}': {source}", path.display())]
    TraceOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "push_trace was called more times than pop_trace. The inverse is fine but the \
         current state means not every measurement was ended :: pushed: {pushed} vs. popped: {popped}"
    )]
    UnbalancedRegions { pushed: u64, popped: u64 },

    #[error("Instrumentation bundle allocation failed on thread {thread}: capacity of {capacity} exhausted")]
    Allocation { thread: usize, capacity: usize },

    #[error("A trace session is already live in this process")]
    SessionActive,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Signal error: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("Trace encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Trace decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Decides whether a reportable error is fatal
///
/// In strict mode (`CRITRACE_CI`, or `CI=true` in the environment) every
/// escalated error is returned to the caller. Otherwise it is logged as a
/// warning and execution continues best-effort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub strict: bool,
}

impl ErrorPolicy {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Return the error in strict mode, log and swallow it otherwise
    pub fn escalate(&self, err: RuntimeError) -> Result<()> {
        if self.strict {
            tracing::error!("{err}");
            Err(err)
        } else {
            tracing::warn!("{err}");
            Ok(())
        }
    }

    /// Escalate only when `condition` holds
    pub fn check(&self, condition: bool, err: impl FnOnce() -> RuntimeError) -> Result<()> {
        if condition {
            self.escalate(err())
        } else {
            Ok(())
        }
    }
}
