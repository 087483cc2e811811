//! critrace - in-process instrumentation runtime
//!
//! This library provides an exactly-once lifecycle (init, activate, finalize)
//! for an instrumentation runtime loaded into a host program, per-thread
//! region bundles, a trace session writing MessagePack track events, signal
//! and process-level sampling, and a cross-thread, cross-device critical
//! path computed at finalize.
//!
//! Hosts either own a [`Runtime`] (usually through a [`RuntimeHandle`]) or
//! use the free functions below, which drive one process-global runtime
//! configured from `CRITRACE_*` environment variables.
//!
//! # Example
//! ```no_run
//! critrace::init("trace", false, "app")?;
//! critrace::push_trace("main")?;
//! // ...
//! critrace::pop_trace("main")?;
//! critrace::finalize()?;
//! # Ok::<(), critrace::RuntimeError>(())
//! ```

pub mod bundle;
pub mod category;
pub mod cli;
pub mod clock;
pub mod components;
pub mod config;
pub mod critical_trace;
pub mod error;
pub mod ffi;
pub mod hash_table;
pub mod logging;
pub mod metrics;
pub mod process_sampler;
pub mod runtime;
pub mod sampling;
pub mod state;
pub mod task_pool;
pub mod thread;
pub mod thread_data;
pub mod thread_info;
pub mod trace_session;

pub use config::RuntimeConfig;
pub use error::{ErrorPolicy, Result, RuntimeError};
pub use runtime::{FinalizeReport, LeakedBundle, Runtime, RuntimeBuilder, RuntimeHandle};
pub use state::LifecycleState;

use state::OnceFlag;
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();
static EXIT_HOOK: OnceFlag = OnceFlag::new();

fn create_global() -> Arc<Runtime> {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => {
            logging::init_logging(config.verbose, config.debug);
            config
        }
        Err(err) => {
            logging::init_logging(0, false);
            tracing::warn!("Falling back to the default configuration: {err}");
            RuntimeConfig::default()
        }
    };
    let builder = RuntimeBuilder::new().config(config).global();
    Arc::new(builder.build_unchecked())
}

/// The process-global runtime, created on first use
pub fn runtime() -> &'static Arc<Runtime> {
    GLOBAL.get_or_init(create_global)
}

extern "C" fn finalize_at_exit() {
    let Some(runtime) = GLOBAL.get() else {
        return;
    };
    if runtime.state() != LifecycleState::Active {
        return;
    }
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| runtime.finalize()));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => tracing::error!("Finalize at exit failed: {err}"),
        Err(_) => tracing::error!("Finalize at exit panicked"),
    }
}

/// Register the finalize-on-exit hook of the global runtime (once)
pub(crate) fn register_exit_hook() {
    if !EXIT_HOOK.claim() {
        return;
    }
    // SAFETY: the hook is a plain function with no captured state
    if unsafe { libc::atexit(finalize_at_exit) } != 0 {
        tracing::warn!("Failed to register the finalize-on-exit hook");
    }
}

/// Record the instrumentation mode and program name
pub fn init(mode: &str, is_binary_rewrite: bool, argv0: &str) -> Result<()> {
    runtime().init(mode, is_binary_rewrite, argv0)
}

pub fn init_library() -> Result<()> {
    runtime().init_library()
}

/// Initialize and activate; false when tooling is disabled or already done
pub fn init_tooling() -> Result<bool> {
    runtime().init_tooling()
}

pub fn push_trace(name: &str) -> Result<()> {
    runtime().push_trace(name)
}

pub fn pop_trace(name: &str) -> Result<()> {
    runtime().pop_trace(name)
}

pub fn push_region(name: &str) -> Result<()> {
    runtime().push_region(name)
}

pub fn pop_region(name: &str) -> Result<()> {
    runtime().pop_region(name)
}

pub fn set_env(name: &str, value: &str) -> Result<()> {
    runtime().set_env(name, value)
}

pub fn set_mpi(use_mpi: bool, attached: bool) -> Result<()> {
    runtime().set_mpi(use_mpi, attached)
}

pub fn finalize() -> Result<FinalizeReport> {
    runtime().finalize()
}
