//! Lifecycle coordinator
//!
//! [`Runtime`] ties the subsystems together:
//!
//! ```text
//! PreInit ──init_library──▶ Init ──activation──▶ Active ──finalize──▶ Finalized
//! ```
//!
//! Every entry point is idempotent. The first-call race of each one is
//! settled by its own [`OnceFlag`]; no lock is held across an entry point's
//! body, so the runtime's own instrumentation can re-enter it safely.
//!
//! `finalize` runs its phases strictly in order and never skips a later
//! phase because an earlier one failed. Only the aggregate checks at the end
//! (output file, cyclic chains, unbalanced regions) reach the caller.

use crate::bundle::Bundle;
use crate::category::Category;
use crate::clock;
use crate::components::{Component, ComponentKind, ComponentSet};
use crate::config::{ConflictPolicy, RuntimeConfig};
use crate::critical_trace::{CriticalTrace, CriticalTraceReport, Device};
use crate::error::{ErrorPolicy, Result, RuntimeError};
use crate::metrics::{self, MetricComponent, MetricsBackend};
use crate::process_sampler::ProcessSampler;
use crate::sampling;
use crate::state::{ArgsCheck, CapturedArgs, LifecycleState, OnceFlag, StateCell};
use crate::task_pool::{self, TaskPool};
use crate::thread_data::ThreadRegistry;
use crate::thread_info::{self, ScopedChildSampling, ScopedThreadState, ThreadState};
use crate::trace_session::{
    self, combine_multi_process, RankExchange, SingleProcess, TraceConfig, TraceSession, TrackEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Arguments of `init`
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitArgs {
    mode: String,
    is_binary_rewrite: bool,
    argv0: String,
}

impl fmt::Display for InitArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\", {}, \"{}\"",
            self.mode, self.is_binary_rewrite, self.argv0
        )
    }
}

/// Arguments of `set_mpi`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MpiArgs {
    use_mpi: bool,
    attached: bool,
}

impl fmt::Display for MpiArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "use={}, attached={}", self.use_mpi, self.attached)
    }
}

type FinalizationCallback = Box<dyn FnOnce(&Runtime) + Send>;

/// Instrumentation handle still open when finalize ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakedBundle {
    pub thread: usize,
    pub os_tid: i64,
    pub label: String,
    pub category: Category,
}

/// What `finalize` did
#[derive(Debug, Clone, Default)]
pub struct FinalizeReport {
    /// False when finalize returned early (not Active, or already finalized)
    pub performed: bool,
    pub pushed: u64,
    pub popped: u64,
    pub leaked: Vec<LeakedBundle>,
    pub critical_trace: Option<CriticalTraceReport>,
    pub trace_file: Option<PathBuf>,
    pub trace_bytes: usize,
    pub metrics_file: Option<PathBuf>,
    pub samples: usize,
}

impl FinalizeReport {
    fn skipped() -> Self {
        Self::default()
    }
}

/// Builder for a [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    components: ComponentSet,
    exchange: Box<dyn RankExchange>,
    global: bool,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            components: ComponentSet::new(),
            exchange: Box::new(SingleProcess),
            global: false,
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an external collaborator
    pub fn component(mut self, kind: ComponentKind, component: Box<dyn Component>) -> Self {
        self.components.add(kind, component);
        self
    }

    /// Rank exchange used to combine traces in a distributed run
    pub fn exchange(mut self, exchange: Box<dyn RankExchange>) -> Self {
        self.exchange = exchange;
        self
    }

    pub(crate) fn global(mut self) -> Self {
        self.global = true;
        self
    }

    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        Ok(self.build_unchecked())
    }

    pub(crate) fn build_unchecked(self) -> Runtime {
        let max_bundles = self.config.max_bundles_per_thread;
        let process_interval = Duration::from_millis(self.config.process_sampling_interval_ms);
        Runtime {
            config: RwLock::new(self.config),
            state: StateCell::new(),
            global: self.global,
            init_library_once: OnceFlag::new(),
            init_tooling_once: OnceFlag::new(),
            finalize_once: OnceFlag::new(),
            banner_once: OnceFlag::new(),
            preinit_once: OnceFlag::new(),
            library_explicit: AtomicBool::new(false),
            init_args: CapturedArgs::new(),
            mpi_args: CapturedArgs::new(),
            init_called: AtomicBool::new(false),
            mpi_called: AtomicBool::new(false),
            env_names: Mutex::new(HashSet::new()),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            finalization_callbacks: Mutex::new(Vec::new()),
            trace_critical: AtomicBool::new(false),
            collect_metrics: AtomicBool::new(false),
            measure_cpu: AtomicBool::new(false),
            sampling_armed: AtomicBool::new(false),
            threads: ThreadRegistry::new(max_bundles),
            critical: CriticalTrace::new(),
            pool: TaskPool::new(),
            metrics: Mutex::new(MetricsBackend::new()),
            session: RwLock::new(None),
            process_sampler: Mutex::new(ProcessSampler::new(process_interval)),
            components: Mutex::new(self.components),
            exchange: self.exchange,
        }
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Instrumentation runtime instance
pub struct Runtime {
    config: RwLock<RuntimeConfig>,
    state: StateCell,
    global: bool,

    init_library_once: OnceFlag,
    init_tooling_once: OnceFlag,
    finalize_once: OnceFlag,
    banner_once: OnceFlag,
    preinit_once: OnceFlag,
    library_explicit: AtomicBool,

    init_args: CapturedArgs<InitArgs>,
    mpi_args: CapturedArgs<MpiArgs>,
    init_called: AtomicBool,
    mpi_called: AtomicBool,
    env_names: Mutex<HashSet<String>>,

    push_count: AtomicU64,
    pop_count: AtomicU64,
    finalization_callbacks: Mutex<Vec<FinalizationCallback>>,

    // frozen copies of the configuration read on the hot path
    trace_critical: AtomicBool,
    collect_metrics: AtomicBool,
    measure_cpu: AtomicBool,
    sampling_armed: AtomicBool,

    threads: ThreadRegistry,
    critical: CriticalTrace,
    pool: TaskPool,
    metrics: Mutex<MetricsBackend>,
    session: RwLock<Option<TraceSession>>,
    process_sampler: Mutex<ProcessSampler>,
    components: Mutex<ComponentSet>,
    exchange: Box<dyn RankExchange>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state.get())
            .field("global", &self.global)
            .field("pushed", &self.push_count.load(Ordering::SeqCst))
            .field("popped", &self.pop_count.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Runs the activation step when `init_tooling` leaves its scope
struct ActivationGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        self.runtime.activate();
    }
}

/// Puts back the thread state a non-global finalize replaced
struct RestoreThreadState(ThreadState);

impl Drop for RestoreThreadState {
    fn drop(&mut self) {
        thread_info::set_thread_state(self.0);
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn new(config: RuntimeConfig) -> Result<Self> {
        RuntimeBuilder::new().config(config).build()
    }

    /// Runtime configured from the environment
    pub fn from_env() -> Result<Self> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> RuntimeConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::new(self.config.read().unwrap_or_else(|e| e.into_inner()).strict)
    }

    pub fn push_count(&self) -> u64 {
        self.push_count.load(Ordering::SeqCst)
    }

    pub fn pop_count(&self) -> u64 {
        self.pop_count.load(Ordering::SeqCst)
    }

    pub fn critical_trace(&self) -> &CriticalTrace {
        &self.critical
    }

    /// Register a callback run at finalize while pushes outnumber pops
    pub fn add_finalization_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        relock(&self.finalization_callbacks).push(Box::new(callback));
    }

    /// Report a conflicting re-invocation; returns whether the new
    /// arguments should replace the captured ones
    fn on_conflict(
        &self,
        operation: &'static str,
        first: String,
        current: String,
        invocation: usize,
    ) -> Result<bool> {
        let err = RuntimeError::ConflictingArguments {
            operation,
            first,
            current,
            invocation,
        };
        let policy = self.config().conflict_policy;
        match policy {
            ConflictPolicy::Error => {
                tracing::error!("{err}");
                Err(err)
            }
            ConflictPolicy::KeepFirst => {
                self.policy().escalate(err)?;
                Ok(false)
            }
            ConflictPolicy::KeepLast => {
                self.policy().escalate(err)?;
                Ok(true)
            }
        }
    }

    /// Record the instrumentation mode and program name
    pub fn init(&self, mode: &str, is_binary_rewrite: bool, argv0: &str) -> Result<()> {
        let args = InitArgs {
            mode: mode.to_string(),
            is_binary_rewrite,
            argv0: argv0.to_string(),
        };
        let first = match self.init_args.check(&args) {
            ArgsCheck::First => true,
            ArgsCheck::Same => return Ok(()),
            ArgsCheck::Conflict {
                captured,
                invocation,
            } => {
                if !self.on_conflict("init", captured.to_string(), args.to_string(), invocation)? {
                    return Ok(());
                }
                self.init_args.replace(args.clone());
                false
            }
        };

        let state = self.state.get();
        self.policy().check(state >= LifecycleState::Init, || {
            RuntimeError::UsageSequencing {
                operation: "init",
                detail: format!("called after initialization (state: {state})"),
            }
        })?;

        // one closing callback per runtime, whatever the later arguments
        if first {
            let program = args.argv0.clone();
            self.add_finalization_callback(move |runtime| {
                if runtime.state() == LifecycleState::Active {
                    if let Err(err) = runtime.stop_region(&program, Category::Host, true) {
                        tracing::warn!("Closing '{program}' at finalize failed: {err}");
                    }
                }
            });
        }

        if self.global {
            crate::register_exit_hook();
        }

        if state == LifecycleState::PreInit {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            // an explicit mode in the environment wins
            if std::env::var_os("CRITRACE_MODE").is_none() {
                config.mode = args.mode.clone();
            }
            config.is_binary_rewrite = is_binary_rewrite;
        }

        self.init_called.store(true, Ordering::SeqCst);
        self.start_preinit();
        Ok(())
    }

    /// Start the pre-init bundle once both `init` and `set_mpi` have run
    fn start_preinit(&self) {
        if self.init_called.load(Ordering::SeqCst)
            && self.mpi_called.load(Ordering::SeqCst)
            && self.preinit_once.claim()
        {
            tracing::debug!("Starting the pre-init bundle");
            relock(&self.components).start(ComponentKind::PreInit);
        }
    }

    /// Declare whether this process is part of a distributed run
    pub fn set_mpi(&self, use_mpi: bool, attached: bool) -> Result<()> {
        let args = MpiArgs { use_mpi, attached };
        match self.mpi_args.check(&args) {
            ArgsCheck::First => {}
            ArgsCheck::Same => return Ok(()),
            ArgsCheck::Conflict {
                captured,
                invocation,
            } => {
                if !self.on_conflict(
                    "set_mpi",
                    captured.to_string(),
                    args.to_string(),
                    invocation,
                )? {
                    return Ok(());
                }
                self.mpi_args.replace(args);
            }
        }

        let state = self.state.get();
        self.policy().check(state >= LifecycleState::Init, || {
            RuntimeError::UsageSequencing {
                operation: "set_mpi",
                detail: format!("must be called before initialization (state: {state})"),
            }
        })?;

        if state == LifecycleState::PreInit {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            config.use_mpi = use_mpi;
            config.attached = attached;
            if use_mpi && !attached {
                config.use_pid = true;
            } else if !use_mpi {
                config.use_comm = false;
            }
        }

        self.mpi_called.store(true, Ordering::SeqCst);
        self.start_preinit();
        Ok(())
    }

    /// Set an environment variable for the process
    ///
    /// `CRITRACE_*` keys also update the configuration while the runtime
    /// is in `PreInit`; after that the configuration is frozen and a new
    /// key is a usage error.
    pub fn set_env(&self, name: &str, value: &str) -> Result<()> {
        let first_time = relock(&self.env_names).insert(name.to_string());
        std::env::set_var(name, value);

        let state = self.state.get();
        if state == LifecycleState::PreInit {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            let mut updated = config.clone();
            match updated.apply(name, value) {
                Ok(true) => *config = updated,
                Ok(false) => {}
                Err(err) => {
                    drop(config);
                    return self.policy().escalate(err);
                }
            }
            return Ok(());
        }

        self.policy().check(first_time, || RuntimeError::UsageSequencing {
            operation: "set_env",
            detail: format!("{name}={value} set after initialization (state: {state})"),
        })
    }

    /// Initialize the library without activating the tooling
    pub fn init_library(&self) -> Result<()> {
        self.library_explicit.store(true, Ordering::SeqCst);
        self.init_library_inner()
    }

    fn init_library_inner(&self) -> Result<()> {
        let state = self.state.get();
        if state != LifecycleState::PreInit {
            return self.policy().escalate(RuntimeError::Invariant(format!(
                "init_library called in state {state}, expected PreInit"
            )));
        }
        if !self.init_library_once.claim() {
            return Ok(());
        }

        let _internal = ScopedThreadState::new(ThreadState::Internal);
        // backtrace allocates lazily on first use; do it outside signal context
        sampling::warm_up();
        clock::epoch();
        thread_info::current();

        if let Err(observed) = self
            .state
            .transition(LifecycleState::PreInit, LifecycleState::Init)
        {
            return self.policy().escalate(RuntimeError::Invariant(format!(
                "set_state(Init) failed. state is {observed}"
            )));
        }

        self.critical.register_root();
        tracing::debug!("Library initialized");
        Ok(())
    }

    /// Initialize and activate the tooling
    ///
    /// Returns false when the tooling is disabled by configuration or was
    /// already initialized.
    pub fn init_tooling(&self) -> Result<bool> {
        let config = self.config();
        if !config.init_tooling {
            if self.state.get() == LifecycleState::PreInit {
                self.init_library_inner()?;
            }
            return Ok(false);
        }

        let state = self.state.get();
        if state == LifecycleState::Init && self.library_explicit.load(Ordering::SeqCst) {
            self.policy().escalate(RuntimeError::UsageSequencing {
                operation: "init_tooling",
                detail: "init_library was already called explicitly".to_string(),
            })?;
            return Ok(false);
        }
        if state != LifecycleState::PreInit || !self.init_tooling_once.claim() {
            return Ok(false);
        }

        let _internal = ScopedThreadState::new(ThreadState::Internal);
        if config.verbose >= 0 {
            tracing::info!("Instrumentation mode: {}", config.mode);
            if self.banner_once.claim() {
                print_banner(&config);
            }
        }

        self.init_library_inner()?;

        let _activation = ActivationGuard { runtime: self };
        let _no_child_sampling = ScopedChildSampling::new(false);

        relock(&self.components).start(ComponentKind::Thread);

        if config.use_sampling {
            sampling::block_signals();
        }

        if config.use_critical_trace || config.use_device_sampling {
            self.pool.initialize(1)?;
        }
        self.trace_critical
            .store(config.use_critical_trace, Ordering::SeqCst);

        if config.use_metrics {
            let mut backend = relock(&self.metrics);
            if let Err(err) = backend.global_init(&config.components) {
                drop(backend);
                self.policy().escalate(err)?;
            } else {
                self.collect_metrics
                    .store(backend.is_enabled(), Ordering::SeqCst);
                self.measure_cpu.store(
                    backend.measures(MetricComponent::CpuClock),
                    Ordering::SeqCst,
                );
            }
        }

        if config.use_trace {
            let trace_config = TraceConfig::build(
                config.buffer_size_kb,
                config.fill_policy,
                config.shmem_size_hint_kb,
                &config.categories,
            );
            if config.backend.is_system() {
                tracing::info!("Trace session deferred to the system backend");
            } else {
                let session = TraceSession::configure(trace_config);
                match session.start() {
                    Ok(()) => {
                        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(session)
                    }
                    Err(err) => self.policy().escalate(err)?,
                }
            }
        }

        {
            let mut components = relock(&self.components);
            if config.use_ompt {
                components.start(ComponentKind::OpenMp);
            }
            if config.use_comm {
                components.start(ComponentKind::Communication);
            }
            if config.use_gpu {
                components.start(ComponentKind::Gpu);
            }
            if config.use_code_coverage {
                components.start(ComponentKind::Coverage);
            }
        }

        if self.global {
            crate::register_exit_hook();
        }
        Ok(true)
    }

    /// Deferred end of `init_tooling`; moves the state to Active last
    fn activate(&self) {
        if self.state.get() > LifecycleState::Active {
            return;
        }
        let config = self.config();

        if config.use_process_sampling {
            let _no_child_sampling = ScopedChildSampling::new(false);
            if let Err(err) = relock(&self.process_sampler).setup() {
                tracing::warn!("Process sampler unavailable: {err}");
            }
        }

        if config.use_sampling {
            let armed = {
                let _no_child_sampling = ScopedChildSampling::new(false);
                sampling::setup(config.sampling_freq)
            };
            match armed {
                Ok(()) => {
                    self.sampling_armed.store(true, Ordering::SeqCst);
                    thread_info::push_sampling_on_child_threads(true);
                    sampling::unblock_signals();
                }
                Err(err) => tracing::warn!("Signal sampling is inert: {err}"),
            }
        }

        if config.use_metrics {
            relock(&self.metrics).main_bundle().start();
        }

        match self
            .state
            .transition(LifecycleState::Init, LifecycleState::Active)
        {
            Ok(()) => tracing::debug!("Runtime active"),
            Err(observed) => tracing::debug!("Activation skipped in state {observed}"),
        }
    }

    fn emit(&self, event: TrackEvent) {
        if let Some(session) = self.session.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if let Err(err) = session.emit(event) {
                tracing::debug!("Dropping trace event: {err}");
            }
        }
    }

    /// Always-on coarse region
    pub fn push_trace(&self, name: &str) -> Result<()> {
        self.start_region(name, Category::Host)
    }

    pub fn pop_trace(&self, name: &str) -> Result<()> {
        self.stop_region(name, Category::Host, false)
    }

    /// User-visible region
    pub fn push_region(&self, name: &str) -> Result<()> {
        self.start_region(name, Category::User)
    }

    pub fn pop_region(&self, name: &str) -> Result<()> {
        self.stop_region(name, Category::User, false)
    }

    fn start_region(&self, name: &str, category: Category) -> Result<()> {
        if self.state.get() == LifecycleState::PreInit {
            self.init_tooling()?;
        }
        if self.state.get() != LifecycleState::Active
            || thread_info::thread_state() != ThreadState::Enabled
        {
            return Ok(());
        }
        let _internal = ScopedThreadState::new(ThreadState::Internal);

        let slot = self.threads.current();
        let mut data = relock(&slot);
        let record = data.record;
        let hash = data.names.intern(name);
        let mut bundle = Bundle::new(name, hash, category, record.index, record.os_tid);
        if self.measure_cpu.load(Ordering::Relaxed) {
            bundle.cpu_start_ns = Some(metrics::thread_cpu_ns());
        }
        let start_ns = bundle.start_ns;
        if let Err(err) = data.bundles.push(bundle) {
            drop(data);
            return self.policy().escalate(err);
        }
        self.push_count.fetch_add(1, Ordering::SeqCst);

        let chain = if self.trace_critical.load(Ordering::Relaxed) {
            let critical = &self.critical;
            Some(Arc::clone(data.cpu_chain.get_or_insert_with(|| {
                critical.thread_chain(record, Device::Cpu)
            })))
        } else {
            None
        };
        drop(data);
        if let Some(chain) = chain {
            relock(&chain).begin(hash);
        }

        self.emit(TrackEvent::SliceBegin {
            ts: start_ns,
            thread: record.index,
            os_tid: record.os_tid,
            category,
            name: name.to_string(),
        });
        Ok(())
    }

    /// Close the top-most open region named `name` on the calling thread
    ///
    /// `forced` bypasses the state checks for finalization callbacks.
    fn stop_region(&self, name: &str, category: Category, forced: bool) -> Result<()> {
        if !forced {
            if self.state.get() != LifecycleState::Active {
                return Ok(());
            }
            if matches!(
                thread_info::thread_state(),
                ThreadState::Internal | ThreadState::Disabled
            ) {
                return Ok(());
            }
            self.pop_count.fetch_add(1, Ordering::SeqCst);
        }
        let _internal = ScopedThreadState::new(ThreadState::Internal);

        let slot = self.threads.current();
        let mut data = relock(&slot);
        let record = data.record;
        let Some(mut bundle) = data.bundles.pop(name) else {
            tracing::debug!(
                "pop of '{name}' ({category}) on thread {} without a matching push",
                record.index
            );
            return Ok(());
        };
        bundle.stop();
        if self.collect_metrics.load(Ordering::Relaxed) {
            let cpu_ns = bundle
                .cpu_start_ns
                .map(|start| metrics::thread_cpu_ns().saturating_sub(start))
                .unwrap_or(0);
            data.metrics.record(bundle.hash, bundle.elapsed_ns(), cpu_ns);
        }
        let chain = data.cpu_chain.clone();
        drop(data);

        if let Some(chain) = chain {
            relock(&chain).end(bundle.hash);
        }
        self.emit(TrackEvent::SliceEnd {
            ts: bundle.stop_ns.unwrap_or(bundle.start_ns),
            thread: record.index,
            os_tid: record.os_tid,
            category: bundle.category,
            name: bundle.label,
        });
        Ok(())
    }

    /// Record a finished device operation launched from the calling thread
    ///
    /// Returns the node's sequence id when critical tracing is on.
    pub fn record_device_activity(
        &self,
        queue: u32,
        name: &str,
        start_ns: u64,
        stop_ns: u64,
        cost: u64,
    ) -> Option<u64> {
        if self.state.get() != LifecycleState::Active {
            return None;
        }
        let record = thread_info::current();
        let config = self.config();
        let seq = (config.use_critical_trace || config.use_device_sampling).then(|| {
            self.critical.claim_thread(record);
            self.critical
                .record_device_activity(record.index, queue, name, start_ns, stop_ns, cost)
        });

        for (ts, begin) in [(start_ns, true), (stop_ns.max(start_ns), false)] {
            let name = format!("{name} [gpu:{queue}]");
            self.emit(if begin {
                TrackEvent::SliceBegin {
                    ts,
                    thread: record.index,
                    os_tid: record.os_tid,
                    category: Category::Device,
                    name,
                }
            } else {
                TrackEvent::SliceEnd {
                    ts,
                    thread: record.index,
                    os_tid: record.os_tid,
                    category: Category::Device,
                    name,
                }
            });
        }
        seq
    }

    /// Link the calling thread's next top-level node to `parent`
    pub fn adopt(&self, parent: crate::critical_trace::NodeRef) {
        if !self.trace_critical.load(Ordering::Relaxed) {
            return;
        }
        let chain = self
            .critical
            .thread_chain(thread_info::current(), Device::Cpu);
        relock(&chain).adopt(parent);
    }

    /// Spawn a thread that inherits the sampling policy and the critical
    /// trace parent of the calling thread
    pub fn spawn<F, T>(self: &Arc<Self>, f: F) -> std::io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let parent = if self.trace_critical.load(Ordering::Relaxed) {
            let record = thread_info::current();
            self.critical.claim_thread(record);
            self.critical.current(record.index)
        } else {
            None
        };
        let sample = thread_info::sampling_on_child_threads();
        let runtime = Arc::clone(self);
        std::thread::Builder::new().spawn(move || {
            if !sample {
                sampling::block_current_thread();
            }
            if let Some(parent) = parent {
                runtime.adopt(parent);
            }
            f()
        })
    }

    /// Tear everything down and write the outputs
    ///
    /// Idempotent: returns an empty report unless the runtime is Active.
    pub fn finalize(&self) -> Result<FinalizeReport> {
        thread_info::set_recycle_ids(false);
        let previous = thread_info::set_thread_state(ThreadState::Completed);
        let _restore = (!self.global).then_some(RestoreThreadState(previous));

        let state = self.state.get();
        if state != LifecycleState::Active {
            tracing::debug!("State = {state}. Finalization skipped");
            return Ok(FinalizeReport::skipped());
        }
        if !self.finalize_once.claim() {
            return Ok(FinalizeReport::skipped());
        }

        let config = self.config();
        let policy = ErrorPolicy::new(config.strict);
        let finalize_ns = clock::now_ns();
        if config.verbose >= 0 {
            tracing::info!("Finalizing...");
        }

        let sampling_armed = self.sampling_armed.load(Ordering::SeqCst);
        if sampling_armed {
            sampling::block_signals();
        }

        let pushed = self.push_count.load(Ordering::SeqCst);
        let mut popped = self.pop_count.load(Ordering::SeqCst);
        if pushed > popped {
            let callbacks = std::mem::take(&mut *relock(&self.finalization_callbacks));
            for callback in callbacks {
                callback(self);
                popped += 1;
            }
        }

        if let Err(observed) = self
            .state
            .transition(LifecycleState::Active, LifecycleState::Finalized)
        {
            tracing::warn!("set_state(Finalized) raced; state is {observed}");
            self.state.advance(LifecycleState::Finalized);
        }

        thread_info::push_sampling_on_child_threads(false);
        thread_info::set_sampling_on_all_future_threads(false);

        tracing::debug!("push_trace :: called {pushed}x");
        tracing::debug!("pop_trace  :: called {popped}x");

        let mut report = FinalizeReport {
            performed: true,
            pushed,
            popped,
            ..Default::default()
        };

        // per-thread bundles
        report.leaked = self.stop_thread_bundles();

        if config.use_metrics {
            relock(&self.metrics).main_bundle().stop();
        }

        {
            let mut components = relock(&self.components);
            components.stop(ComponentKind::Communication);
            components.stop(ComponentKind::OpenMp);
            components.stop(ComponentKind::Gpu);
            components.stop(ComponentKind::Coverage);
            components.stop(ComponentKind::Thread);
            components.stop(ComponentKind::PreInit);
        }

        relock(&self.process_sampler).shutdown();
        if sampling_armed {
            sampling::shutdown();
            let samples = sampling::post_process();
            report.samples = samples.samples.len();
            for sample in &samples.samples {
                self.emit(TrackEvent::Instant {
                    ts: sample.ts,
                    thread: sample.thread.unwrap_or_default(),
                    category: Category::Sampling,
                    name: sample.function.clone(),
                });
            }
            relock(&self.metrics).record_samples(samples.counts);
        }

        let (names, stats) = self.threads.merge_into_first();

        if config.use_critical_trace || config.use_device_sampling {
            let workers = task_pool::pool_size(
                task_pool::hardware_concurrency(),
                config.thread_pool_size,
            );
            if let Err(err) = self.pool.initialize(workers) {
                tracing::error!("Task pool unavailable: {err}");
            }
            self.critical.add_hash_ids(&names);
            match self.critical.update(&self.pool, finalize_ns) {
                Ok(tasks) => tracing::debug!("Critical trace update: {tasks} chain(s)"),
                Err(err) => tracing::error!("Critical trace update failed: {err}"),
            }
            self.pool.join();
        }

        for event in relock(&self.process_sampler).post_process() {
            self.emit(event);
        }

        if config.use_critical_trace {
            self.pool.join();
            match self.critical.compute(&self.pool) {
                Ok(critical) => {
                    self.write_critical_trace(&config, &critical);
                    report.critical_trace = Some(critical);
                }
                Err(err) => tracing::error!("Critical trace compute failed: {err}"),
            }
            self.pool.join();
        }
        if config.use_critical_trace || config.use_device_sampling {
            self.critical.clear();
        }
        self.pool.shutdown();

        {
            let mut components = relock(&self.components);
            if config.use_comm {
                components.post_process(ComponentKind::Communication);
            }
            if config.use_code_coverage {
                components.post_process(ComponentKind::Coverage);
            }
        }

        let output_error = self.write_trace(&config, &mut report);

        {
            let mut backend = relock(&self.metrics);
            if let Err(err) = backend.add_metadata() {
                tracing::debug!("Memory map listing unavailable: {err}");
            }
            if config.use_metrics {
                match backend.finalize(&config.metrics_output_path(), &stats, &names, config.verbose)
                {
                    Ok(path) => report.metrics_file = path,
                    Err(err) => tracing::error!("Writing the metrics summary failed: {err}"),
                }
            }
        }

        if config.verbose >= 0 {
            tracing::info!("Finalized");
        }

        if let Some(err) = output_error {
            return Err(err);
        }
        if let Some(critical) = &report.critical_trace {
            for err in critical.chain_errors() {
                policy.escalate(err)?;
            }
        }
        policy.check(pushed > popped, || RuntimeError::UnbalancedRegions { pushed, popped })?;
        Ok(report)
    }

    /// Force-stop every still-open bundle on every thread
    fn stop_thread_bundles(&self) -> Vec<LeakedBundle> {
        let collect_metrics = self.collect_metrics.load(Ordering::Relaxed);
        let mut leaked = Vec::new();
        for slot in self.threads.all() {
            let mut data = relock(&slot);
            let mut open = std::mem::take(&mut data.orphaned);
            open.extend(data.bundles.drain_open());
            for mut bundle in open {
                bundle.stop();
                tracing::warn!(
                    "Warning! instrumentation bundle on thread {} (TID={}) with label '{}' was not stopped.",
                    bundle.thread,
                    bundle.os_tid,
                    bundle.label
                );
                if collect_metrics {
                    data.metrics.record(bundle.hash, bundle.elapsed_ns(), 0);
                }
                self.emit(TrackEvent::SliceEnd {
                    ts: bundle.stop_ns.unwrap_or(bundle.start_ns),
                    thread: bundle.thread,
                    os_tid: bundle.os_tid,
                    category: bundle.category,
                    name: bundle.label.clone(),
                });
                leaked.push(LeakedBundle {
                    thread: bundle.thread,
                    os_tid: bundle.os_tid,
                    label: bundle.label,
                    category: bundle.category,
                });
            }
        }
        leaked
    }

    fn write_critical_trace(&self, config: &RuntimeConfig, critical: &CriticalTraceReport) {
        if critical.is_empty() {
            tracing::debug!("No critical-trace nodes recorded");
            return;
        }
        if config.verbose >= 0 {
            critical.print_summary();
        }
        let path = config.critical_trace_output_path();
        match critical.write(&path) {
            Ok(()) => relock(&self.metrics).add_file_output("critical_trace", &path),
            Err(err) => tracing::error!("Writing '{}' failed: {err}", path.display()),
        }
    }

    /// Stop the session and write its bytes; returns the output error, if any
    fn write_trace(
        &self,
        config: &RuntimeConfig,
        report: &mut FinalizeReport,
    ) -> Option<RuntimeError> {
        let session = self
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        session.stop();
        let local = session.read();

        let bytes = if config.combined_traces && self.exchange.size() > 1 {
            match self.exchange.gather(local) {
                Ok(buffers) => combine_multi_process(buffers),
                Err(err) => {
                    tracing::error!("Gathering rank traces failed: {err}");
                    Vec::new()
                }
            }
        } else {
            local
        };

        let path = config.trace_output_path();
        if bytes.is_empty() {
            if self.exchange.rank() == 0 {
                tracing::info!(
                    "Trace data is empty. File '{}' will not be written",
                    path.display()
                );
            }
            return None;
        }

        if config.verbose >= 0 {
            tracing::info!(
                "Outputting '{}' ({:.2} KB / {:.2} MB)...",
                path.display(),
                bytes.len() as f64 / 1024.0,
                bytes.len() as f64 / (1024.0 * 1024.0)
            );
        }
        match trace_session::write(&path, &bytes) {
            Ok(()) => {
                relock(&self.metrics).add_file_output("msgpack", &path);
                report.trace_file = Some(path);
                report.trace_bytes = bytes.len();
                None
            }
            Err(err) => {
                tracing::error!("{err}");
                Some(err)
            }
        }
    }
}

fn print_banner(config: &RuntimeConfig) {
    let flag = |on: bool| if on { "on" } else { "off" };
    eprintln!("╔════════════════════════════════════════════════════════════════════════════════╗");
    eprintln!(
        "║  critrace {:<69}║",
        format!("v{}", env!("CARGO_PKG_VERSION"))
    );
    eprintln!("╚════════════════════════════════════════════════════════════════════════════════╝");
    eprintln!(
        "  mode: {}  trace: {}  metrics: {}  sampling: {}  critical-trace: {}",
        config.mode,
        flag(config.use_trace),
        flag(config.use_metrics),
        flag(config.use_sampling),
        flag(config.use_critical_trace)
    );
    eprintln!("  output: {}", config.output_dir.display());
}

/// Owning handle that finalizes its runtime exactly once when dropped
#[derive(Debug)]
pub struct RuntimeHandle {
    runtime: Arc<Runtime>,
    finalized: bool,
}

impl RuntimeHandle {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime: Arc::new(runtime),
            finalized: false,
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Finalize now and return the report
    pub fn finalize(mut self) -> Result<FinalizeReport> {
        self.finalized = true;
        self.runtime.finalize()
    }
}

impl Deref for RuntimeHandle {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.runtime
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        if !self.finalized {
            self.finalized = true;
            if let Err(err) = self.runtime.finalize() {
                tracing::error!("Finalize failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_session::decode_trace;
    use serial_test::serial;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> RuntimeConfig {
        RuntimeConfig {
            verbose: -1,
            use_metrics: false,
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    // each runtime test runs on a fresh thread so the sticky thread state
    // of one finalize never leaks into the next
    fn on_thread<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        std::thread::spawn(f).join().unwrap()
    }

    #[test]
    #[serial]
    fn test_push_pop_writes_trace() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(config(&dir)).unwrap();
            runtime.push_trace("main").unwrap();
            assert_eq!(runtime.state(), LifecycleState::Active);
            runtime.pop_trace("main").unwrap();

            let report = runtime.finalize().unwrap();
            assert!(report.performed);
            assert_eq!((report.pushed, report.popped), (1, 1));
            assert!(report.leaked.is_empty());
            let path = report.trace_file.unwrap();
            let packets = decode_trace(&std::fs::read(path).unwrap()).unwrap();
            assert_eq!(packets.len(), 2);
            assert_eq!(runtime.state(), LifecycleState::Finalized);
        });
    }

    #[test]
    #[serial]
    fn test_finalize_is_idempotent() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(config(&dir)).unwrap();
            assert!(!runtime.finalize().unwrap().performed);
            assert!(runtime.init_tooling().unwrap());
            assert!(runtime.finalize().unwrap().performed);
            assert!(!runtime.finalize().unwrap().performed);
        });
    }

    #[test]
    #[serial]
    fn test_init_tooling_disabled_only_initializes_library() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                init_tooling: false,
                ..config(&dir)
            })
            .unwrap();
            assert!(!runtime.init_tooling().unwrap());
            assert_eq!(runtime.state(), LifecycleState::Init);
            assert!(!runtime.init_tooling().unwrap());
            runtime.push_trace("ignored").unwrap();
            assert_eq!(runtime.push_count(), 0);
        });
    }

    #[test]
    #[serial]
    fn test_explicit_init_library_then_tooling_is_usage_error_in_strict() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                strict: true,
                ..config(&dir)
            })
            .unwrap();
            runtime.init_library().unwrap();
            assert!(matches!(
                runtime.init_tooling(),
                Err(RuntimeError::UsageSequencing { .. })
            ));
        });
    }

    #[test]
    #[serial]
    fn test_leaked_bundle_is_reported() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(config(&dir)).unwrap();
            runtime.push_region("outer").unwrap();
            runtime.push_region("inner").unwrap();
            runtime.pop_region("inner").unwrap();

            let report = runtime.finalize().unwrap();
            assert_eq!(report.leaked.len(), 1);
            assert_eq!(report.leaked[0].label, "outer");
            assert_eq!(report.leaked[0].category, Category::User);
        });
    }

    #[test]
    #[serial]
    fn test_unbalanced_regions_fatal_in_strict() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                strict: true,
                ..config(&dir)
            })
            .unwrap();
            runtime.push_trace("never-closed").unwrap();
            assert!(matches!(
                runtime.finalize(),
                Err(RuntimeError::UnbalancedRegions {
                    pushed: 1,
                    popped: 0
                })
            ));
        });
    }

    #[test]
    #[serial]
    fn test_finalization_callback_closes_argv0() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                strict: true,
                ..config(&dir)
            })
            .unwrap();
            runtime.init("trace", false, "app").unwrap();
            runtime.push_trace("app").unwrap();

            let report = runtime.finalize().unwrap();
            assert_eq!((report.pushed, report.popped), (1, 1));
            assert!(report.leaked.is_empty());
        });
    }

    #[test]
    #[serial]
    fn test_reinit_under_keep_last_keeps_one_closing_callback() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                conflict_policy: ConflictPolicy::KeepLast,
                ..config(&dir)
            })
            .unwrap();
            runtime.init("trace", false, "app").unwrap();
            runtime.init("sampling", false, "app-renamed").unwrap();
            runtime.push_trace("app").unwrap();
            runtime.push_region("unmatched").unwrap();

            let report = runtime.finalize().unwrap();
            assert_eq!((report.pushed, report.popped), (2, 1));
            assert_eq!(report.leaked.len(), 1);
            assert_eq!(report.leaked[0].label, "unmatched");
        });
    }

    #[test]
    #[serial]
    fn test_set_env_before_init_updates_config() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(config(&dir)).unwrap();
            runtime.set_env("CRITRACE_THREAD_POOL_SIZE", "3").unwrap();
            assert_eq!(runtime.config().thread_pool_size, 3);
            std::env::remove_var("CRITRACE_THREAD_POOL_SIZE");
        });
    }

    #[test]
    #[serial]
    fn test_set_env_after_init_fatal_in_strict() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                strict: true,
                ..config(&dir)
            })
            .unwrap();
            runtime.init_tooling().unwrap();
            let result = runtime.set_env("CRITRACE_LATE_SETTING", "1");
            std::env::remove_var("CRITRACE_LATE_SETTING");
            assert!(matches!(
                result,
                Err(RuntimeError::UsageSequencing {
                    operation: "set_env",
                    ..
                })
            ));
            assert_eq!(runtime.config().thread_pool_size, 8);
            runtime.finalize().unwrap();
        });
    }

    #[test]
    #[serial]
    fn test_set_mpi_enables_pid_suffix() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(config(&dir)).unwrap();
            runtime.set_mpi(true, false).unwrap();
            assert!(runtime.config().use_pid);
            assert!(runtime.config().use_mpi);
        });
    }

    #[test]
    #[serial]
    fn test_conflict_keep_last_replaces_arguments() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                conflict_policy: ConflictPolicy::KeepLast,
                use_comm: true,
                ..config(&dir)
            })
            .unwrap();
            runtime.set_mpi(true, true).unwrap();
            assert!(runtime.config().use_comm);
            runtime.set_mpi(false, false).unwrap();
            assert!(!runtime.config().use_comm);
        });
    }

    #[test]
    #[serial]
    fn test_conflict_error_policy_fails_outside_strict() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                conflict_policy: ConflictPolicy::Error,
                ..config(&dir)
            })
            .unwrap();
            runtime.init("trace", false, "app").unwrap();
            assert!(matches!(
                runtime.init("sampling", false, "app"),
                Err(RuntimeError::ConflictingArguments {
                    operation: "init",
                    invocation: 2,
                    ..
                })
            ));
        });
    }

    #[test]
    #[serial]
    fn test_system_backend_skips_session() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let runtime = Runtime::new(RuntimeConfig {
                backend: crate::config::Backend::System,
                ..config(&dir)
            })
            .unwrap();
            runtime.push_trace("main").unwrap();
            runtime.pop_trace("main").unwrap();
            let report = runtime.finalize().unwrap();
            assert!(report.trace_file.is_none());
        });
    }

    #[test]
    #[serial]
    fn test_handle_drop_finalizes() {
        on_thread(|| {
            let dir = TempDir::new().unwrap();
            let handle = RuntimeHandle::new(Runtime::new(config(&dir)).unwrap());
            handle.push_trace("main").unwrap();
            handle.pop_trace("main").unwrap();
            let runtime = Arc::clone(handle.runtime());
            drop(handle);
            assert_eq!(runtime.state(), LifecycleState::Finalized);
            assert!(dir.path().join("trace.msgpack").exists());
        });
    }
}
