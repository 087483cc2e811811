//! Cross-thread, cross-device critical-trace engine
//!
//! While the program runs, every traced region opens a [`TraceNode`] on the
//! [`CallChain`] of its (thread, device) pair. A node's parent is the chain's
//! innermost open node, the parent adopted from the spawning thread, or the
//! root pseudo-node. Parents are plain [`NodeRef`] values and are never
//! dereferenced while recording.
//!
//! At finalize the engine runs in three phases on the task pool, joined
//! between phases:
//!
//! 1. [`CriticalTrace::add_hash_ids`]: import the merged hash → name table
//! 2. [`CriticalTrace::update`]: one task per chain validates parents
//!    against the global id index, closes still-open nodes and computes costs
//! 3. [`CriticalTrace::compute`]: a single task finds the path of maximum
//!    accumulated cost (see [`compute`])

pub mod chain;
pub mod compute;

pub use chain::CallChain;
pub use compute::{critical_path, ChainError, CriticalPath};

use crate::clock::{self, SequenceCounter};
use crate::error::{Result, RuntimeError};
use crate::hash_table::HashTable;
use crate::state::OnceFlag;
use crate::task_pool::TaskPool;
use crate::thread_info::ThreadRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Process-wide node ids; 0 is reserved for the root pseudo-node
pub(crate) static SEQUENCE: SequenceCounter = SequenceCounter::with_value(1);

/// Label of the root pseudo-node
pub const ROOT_NAME: &str = "<root>";

/// Where a node executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    /// Accelerator queue
    Gpu(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(queue) => write!(f, "gpu:{queue}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    None,
    Begin,
    End,
    /// Complete record delivered with both timestamps
    Delta,
}

/// Reference to a node by owning thread and sequence id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub thread: usize,
    pub seq: u64,
}

impl NodeRef {
    pub const ROOT: NodeRef = NodeRef { thread: 0, seq: 0 };

    pub fn is_root(&self) -> bool {
        self.seq == Self::ROOT.seq
    }
}

/// One traced call on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
    pub hash: u64,
    pub seq: u64,
    pub parent: NodeRef,
    pub thread: usize,
    pub device: Device,
    pub phase: Phase,
    pub start_ns: u64,
    pub stop_ns: Option<u64>,
    pub cost: u64,
}

impl TraceNode {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            thread: self.thread,
            seq: self.seq,
        }
    }

    pub(crate) fn close(&mut self, timestamp: u64) {
        if self.stop_ns.is_none() {
            self.stop_ns = Some(timestamp.max(self.start_ns));
            self.phase = Phase::End;
        }
    }

    pub fn duration_ns(&self) -> u64 {
        self.stop_ns
            .map(|stop| stop.saturating_sub(self.start_ns))
            .unwrap_or(0)
    }
}

/// Shared handle to one chain
pub type ChainHandle = Arc<Mutex<CallChain>>;

fn lock(chain: &ChainHandle) -> std::sync::MutexGuard<'_, CallChain> {
    chain.lock().unwrap_or_else(|e| e.into_inner())
}

/// Node line of the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportNode {
    pub name: String,
    #[serde(flatten)]
    pub node: TraceNode,
    pub on_path: bool,
}

/// Output of the compute phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalTraceReport {
    pub nodes: Vec<ReportNode>,
    /// Sequence ids from the root's child down to the leaf
    pub path: Vec<u64>,
    pub path_names: Vec<String>,
    pub total_cost: u64,
    pub errors: Vec<ChainError>,
}

impl CriticalTraceReport {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes recorded under `name`
    pub fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ReportNode> + 'a {
        self.nodes.iter().filter(move |n| n.name == name)
    }

    /// Cycle reports as runtime errors
    pub fn chain_errors(&self) -> Vec<RuntimeError> {
        self.errors
            .iter()
            .map(|e| RuntimeError::CyclicChain {
                thread: e.thread,
                seq: e.seq,
            })
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Print the path to stderr
    pub fn print_summary(&self) {
        eprintln!("\n╔════════════════════════════════════════════════════════════════════════════════╗");
        eprintln!("║  Critical Path                                                                 ║");
        eprintln!("╚════════════════════════════════════════════════════════════════════════════════╝");
        if self.path.is_empty() {
            eprintln!("\nNo critical-trace nodes recorded.");
            return;
        }
        let on_path: BTreeMap<u64, &ReportNode> = self
            .nodes
            .iter()
            .filter(|n| n.on_path)
            .map(|n| (n.node.seq, n))
            .collect();
        eprintln!(
            "{:<6} {:<36} {:>8} {:>10} {:>14}",
            "Depth", "Name", "Thread", "Device", "Cost"
        );
        eprintln!("{}", "─".repeat(78));
        for (depth, seq) in self.path.iter().enumerate() {
            if let Some(node) = on_path.get(seq) {
                eprintln!(
                    "{:<6} {:<36} {:>8} {:>10} {:>12.6}ms",
                    depth,
                    node.name,
                    node.node.thread,
                    node.node.device.to_string(),
                    node.node.cost as f64 / 1e6
                );
            }
        }
        eprintln!("{}", "─".repeat(78));
        eprintln!("Total: {:.6}ms", self.total_cost as f64 / 1e6);
    }
}

/// Registry of every chain plus the finalize-time phases
#[derive(Debug, Default)]
pub struct CriticalTrace {
    chains: RwLock<BTreeMap<(usize, Device), ChainHandle>>,
    /// OS thread currently owning each ordinal
    owners: Mutex<HashMap<usize, i64>>,
    /// Chains of exited threads whose ordinal was handed to a new thread
    retired: Mutex<Vec<ChainHandle>>,
    names: Mutex<HashTable>,
    root: OnceFlag,
    root_start_ns: AtomicU64,
}

impl CriticalTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the root pseudo-node; later calls are no-ops
    pub fn register_root(&self) {
        if self.root.claim() {
            self.root_start_ns.store(clock::now_ns(), Ordering::SeqCst);
            self.names
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .intern(ROOT_NAME);
        }
    }

    pub fn root_start_ns(&self) -> Option<u64> {
        self.root
            .is_claimed()
            .then(|| self.root_start_ns.load(Ordering::SeqCst))
    }

    /// Chain of (thread, device), created on first use
    pub fn chain(&self, thread: usize, device: Device) -> ChainHandle {
        if let Some(chain) = self
            .chains
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(thread, device))
        {
            return Arc::clone(chain);
        }
        let mut chains = self.chains.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            chains
                .entry((thread, device))
                .or_insert_with(|| Arc::new(Mutex::new(CallChain::new(thread, device)))),
        )
    }

    /// Chain of (`record.index`, device) owned by `record`'s OS thread
    ///
    /// See [`CriticalTrace::claim_thread`].
    pub fn thread_chain(&self, record: ThreadRecord, device: Device) -> ChainHandle {
        self.claim_thread(record);
        self.chain(record.index, device)
    }

    /// Bind `record.index` to `record.os_tid`
    ///
    /// When a recycled ordinal shows up with a new OS thread, every chain of
    /// the previous owner is retired: its open nodes are closed now and it no
    /// longer takes new nodes or lends its top as a parent, but its nodes
    /// still go through the finalize phases.
    pub fn claim_thread(&self, record: ThreadRecord) {
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        match owners.insert(record.index, record.os_tid) {
            Some(previous) if previous != record.os_tid => {
                self.retire(record.index, previous);
            }
            _ => {}
        }
    }

    fn retire(&self, thread: usize, os_tid: i64) {
        let mut chains = self.chains.write().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<(usize, Device)> = chains
            .range((thread, Device::Cpu)..)
            .take_while(|(key, _)| key.0 == thread)
            .map(|(key, _)| *key)
            .collect();
        let now = clock::now_ns();
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if let Some(chain) = chains.remove(&key) {
                let closed = lock(&chain).close_open(now);
                tracing::debug!(
                    "Retired critical-trace chain of thread {thread} (TID={os_tid}, {}) with {closed} open node(s)",
                    key.1
                );
                retired.push(chain);
            }
        }
    }

    fn handles(&self) -> Vec<ChainHandle> {
        let mut handles: Vec<ChainHandle> = self
            .chains
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        handles.extend(
            self.retired
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned(),
        );
        handles
    }

    /// Current top of `thread`'s CPU chain
    pub fn current(&self, thread: usize) -> Option<NodeRef> {
        let chain = self
            .chains
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(thread, Device::Cpu))
            .cloned()?;
        let top = lock(&chain).top();
        top
    }

    /// Record a finished device operation launched from `launcher`
    ///
    /// The node's parent is the launcher's current CPU node.
    pub fn record_device_activity(
        &self,
        launcher: usize,
        queue: u32,
        name: &str,
        start_ns: u64,
        stop_ns: u64,
        cost: u64,
    ) -> u64 {
        let parent = self.current(launcher).unwrap_or(NodeRef::ROOT);
        let hash = self
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .intern(name);
        let chain = self.chain(launcher, Device::Gpu(queue));
        let seq = lock(&chain).push_delta(hash, parent, start_ns, stop_ns, cost);
        seq
    }

    /// Phase 1: import the merged hash table
    pub fn add_hash_ids(&self, table: &HashTable) {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .import(table);
    }

    pub fn name_of(&self, hash: u64) -> Option<String> {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .map(str::to_string)
    }

    pub fn node_count(&self) -> usize {
        self.handles().iter().map(|c| lock(c).len()).sum()
    }

    /// Phase 2: one update task per non-empty chain
    ///
    /// Returns the number of tasks submitted. Call `pool.join()` before the
    /// compute phase.
    pub fn update(&self, pool: &TaskPool, finalize_ns: u64) -> Result<usize> {
        let handles = self.handles();
        let known: HashSet<u64> = handles
            .iter()
            .flat_map(|c| lock(c).nodes().iter().map(|n| n.seq).collect::<Vec<_>>())
            .collect();
        let known = Arc::new(known);

        let mut submitted = 0;
        for chain in handles {
            if lock(&chain).is_empty() {
                continue;
            }
            let known = Arc::clone(&known);
            pool.submit(move || update_chain(&chain, &known, finalize_ns))?;
            submitted += 1;
        }
        tracing::debug!("Submitted {submitted} critical-trace update task(s)");
        Ok(submitted)
    }

    /// Phase 3: compute the critical path as a single pool task
    ///
    /// Joins the pool before returning.
    pub fn compute(&self, pool: &TaskPool) -> Result<CriticalTraceReport> {
        let handles = self.handles();
        let slot: Arc<Mutex<Option<(Vec<TraceNode>, CriticalPath)>>> = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);

        pool.submit(move || {
            let mut nodes: Vec<TraceNode> = handles
                .iter()
                .flat_map(|c| lock(c).nodes().to_vec())
                .collect();
            nodes.sort_by_key(|n| n.seq);
            let result = critical_path(&nodes);
            *out.lock().unwrap_or_else(|e| e.into_inner()) = Some((nodes, result));
        })?;
        pool.join();

        let (nodes, result) = slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| RuntimeError::Invariant("critical-trace compute task did not run".into()))?;

        Ok(self.report(nodes, result))
    }

    fn report(&self, nodes: Vec<TraceNode>, result: CriticalPath) -> CriticalTraceReport {
        let names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        let on_path: HashSet<u64> = result.path.iter().copied().collect();
        let name = |hash: u64| {
            names
                .get(hash)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{hash:#x}"))
        };

        let nodes: Vec<ReportNode> = nodes
            .into_iter()
            .map(|node| ReportNode {
                name: name(node.hash),
                on_path: on_path.contains(&node.seq),
                node,
            })
            .collect();
        let path_names = result
            .path
            .iter()
            .filter_map(|seq| nodes.iter().find(|n| n.node.seq == *seq))
            .map(|n| n.name.clone())
            .collect();

        CriticalTraceReport {
            nodes,
            path: result.path,
            path_names,
            total_cost: result.total_cost,
            errors: result.errors,
        }
    }

    /// Discard every recorded chain once the report has been computed
    pub fn clear(&self) {
        self.chains
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.retired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

fn update_chain(chain: &ChainHandle, known: &HashSet<u64>, finalize_ns: u64) {
    let mut chain = lock(chain);
    let (thread, device) = (chain.thread(), chain.device());

    let still_open = chain.close_open(finalize_ns);
    if still_open > 0 {
        tracing::debug!(
            "Closed {still_open} open critical-trace node(s) on thread {thread} ({device}) at finalize"
        );
    }

    for node in chain.nodes_mut() {
        if !node.parent.is_root() && !known.contains(&node.parent.seq) {
            tracing::warn!(
                "Critical-trace node {} on thread {} references unknown parent {} (thread {}); re-rooting",
                node.seq,
                thread,
                node.parent.seq,
                node.parent.thread
            );
            node.parent = NodeRef::ROOT;
        }
        node.cost = match (node.device, node.phase) {
            (Device::Gpu(_), Phase::Delta) => node.cost,
            _ => node.duration_ns(),
        };
    }
}
