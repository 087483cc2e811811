//! Integration tests for the critical-trace engine
//!
//! Covers determinism across task pool sizes, the lower-sequence-id
//! tie-break, cross-thread edges established at spawn, and device nodes.

use critrace::critical_trace::{
    critical_path, CriticalTrace, CriticalTraceReport, Device, NodeRef, Phase, TraceNode,
};
use critrace::hash_table::HashTable;
use critrace::task_pool::TaskPool;
use critrace::{Runtime, RuntimeConfig};
use proptest::prelude::*;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn node(seq: u64, parent: u64, cost: u64) -> TraceNode {
    TraceNode {
        hash: seq,
        seq,
        parent: NodeRef {
            thread: 0,
            seq: parent,
        },
        thread: 0,
        device: Device::Cpu,
        phase: Phase::End,
        start_ns: 0,
        stop_ns: Some(cost),
        cost,
    }
}

/// Same recorded workload for every pool size: a fork into three threads
/// with fixed timestamps
fn build_workload(engine: &CriticalTrace, names: &mut HashTable) {
    let main = names.intern("main");
    let root = engine
        .chain(0, Device::Cpu)
        .lock()
        .unwrap()
        .push_delta(main, NodeRef::ROOT, 0, 100, 0);
    let root = NodeRef { thread: 0, seq: root };

    for (thread, (label, duration)) in [("load", 30u64), ("solve", 50), ("store", 50)]
        .into_iter()
        .enumerate()
    {
        let thread = thread + 1;
        let hash = names.intern(label);
        let chain = engine.chain(thread, Device::Cpu);
        let mut chain = chain.lock().unwrap();
        let first = chain.push_delta(hash, root, 10, 10 + duration, 0);
        let leaf = names.intern(&format!("{label}/inner"));
        chain.push_delta(
            leaf,
            NodeRef {
                thread,
                seq: first,
            },
            10,
            10 + duration / 2,
            0,
        );
    }
}

fn run(workers: usize) -> CriticalTraceReport {
    let engine = CriticalTrace::new();
    let mut names = HashTable::new();
    build_workload(&engine, &mut names);

    let pool = TaskPool::new();
    pool.initialize(workers).unwrap();
    engine.add_hash_ids(&names);
    engine.update(&pool, 1_000).unwrap();
    pool.join();
    let report = engine.compute(&pool).unwrap();
    pool.shutdown();
    report
}

#[test]
fn test_critical_path_independent_of_worker_count() {
    let reference = run(1);
    assert_eq!(reference.path_names, vec!["main", "solve", "solve/inner"]);
    assert_eq!(reference.total_cost, 100 + 50 + 25);

    for workers in [2, 4, 8] {
        let report = run(workers);
        assert_eq!(report.path_names, reference.path_names);
        assert_eq!(report.total_cost, reference.total_cost);
        assert_eq!(report.nodes.len(), reference.nodes.len());
    }
}

#[test]
fn test_tie_prefers_lower_sequence_id() {
    let result = critical_path(&[node(1, 0, 5), node(2, 0, 5)]);
    assert_eq!(result.path, vec![1]);

    let result = critical_path(&[node(4, 0, 1), node(7, 4, 3), node(5, 4, 3)]);
    assert_eq!(result.path, vec![4, 5]);
}

#[test]
fn test_cycle_is_reported_not_fatal() {
    let mut a = node(10, 11, 4);
    let b = node(11, 10, 4);
    a.thread = 3;
    let result = critical_path(&[node(1, 0, 2), a, b]);
    assert_eq!(result.path, vec![1]);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().any(|e| e.thread == 3 && e.seq == 10));
}

#[test]
fn test_empty_forest_has_no_path() {
    let result = critical_path(&[]);
    assert!(result.path.is_empty());
    assert_eq!(result.total_cost, 0);
}

/// Every root-to-leaf path of a parent-ordered forest
fn all_paths(nodes: &[TraceNode]) -> Vec<(u64, Vec<u64>)> {
    let mut paths = Vec::new();
    let mut stack = vec![(0u64, 0u64, Vec::new())];
    while let Some((seq, cost, path)) = stack.pop() {
        let children: Vec<&TraceNode> = nodes.iter().filter(|n| n.parent.seq == seq).collect();
        if children.is_empty() {
            if !path.is_empty() {
                paths.push((cost, path));
            }
            continue;
        }
        for child in children {
            let mut next = path.clone();
            next.push(child.seq);
            stack.push((child.seq, cost + child.cost, next));
        }
    }
    paths
}

fn forest() -> impl Strategy<Value = Vec<TraceNode>> {
    prop::collection::vec((any::<prop::sample::Index>(), 0u64..4), 1..12).prop_map(|spec| {
        spec.into_iter()
            .enumerate()
            .map(|(i, (parent, cost))| {
                let seq = i as u64 + 1;
                // parents are strictly earlier ids, 0 being the root
                node(seq, parent.index(seq as usize) as u64, cost)
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_path_is_max_cost_with_lowest_ids(nodes in forest()) {
        let result = critical_path(&nodes);
        let paths = all_paths(&nodes);
        let best = paths.iter().map(|(cost, _)| *cost).max().unwrap();
        let expected = paths
            .iter()
            .filter(|(cost, _)| *cost == best)
            .map(|(_, path)| path.clone())
            .min()
            .unwrap();

        prop_assert_eq!(result.total_cost, best);
        prop_assert_eq!(result.path, expected);
        prop_assert!(result.errors.is_empty());
    }
}

#[test]
#[serial]
fn test_spawned_thread_hangs_off_spawning_region() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(
        Runtime::new(RuntimeConfig {
            verbose: -1,
            use_trace: false,
            use_metrics: false,
            use_critical_trace: true,
            thread_pool_size: 2,
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap(),
    );

    runtime.push_trace("main").unwrap();
    let rt = Arc::clone(&runtime);
    runtime
        .spawn(move || {
            rt.push_region("child").unwrap();
            std::thread::sleep(Duration::from_millis(5));
            rt.pop_region("child").unwrap();
        })
        .unwrap()
        .join()
        .unwrap();
    runtime.pop_trace("main").unwrap();

    let report = runtime.finalize().unwrap();
    let critical = report.critical_trace.unwrap();
    let main = critical.named("main").next().unwrap();
    let child = critical.named("child").next().unwrap();
    assert_eq!(child.node.parent, main.node.node_ref());
    assert_ne!(child.node.thread, main.node.thread);
    assert_eq!(critical.path_names, vec!["main", "child"]);
    assert!(dir.path().join("critical-trace.json").exists());
}

#[test]
#[serial]
fn test_device_activity_joins_the_path() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(RuntimeConfig {
        verbose: -1,
        use_trace: false,
        use_metrics: false,
        use_critical_trace: true,
        output_dir: dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();

    runtime.push_trace("launch").unwrap();
    let kernel = runtime
        .record_device_activity(1, "gemm", 0, 1, 10_000_000_000)
        .unwrap();
    runtime.pop_trace("launch").unwrap();

    let report = runtime.finalize().unwrap();
    let critical = report.critical_trace.unwrap();
    assert_eq!(critical.path.last(), Some(&kernel));
    assert_eq!(critical.path_names, vec!["launch", "gemm"]);
    let gemm = critical.named("gemm").next().unwrap();
    assert_eq!(gemm.node.device, Device::Gpu(1));
    assert_eq!(gemm.node.cost, 10_000_000_000);
}

#[test]
#[serial]
fn test_open_node_closed_at_finalize() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(RuntimeConfig {
        verbose: -1,
        use_trace: false,
        use_metrics: false,
        use_critical_trace: true,
        output_dir: dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();

    runtime.push_region("never-popped").unwrap();
    let report = runtime.finalize().unwrap();
    let critical = report.critical_trace.unwrap();
    let node = critical.named("never-popped").next().unwrap();
    assert!(node.node.stop_ns.is_some());
    assert!(node.node.start_ns <= node.node.stop_ns.unwrap());
    assert_eq!(report.leaked.len(), 1);
    // nodes are discarded once the report exists
    assert_eq!(runtime.critical_trace().node_count(), 0);
}

proptest! {
    #[test]
    fn prop_merged_names_are_the_union(
        threads in prop::collection::vec(
            prop::collection::btree_set("[a-z]{1,6}", 0..8),
            1..6,
        )
    ) {
        let tables: Vec<HashTable> = threads
            .iter()
            .map(|names| {
                let mut table = HashTable::new();
                for name in names {
                    table.intern(name);
                }
                table
            })
            .collect();

        let mut merged = HashTable::new();
        for table in &tables {
            merged.import(table);
        }

        let union: std::collections::BTreeSet<&String> = threads.iter().flatten().collect();
        prop_assert_eq!(merged.len(), union.len());
        for name in union {
            let hash = critrace::hash_table::hash_name(name);
            prop_assert_eq!(merged.get(hash), Some(name.as_str()));
        }
    }
}
