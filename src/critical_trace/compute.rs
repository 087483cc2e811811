//! Longest accumulated-cost path through the merged node forest
//!
//! Every node hangs off exactly one parent, so after merging the chains of
//! all threads and devices the nodes form a tree under the root pseudo-node
//! (sequence id 0). The critical path is the root-to-leaf path of maximum
//! total cost:
//!
//! ```text
//! best(v) = cost(v) + max(best(c) for c in children(v))
//! ```
//!
//! computed bottom-up over an explicit post-order, then followed top-down
//! from the root. Among children with equal `best`, the one with the lower
//! sequence id wins, so the result depends only on the recorded nodes.
//!
//! Parent ids are always allocated before their children, so a cycle cannot
//! be built through the recording API. Nodes that nevertheless sit on (or
//! below) a cycle are excluded from the computation and reported.

use super::{NodeRef, TraceNode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A node excluded from the computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainError {
    pub thread: usize,
    pub seq: u64,
    pub message: String,
}

/// Result of the compute pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Sequence ids from the root's child down to the leaf
    pub path: Vec<u64>,
    pub total_cost: u64,
    pub errors: Vec<ChainError>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Acyclic,
    Cyclic,
}

/// Find the sequence ids whose parent walk runs into a cycle
fn cyclic_nodes(parents: &HashMap<u64, u64>) -> HashSet<u64> {
    let mut marks: HashMap<u64, Mark> = HashMap::with_capacity(parents.len());
    let mut seqs: Vec<u64> = parents.keys().copied().collect();
    seqs.sort_unstable();

    for start in seqs {
        if marks.contains_key(&start) {
            continue;
        }
        let mut walk = Vec::new();
        let mut current = start;
        let outcome = loop {
            match marks.get(&current) {
                Some(Mark::Visiting) => break Mark::Cyclic,
                Some(mark) => break *mark,
                None => {}
            }
            let Some(parent) = parents.get(&current) else {
                // reached the root or a parent outside the node set
                break Mark::Acyclic;
            };
            marks.insert(current, Mark::Visiting);
            walk.push(current);
            current = *parent;
        };
        for seq in walk {
            marks.insert(seq, outcome);
        }
    }

    marks
        .into_iter()
        .filter(|(_, mark)| *mark == Mark::Cyclic)
        .map(|(seq, _)| seq)
        .collect()
}

/// Compute the critical path of `nodes`
///
/// Parents that do not name a node in the set (other than the root) are
/// treated as the root.
///
/// # Example
///
/// ```
/// use critrace::critical_trace::{Device, NodeRef, Phase, TraceNode};
/// use critrace::critical_trace::compute::critical_path;
///
/// let node = |seq, parent, cost| TraceNode {
///     hash: seq,
///     seq,
///     parent: NodeRef { thread: 0, seq: parent },
///     thread: 0,
///     device: Device::Cpu,
///     phase: Phase::End,
///     start_ns: 0,
///     stop_ns: Some(cost),
///     cost,
/// };
///
/// let result = critical_path(&[node(1, 0, 10), node(2, 1, 5), node(3, 1, 7)]);
/// assert_eq!(result.path, vec![1, 3]);
/// assert_eq!(result.total_cost, 17);
/// ```
pub fn critical_path(nodes: &[TraceNode]) -> CriticalPath {
    let by_seq: HashMap<u64, &TraceNode> = nodes
        .iter()
        .filter(|n| n.seq != NodeRef::ROOT.seq)
        .map(|n| (n.seq, n))
        .collect();
    if by_seq.is_empty() {
        return CriticalPath::default();
    }

    let effective_parent = |node: &TraceNode| -> u64 {
        if by_seq.contains_key(&node.parent.seq) {
            node.parent.seq
        } else {
            NodeRef::ROOT.seq
        }
    };

    // parent links between real nodes only; root-attached nodes have none
    let parents: HashMap<u64, u64> = by_seq
        .values()
        .filter_map(|n| {
            let parent = effective_parent(n);
            (parent != NodeRef::ROOT.seq).then_some((n.seq, parent))
        })
        .collect();

    let cyclic = cyclic_nodes(&parents);
    let mut errors: Vec<ChainError> = cyclic
        .iter()
        .map(|seq| {
            let node = by_seq[seq];
            ChainError {
                thread: node.thread,
                seq: *seq,
                message: format!(
                    "node {} (parent {}) is part of or below a parent cycle",
                    seq, node.parent.seq
                ),
            }
        })
        .collect();
    errors.sort_by_key(|e| e.seq);

    let mut children: HashMap<u64, Vec<u64>> = HashMap::new();
    for node in by_seq.values() {
        if cyclic.contains(&node.seq) {
            continue;
        }
        children
            .entry(effective_parent(node))
            .or_default()
            .push(node.seq);
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    // post-order from the root without recursion
    let mut order = Vec::with_capacity(by_seq.len());
    let mut stack = vec![(NodeRef::ROOT.seq, false)];
    while let Some((seq, expanded)) = stack.pop() {
        if expanded {
            order.push(seq);
            continue;
        }
        stack.push((seq, true));
        if let Some(kids) = children.get(&seq) {
            stack.extend(kids.iter().map(|c| (*c, false)));
        }
    }

    let mut best: HashMap<u64, u64> = HashMap::with_capacity(order.len());
    let mut next: HashMap<u64, u64> = HashMap::with_capacity(order.len());
    for seq in order {
        let own = by_seq.get(&seq).map(|n| n.cost).unwrap_or(0);
        let mut chosen: Option<(u64, u64)> = None;
        for child in children.get(&seq).into_iter().flatten() {
            let value = best[child];
            // children are ascending, so strict > keeps the lower id on ties
            match chosen {
                Some((_, current)) if value <= current => {}
                _ => chosen = Some((*child, value)),
            }
        }
        let tail = chosen.map(|(_, v)| v).unwrap_or(0);
        best.insert(seq, own.saturating_add(tail));
        if let Some((child, _)) = chosen {
            next.insert(seq, child);
        }
    }

    let mut path = Vec::new();
    let mut current = NodeRef::ROOT.seq;
    while let Some(child) = next.get(&current) {
        path.push(*child);
        current = *child;
    }

    CriticalPath {
        path,
        total_cost: best.get(&NodeRef::ROOT.seq).copied().unwrap_or(0),
        errors,
    }
}
