//! Per-(thread, device) call chains

use super::{Device, NodeRef, Phase, TraceNode, SEQUENCE};
use crate::clock;

/// Growable array of nodes recorded on one thread/device timeline
///
/// `open` holds the indices of nodes that have begun but not ended, in the
/// order they were opened. The innermost open node is the parent of the
/// next node begun on this chain.
#[derive(Debug, Clone)]
pub struct CallChain {
    thread: usize,
    device: Device,
    nodes: Vec<TraceNode>,
    open: Vec<usize>,
    adopted: Option<NodeRef>,
}

impl CallChain {
    pub fn new(thread: usize, device: Device) -> Self {
        Self {
            thread,
            device,
            nodes: Vec::new(),
            open: Vec::new(),
            adopted: None,
        }
    }

    pub fn thread(&self) -> usize {
        self.thread
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Parent every future top-level node of this chain under `parent`
    ///
    /// Used for threads spawned from an instrumented thread: the child's
    /// first nodes hang off the node that was active at spawn time.
    pub fn adopt(&mut self, parent: NodeRef) {
        self.adopted = Some(parent);
    }

    /// Current top of the chain: innermost open node, else the adopted parent
    pub fn top(&self) -> Option<NodeRef> {
        self.open
            .last()
            .map(|idx| self.nodes[*idx].node_ref())
            .or(self.adopted)
    }

    /// Open a node for `hash`, returning its sequence id
    pub fn begin(&mut self, hash: u64) -> u64 {
        let parent = self.top().unwrap_or(NodeRef::ROOT);
        let seq = SEQUENCE.tick();
        self.nodes.push(TraceNode {
            hash,
            seq,
            parent,
            thread: self.thread,
            device: self.device,
            phase: Phase::Begin,
            start_ns: clock::now_ns(),
            stop_ns: None,
            cost: 0,
        });
        self.open.push(self.nodes.len() - 1);
        seq
    }

    /// Close the innermost open node carrying `hash`
    ///
    /// Returns the closed node's sequence id, or `None` when no open node
    /// matches.
    pub fn end(&mut self, hash: u64) -> Option<u64> {
        let position = self
            .open
            .iter()
            .rposition(|idx| self.nodes[*idx].hash == hash)?;
        let idx = self.open.remove(position);
        let node = &mut self.nodes[idx];
        node.close(clock::now_ns());
        Some(node.seq)
    }

    /// Append a complete device record under `parent`
    pub fn push_delta(
        &mut self,
        hash: u64,
        parent: NodeRef,
        start_ns: u64,
        stop_ns: u64,
        cost: u64,
    ) -> u64 {
        let seq = SEQUENCE.tick();
        self.nodes.push(TraceNode {
            hash,
            seq,
            parent,
            thread: self.thread,
            device: self.device,
            phase: Phase::Delta,
            start_ns,
            stop_ns: Some(stop_ns.max(start_ns)),
            cost,
        });
        seq
    }

    /// Close every still-open node at `timestamp`; returns how many were open
    pub fn close_open(&mut self, timestamp: u64) -> usize {
        let count = self.open.len();
        for idx in self.open.drain(..) {
            self.nodes[idx].close(timestamp);
        }
        count
    }

    pub fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [TraceNode] {
        &mut self.nodes
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
