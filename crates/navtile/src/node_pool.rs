//! Node pool and open list used by the graph searches
//!
//! Nodes are addressed by [`NodeIndex`]. Parent links and hash chains are
//! indices into the pool with [`NULL_NODE`] as the terminator, so the pool can
//! be cleared in O(hash size) between searches without dropping storage.

use bitflags::bitflags;

use crate::handle::PolyRef;

bitflags! {
    /// Search state of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const OPEN = 0x01;
        const CLOSED = 0x02;
        /// Parent is not adjacent; reached through a raycast shortcut
        const PARENT_DETACHED = 0x04;
    }
}

/// Index of a node inside a [`NodePool`]
pub type NodeIndex = u16;

/// Terminator for parent links and hash chains
pub const NULL_NODE: NodeIndex = NodeIndex::MAX;

/// A search node
#[derive(Debug, Clone)]
pub struct Node {
    /// Position where the search entered the polygon
    pub pos: [f32; 3],
    /// Cost from the start to this node
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    /// Parent node, or [`NULL_NODE`]
    pub pidx: NodeIndex,
    /// Extra state, lets one polygon own several nodes
    pub state: u8,
    pub flags: NodeFlags,
    /// Polygon this node stands for
    pub id: PolyRef,
}

impl Node {
    fn new(id: PolyRef, state: u8) -> Self {
        Self {
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            pidx: NULL_NODE,
            state,
            flags: NodeFlags::empty(),
            id,
        }
    }
}

/// Fixed capacity node storage with a hash on (poly ref, state)
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    first: Vec<NodeIndex>,
    next: Vec<NodeIndex>,
    max_nodes: usize,
    hash_mask: usize,
}

impl NodePool {
    /// Creates a pool. `hash_size` is rounded up to a power of two.
    pub fn new(max_nodes: usize, hash_size: usize) -> Self {
        let max_nodes = max_nodes.min(NULL_NODE as usize);
        let hash_size = hash_size.max(1).next_power_of_two();
        Self {
            nodes: Vec::with_capacity(max_nodes),
            first: vec![NULL_NODE; hash_size],
            next: vec![NULL_NODE; max_nodes],
            max_nodes,
            hash_mask: hash_size - 1,
        }
    }

    /// Forgets every node
    pub fn clear(&mut self) {
        self.first.fill(NULL_NODE);
        self.nodes.clear();
    }

    #[inline]
    fn bucket(&self, id: PolyRef) -> usize {
        let a = id.raw();
        ((a ^ (a >> 16)) as usize) & self.hash_mask
    }

    /// Returns the node for (id, state), allocating it if needed.
    /// Returns `None` when the pool is exhausted.
    pub fn get_node(&mut self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        if let Some(idx) = self.find_node(id, state) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }

        let idx = self.nodes.len() as NodeIndex;
        self.nodes.push(Node::new(id, state));

        let bucket = self.bucket(id);
        self.next[idx as usize] = self.first[bucket];
        self.first[bucket] = idx;

        Some(idx)
    }

    /// Looks up an existing node
    pub fn find_node(&self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        let mut i = self.first[self.bucket(id)];
        while i != NULL_NODE {
            let node = &self.nodes[i as usize];
            if node.id == id && node.state == state {
                return Some(i);
            }
            i = self.next[i as usize];
        }
        None
    }

    /// All nodes allocated for `id`, in any state, up to `max`
    pub fn find_nodes(&self, id: PolyRef, max: usize) -> Vec<NodeIndex> {
        let mut found = Vec::new();
        let mut i = self.first[self.bucket(id)];
        while i != NULL_NODE && found.len() < max {
            if self.nodes[i as usize].id == id {
                found.push(i);
            }
            i = self.next[i as usize];
        }
        found
    }

    #[inline]
    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx as usize]
    }

    #[inline]
    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx as usize]
    }

    /// Parent of the node, if any
    #[inline]
    pub fn parent(&self, idx: NodeIndex) -> Option<NodeIndex> {
        match self.nodes[idx as usize].pidx {
            NULL_NODE => None,
            p => Some(p),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }
}

/// Binary min-heap of node indices keyed on node total cost
#[derive(Debug)]
pub struct NodeQueue {
    heap: Vec<(NodeIndex, f32)>,
    capacity: usize,
}

impl NodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Lowest total without removing it
    pub fn top(&self) -> Option<NodeIndex> {
        self.heap.first().map(|&(idx, _)| idx)
    }

    /// Adds a node. Ignored when the queue is full.
    pub fn push(&mut self, idx: NodeIndex, total: f32) {
        if self.heap.len() >= self.capacity {
            return;
        }
        self.heap.push((idx, total));
        let last = self.heap.len() - 1;
        self.bubble_up(last, (idx, total));
    }

    /// Removes and returns the node with the lowest total
    pub fn pop(&mut self) -> Option<NodeIndex> {
        let top = self.heap.first().copied()?;
        let last = self.heap.pop()?;
        if !self.heap.is_empty() {
            self.trickle_down(0, last);
        }
        Some(top.0)
    }

    /// Re-sorts a node whose total decreased
    pub fn modify(&mut self, idx: NodeIndex, total: f32) {
        if let Some(i) = self.heap.iter().position(|&(n, _)| n == idx) {
            self.bubble_up(i, (idx, total));
        }
    }

    fn bubble_up(&mut self, mut i: usize, item: (NodeIndex, f32)) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if item.1 >= self.heap[parent].1 {
                break;
            }
            self.heap[i] = self.heap[parent];
            i = parent;
        }
        self.heap[i] = item;
    }

    fn trickle_down(&mut self, mut i: usize, item: (NodeIndex, f32)) {
        let size = self.heap.len();
        loop {
            let mut child = 2 * i + 1;
            if child >= size {
                break;
            }
            if child + 1 < size && self.heap[child + 1].1 < self.heap[child].1 {
                child += 1;
            }
            if item.1 <= self.heap[child].1 {
                break;
            }
            self.heap[i] = self.heap[child];
            i = child;
        }
        self.heap[i] = item;
    }
}
