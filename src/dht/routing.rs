use std::collections::{BinaryHeap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::blacklist::BlackList;
use super::id::{NodeId, Prefix};
use super::node::Node;
use crate::constants::ID_BITS;

/// A k-size bucket owning one prefix region of the id space.
///
/// `nodes` is kept most-recent-first; `candidates` is the replacement
/// waiting list, bounded like `nodes`. Every node in the bucket shares the
/// bucket prefix.
pub struct KBucket {
    prefix: Prefix,
    nodes: VecDeque<Node>,
    candidates: VecDeque<Node>,
    last_changed: Instant,
}

impl KBucket {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            nodes: VecDeque::new(),
            candidates: VecDeque::new(),
            last_changed: Instant::now(),
        }
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.id == *id)
    }

    /// Inserts or refreshes a node at the MRU front. Returns whether the
    /// id was new, and the node's previous address if it changed.
    fn insert(&mut self, node: Node) -> (bool, Option<SocketAddr>) {
        let mut old_addr = None;
        let is_new = match self.nodes.iter().position(|n| n.id == node.id) {
            Some(pos) => {
                let old = self.nodes.remove(pos).expect("position is valid");
                if old.addr != node.addr {
                    old_addr = Some(old.addr);
                }
                false
            }
            None => true,
        };

        self.nodes.push_front(node);
        self.last_changed = Instant::now();
        (is_new, old_addr)
    }

    /// Removes `id`. If a candidate is waiting, the back of the candidate
    /// list takes a slot ordered by `last_active` descending; the promoted
    /// node is returned alongside the removed one.
    fn replace(&mut self, id: &NodeId) -> (Option<Node>, Option<Node>) {
        let Some(pos) = self.nodes.iter().position(|n| n.id == *id) else {
            return (None, None);
        };
        let removed = self.nodes.remove(pos);
        self.last_changed = Instant::now();

        let promoted = self.candidates.pop_back();
        if let Some(ref candidate) = promoted {
            let at = self
                .nodes
                .iter()
                .position(|n| n.last_active < candidate.last_active)
                .unwrap_or(self.nodes.len());
            self.nodes.insert(at, candidate.clone());
        }

        (removed, promoted)
    }

    fn push_candidate(&mut self, node: Node, bound: usize) {
        self.candidates.push_back(node);
        while self.candidates.len() > bound {
            self.candidates.pop_front();
        }
    }

    /// Nodes not heard from within `expired_after`, due for a ping.
    fn expired_nodes(&self, expired_after: Duration) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|n| n.last_active.elapsed() > expired_after)
            .cloned()
            .collect()
    }

    pub fn random_child_id(&self) -> NodeId {
        self.prefix.random_child_id()
    }
}

enum TrieNode {
    Leaf(KBucket),
    Branch {
        zero: Box<TrieNode>,
        one: Box<TrieNode>,
    },
}

impl TrieNode {
    fn for_each_bucket(&self, f: &mut impl FnMut(&KBucket)) {
        match self {
            TrieNode::Leaf(bucket) => f(bucket),
            TrieNode::Branch { zero, one } => {
                zero.for_each_bucket(f);
                one.for_each_bucket(f);
            }
        }
    }
}

enum InsertOutcome {
    Inserted {
        is_new: bool,
        old_addr: Option<SocketAddr>,
    },
    Candidate {
        stale: Vec<Node>,
    },
    Failed,
}

/// The Kademlia routing table: a binary trie whose leaves own k-buckets,
/// plus an address-keyed cache of every stored node.
///
/// Structural operations take the single table lock; the address cache is
/// only mutated while that lock is held for writing, so the cache and the
/// trie stay coherent.
pub struct RoutingTable {
    bucket_size: usize,
    max_nodes: usize,
    node_expired_after: Duration,
    kbucket_expired_after: Duration,
    root: RwLock<TrieNode>,
    cached_nodes: DashMap<SocketAddr, Node>,
    stale_pings: Mutex<Vec<Node>>,
    blacklist: Arc<BlackList>,
}

impl RoutingTable {
    pub fn new(
        bucket_size: usize,
        max_nodes: usize,
        node_expired_after: Duration,
        kbucket_expired_after: Duration,
        blacklist: Arc<BlackList>,
    ) -> Self {
        Self {
            bucket_size,
            max_nodes,
            node_expired_after,
            kbucket_expired_after,
            root: RwLock::new(TrieNode::Leaf(KBucket::new(Prefix::root()))),
            cached_nodes: DashMap::new(),
            stale_pings: Mutex::new(Vec::new()),
            blacklist,
        }
    }

    /// Adds a node. Returns whether the node was new to the table.
    ///
    /// Rejected when the endpoint is blacklisted or the table already holds
    /// `max_nodes`. A full bucket splits when it owns the node's prefix
    /// region and still has bits to split on; otherwise the node becomes a
    /// replacement candidate and the bucket's stale nodes are queued for a
    /// liveness ping.
    pub fn insert(&self, node: Node) -> bool {
        if self.blacklist.contains(node.addr.ip(), node.addr.port())
            || self.cached_nodes.len() >= self.max_nodes
        {
            return false;
        }

        let mut root = self.root.write();
        match self.insert_at(&mut root, &node, 0) {
            InsertOutcome::Inserted { is_new, old_addr } => {
                if let Some(old) = old_addr {
                    self.cached_nodes.remove(&old);
                }
                self.cached_nodes.insert(node.addr, node);
                is_new
            }
            InsertOutcome::Candidate { stale } => {
                self.stale_pings.lock().extend(stale);
                false
            }
            InsertOutcome::Failed => false,
        }
    }

    fn insert_at(&self, trie: &mut TrieNode, node: &Node, depth: usize) -> InsertOutcome {
        match trie {
            TrieNode::Branch { zero, one } => {
                if depth >= ID_BITS {
                    return InsertOutcome::Failed;
                }
                let child = if node.id.bit(depth) == 0 { zero } else { one };
                self.insert_at(child.as_mut(), node, depth + 1)
            }
            TrieNode::Leaf(bucket) => {
                if bucket.nodes.len() < self.bucket_size || bucket.contains(&node.id) {
                    let (is_new, old_addr) = bucket.insert(node.clone());
                    InsertOutcome::Inserted { is_new, old_addr }
                } else if bucket.prefix.len() < ID_BITS && bucket.prefix.matches(&node.id) {
                    split(trie);
                    self.insert_at(trie, node, depth)
                } else {
                    let stale = bucket.expired_nodes(self.node_expired_after);
                    bucket.push_candidate(node.clone(), self.bucket_size);
                    InsertOutcome::Candidate { stale }
                }
            }
        }
    }

    /// Nodes queued for a liveness ping by candidate overflow; drained by
    /// the server's periodic tick.
    pub fn take_stale_pings(&self) -> Vec<Node> {
        std::mem::take(&mut *self.stale_pings.lock())
    }

    /// The `k` nodes closest to `id` by XOR distance.
    pub fn get_neighbors(&self, id: &NodeId, k: usize) -> Vec<Node> {
        let _guard = self.root.read();
        top_k(self.cached_nodes.iter().map(|e| e.value().clone()), id, k)
    }

    /// Compact node infos of the `k` closest nodes, concatenated.
    pub fn get_neighbor_compact_infos(&self, id: &NodeId, k: usize) -> Vec<u8> {
        let mut infos = Vec::new();
        for node in self.get_neighbors(id, k) {
            if let Ok(compact) = node.to_compact() {
                infos.extend_from_slice(&compact);
            }
        }
        infos
    }

    /// Looks up a node by id in its owning leaf.
    pub fn get_node_by_id(&self, id: &NodeId) -> Option<Node> {
        let root = self.root.read();
        let mut cur: &TrieNode = &root;
        let mut depth = 0;

        loop {
            match cur {
                TrieNode::Branch { zero, one } => {
                    if depth >= ID_BITS {
                        return None;
                    }
                    cur = if id.bit(depth) == 0 { &**zero } else { &**one };
                    depth += 1;
                }
                TrieNode::Leaf(bucket) => {
                    return bucket.nodes.iter().find(|n| n.id == *id).cloned();
                }
            }
        }
    }

    pub fn get_node_by_addr(&self, addr: &SocketAddr) -> Option<Node> {
        self.cached_nodes.get(addr).map(|e| e.value().clone())
    }

    /// Removes the node with this id, promoting a candidate if one waits.
    pub fn remove(&self, id: &NodeId) {
        let mut root = self.root.write();
        let mut cur: &mut TrieNode = &mut root;
        let mut depth = 0;

        loop {
            match cur {
                TrieNode::Branch { zero, one } => {
                    if depth >= ID_BITS {
                        return;
                    }
                    cur = if id.bit(depth) == 0 { &mut **zero } else { &mut **one };
                    depth += 1;
                }
                TrieNode::Leaf(bucket) => {
                    let (removed, promoted) = bucket.replace(id);
                    if let Some(removed) = removed {
                        self.cached_nodes.remove(&removed.addr);
                    }
                    if let Some(promoted) = promoted {
                        self.cached_nodes.insert(promoted.addr, promoted);
                    }
                    return;
                }
            }
        }
    }

    pub fn remove_by_addr(&self, addr: &SocketAddr) {
        let id = self.cached_nodes.get(addr).map(|e| e.value().id);
        if let Some(id) = id {
            self.remove(&id);
        }
    }

    /// Refresh plan: for every stale non-empty bucket, the first
    /// `refresh_node_num` nodes paired with a random id under the bucket's
    /// prefix. In crawl mode the planned nodes are also removed, churning
    /// the table so new nodes keep flowing in.
    pub fn refresh_plan(&self, refresh_node_num: usize, crawl: bool) -> Vec<(Node, NodeId)> {
        let mut plan = Vec::new();

        {
            let root = self.root.read();
            root.for_each_bucket(&mut |bucket| {
                if bucket.is_empty() || bucket.last_changed.elapsed() < self.kbucket_expired_after
                {
                    return;
                }
                for node in bucket.nodes.iter().take(refresh_node_num) {
                    plan.push((node.clone(), bucket.random_child_id()));
                }
            });
        }

        if crawl {
            for (node, _) in &plan {
                self.remove(&node.id);
            }
        }

        plan
    }

    pub fn len(&self) -> usize {
        self.cached_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cached_nodes.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        let root = self.root.read();
        let mut count = 0;
        root.for_each_bucket(&mut |_| count += 1);
        count
    }

    #[cfg(test)]
    pub(crate) fn leaf_node_count(&self) -> usize {
        let root = self.root.read();
        let mut count = 0;
        root.for_each_bucket(&mut |b| count += b.len());
        count
    }

    #[cfg(test)]
    pub(crate) fn check_prefix_invariant(&self) -> bool {
        let root = self.root.read();
        let mut ok = true;
        root.for_each_bucket(&mut |b| {
            ok &= b.nodes.iter().all(|n| b.prefix.matches(&n.id));
        });
        ok
    }
}

/// Replaces a full leaf with a branch whose children partition the nodes
/// and candidates by the next id bit.
fn split(node: &mut TrieNode) {
    let TrieNode::Leaf(bucket) = node else {
        return;
    };

    let p = bucket.prefix.len();
    let mut zero = KBucket::new(bucket.prefix.child(0));
    let mut one = KBucket::new(bucket.prefix.child(1));

    for n in bucket.nodes.drain(..) {
        if n.id.bit(p) == 0 {
            zero.nodes.push_back(n);
        } else {
            one.nodes.push_back(n);
        }
    }

    for c in bucket.candidates.drain(..) {
        if c.id.bit(p) == 0 {
            zero.candidates.push_back(c);
        } else {
            one.candidates.push_back(c);
        }
    }

    *node = TrieNode::Branch {
        zero: Box::new(TrieNode::Leaf(zero)),
        one: Box::new(TrieNode::Leaf(one)),
    };
}

struct HeapItem {
    distance: [u8; 20],
    node: Node,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.cmp(&other.distance)
    }
}

/// Top-k by XOR distance with a bounded max-heap: O(n log k).
fn top_k(nodes: impl Iterator<Item = Node>, id: &NodeId, k: usize) -> Vec<Node> {
    if k == 0 {
        return Vec::new();
    }

    let mut heap = BinaryHeap::with_capacity(k + 1);
    for node in nodes {
        heap.push(HeapItem {
            distance: id.distance(&node.id),
            node,
        });
        if heap.len() > k {
            heap.pop();
        }
    }

    heap.into_sorted_vec().into_iter().map(|i| i.node).collect()
}
