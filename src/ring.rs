//! Consistent-hash ring for shard placement.
//!
//! ## Architecture
//!
//! ```text
//!            0 ───────────────────────────────────────────── u64::MAX
//!            │  a:17   b:3   a:90   c:41   b:77   c:2   a:5   │
//!            │   ▲                    ▲                       │
//!  hash(key) ┘   └── first vnode ≥ hash owns the key          │
//!                     (wraps to the first vnode past the end) ┘
//! ```
//!
//! Each physical node contributes `base_virtual_nodes × weight` positions,
//! each placed at `hash("{node}:{i}")`. Adding or removing a node only moves
//! the arcs that node's virtual nodes own; every other key keeps its owner.
//!
//! Positions are the first 64 bits of a BLAKE3 digest, so placement is
//! identical across processes and insertion orders.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Physical node identifier.
pub type NodeId = Arc<str>;

/// Virtual nodes per unit weight when none is configured.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Largest accepted node weight; heavier requests are clamped.
pub const MAX_NODE_WEIGHT: u32 = 100;

/// Evenly spaced hash points sampled by [`HashRing::get_rebalance_info`].
pub const REBALANCE_SAMPLES: usize = 1000;

/// Size of the position space (2^64).
const RING_SPACE: u128 = 1 << 64;

/// Position of `data` on the ring.
pub fn ring_hash(data: &[u8]) -> u64 {
    let digest = blake3::hash(data);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(buf)
}

/// A ring position owned by a physical node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualNode {
    pub position: u64,
    pub node: NodeId,
}

/// Half-open span `[start, end)` of the hash space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub start: u64,
    pub end: u64,
}

/// One sampled range whose owner differs between two rings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebalanceMove {
    /// Owner in the old ring, `None` if the old ring was empty.
    pub from_node: Option<NodeId>,
    /// Owner in the new ring, `None` if the new ring is empty.
    pub to_node: Option<NodeId>,
    pub key_range: KeyRange,
}

/// Immutable view of the ring: sorted virtual nodes plus node weights.
#[derive(Clone, Debug, Default)]
pub struct RingSnapshot {
    vnodes: Vec<VirtualNode>,
    weights: BTreeMap<NodeId, u32>,
}

impl RingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.weights.len()
    }

    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.weights.contains_key(node)
    }

    /// Physical nodes in sorted order with their weights.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, u32)> {
        self.weights.iter().map(|(n, w)| (n, *w))
    }

    pub fn vnodes(&self) -> &[VirtualNode] {
        &self.vnodes
    }

    /// Index of the first virtual node at or after `hash`, wrapping to 0.
    fn index_for(&self, hash: u64) -> usize {
        let idx = self.vnodes.partition_point(|v| v.position < hash);
        if idx == self.vnodes.len() {
            0
        } else {
            idx
        }
    }

    /// Owner of an arbitrary ring position.
    pub fn owner_of(&self, position: u64) -> Option<&NodeId> {
        if self.vnodes.is_empty() {
            return None;
        }
        Some(&self.vnodes[self.index_for(position)].node)
    }

    pub fn get(&self, key: &str) -> Option<NodeId> {
        self.owner_of(ring_hash(key.as_bytes())).cloned()
    }

    pub fn get_multiple(&self, key: &str, count: usize) -> Vec<NodeId> {
        if self.vnodes.is_empty() || count == 0 {
            return Vec::new();
        }
        let wanted = count.min(self.weights.len());
        let start = self.index_for(ring_hash(key.as_bytes()));
        let mut owners: Vec<NodeId> = Vec::with_capacity(wanted);

        for step in 0..self.vnodes.len() {
            let vnode = &self.vnodes[(start + step) % self.vnodes.len()];
            if !owners.iter().any(|n| n == &vnode.node) {
                owners.push(vnode.node.clone());
                if owners.len() == wanted {
                    break;
                }
            }
        }
        owners
    }

    pub fn distribution(&self) -> HashMap<NodeId, f64> {
        let mut owned: HashMap<NodeId, u128> = HashMap::with_capacity(self.weights.len());
        let Some(last) = self.vnodes.last() else {
            return HashMap::new();
        };

        let mut previous = last.position;
        for (i, vnode) in self.vnodes.iter().enumerate() {
            let arc = if i == 0 {
                vnode.position as u128 + (RING_SPACE - previous as u128)
            } else {
                (vnode.position - previous) as u128
            };
            *owned.entry(vnode.node.clone()).or_default() += arc;
            previous = vnode.position;
        }

        owned
            .into_iter()
            .map(|(node, arc)| (node, arc as f64 * 100.0 / RING_SPACE as f64))
            .collect()
    }

    fn with_node(&self, node: NodeId, weight: u32, base_virtual_nodes: usize) -> Self {
        let count = base_virtual_nodes * weight as usize;
        let mut vnodes = Vec::with_capacity(self.vnodes.len() + count);
        vnodes.extend_from_slice(&self.vnodes);
        vnodes.extend((0..count).map(|i| VirtualNode {
            position: ring_hash(format!("{}:{}", node, i).as_bytes()),
            node: node.clone(),
        }));
        // Tie-break on node id so equal positions order the same on every host.
        vnodes.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.node.cmp(&b.node)));

        let mut weights = self.weights.clone();
        weights.insert(node, weight);
        RingSnapshot { vnodes, weights }
    }

    fn without_node(&self, node: &str) -> Self {
        let vnodes = self
            .vnodes
            .iter()
            .filter(|v| &*v.node != node)
            .cloned()
            .collect();
        let mut weights = self.weights.clone();
        weights.remove(node);
        RingSnapshot { vnodes, weights }
    }
}

/// Thread-safe weighted consistent-hash ring.
///
/// Membership changes rebuild the snapshot under the write lock; lookups
/// read a consistent snapshot under the shared lock. No consistency is
/// promised across separate calls.
///
/// ```
/// use cache_mesh::ring::HashRing;
///
/// let ring = HashRing::new(100);
/// ring.add("cache-a", 1);
/// ring.add("cache-b", 2);
///
/// let owner = ring.get("user:42").unwrap();
/// assert_eq!(ring.get("user:42").unwrap(), owner);
/// assert_eq!(ring.get_multiple("user:42", 5).len(), 2);
/// ```
#[derive(Debug)]
pub struct HashRing {
    base_virtual_nodes: usize,
    snapshot: RwLock<RingSnapshot>,
}

impl HashRing {
    /// Ring placing `base_virtual_nodes` positions per unit of weight (min 1).
    pub fn new(base_virtual_nodes: usize) -> Self {
        HashRing {
            base_virtual_nodes: base_virtual_nodes.max(1),
            snapshot: RwLock::new(RingSnapshot::default()),
        }
    }

    pub fn base_virtual_nodes(&self) -> usize {
        self.base_virtual_nodes
    }

    /// Add `node` with `weight` (clamped to `1..=MAX_NODE_WEIGHT`). No-op if present.
    pub fn add(&self, node: &str, weight: u32) -> bool {
        let mut guard = self.snapshot.write();
        if guard.contains(node) {
            return false;
        }
        let weight = weight.clamp(1, MAX_NODE_WEIGHT);
        *guard = guard.with_node(Arc::from(node), weight, self.base_virtual_nodes);
        debug!(
            "Ring: added {} (weight {}, {} vnodes total)",
            node,
            weight,
            guard.vnode_count()
        );
        true
    }

    /// Remove `node` and all of its virtual nodes. No-op if absent.
    pub fn remove(&self, node: &str) -> bool {
        let mut guard = self.snapshot.write();
        if !guard.contains(node) {
            return false;
        }
        *guard = guard.without_node(node);
        debug!("Ring: removed {} ({} vnodes left)", node, guard.vnode_count());
        true
    }

    /// Owner of `key`, or `None` when the ring is empty.
    pub fn get(&self, key: &str) -> Option<NodeId> {
        self.snapshot.read().get(key)
    }

    /// Up to `count` distinct physical nodes, walking clockwise from `key`.
    ///
    /// The first entry is always [`get`](Self::get)'s answer.
    pub fn get_multiple(&self, key: &str, count: usize) -> Vec<NodeId> {
        self.snapshot.read().get_multiple(key, count)
    }

    /// Percentage of the hash space owned by each node.
    pub fn distribution(&self) -> HashMap<NodeId, f64> {
        self.snapshot.read().distribution()
    }

    /// Sampled estimate of which ranges changed owner relative to `old`.
    ///
    /// Checks [`REBALANCE_SAMPLES`] evenly spaced points. The result is a
    /// statistical estimate of data movement, not an exact accounting.
    pub fn get_rebalance_info(&self, old: &HashRing) -> Vec<RebalanceMove> {
        let before = old.snapshot();
        let after = self.snapshot();
        let step = u64::MAX / REBALANCE_SAMPLES as u64;

        let mut moves = Vec::new();
        for i in 0..REBALANCE_SAMPLES as u64 {
            let start = i * step;
            let end = if i + 1 == REBALANCE_SAMPLES as u64 {
                u64::MAX
            } else {
                start + step
            };
            let from = before.owner_of(start);
            let to = after.owner_of(start);
            if from != to {
                moves.push(RebalanceMove {
                    from_node: from.cloned(),
                    to_node: to.cloned(),
                    key_range: KeyRange { start, end },
                });
            }
        }
        moves
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> RingSnapshot {
        self.snapshot.read().clone()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.snapshot.read().contains(node)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.snapshot.read().weights.keys().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.snapshot.read().node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }
}

impl Clone for HashRing {
    fn clone(&self) -> Self {
        HashRing {
            base_virtual_nodes: self.base_virtual_nodes,
            snapshot: RwLock::new(self.snapshot()),
        }
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}
