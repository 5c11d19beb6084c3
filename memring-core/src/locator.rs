//! Key-to-node selection. The locator sees only the live membership view;
//! the cluster rebuilds it whenever a node dies or revives, so a dead node
//! is never handed out. Rebuilds swap in a whole new snapshot, which keeps
//! lookups consistent without locking the ring during reads.

use md5::{Digest, Md5};
use std::sync::Arc;

/// Virtual points each node contributes to the ring. Weighted membership
/// would scale this factor per node; weights are uniform here.
pub const POINTS_PER_NODE: usize = 160;

/// One entry of the live-node view handed to a locator build: the node's
/// stable index in the cluster plus the endpoint string that seeds its
/// ring points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingNode {
    pub index: usize,
    pub endpoint: String,
}

/// An immutable key-to-node mapping over one membership snapshot.
pub trait NodeLocator: Send + Sync {
    /// Pick a node for the key, or `None` when no node is available.
    fn locate(&self, key: &[u8]) -> Option<usize>;
}

/// Builds locator snapshots from live-node views.
pub trait LocatorFactory: Send + Sync {
    fn build(&self, nodes: &[RingNode]) -> Arc<dyn NodeLocator>;
}

/// The shipped locator strategies.
#[derive(Clone, Default)]
pub enum LocatorKind {
    /// The consistent-hash ring; the right default for clusters.
    #[default]
    ConsistentHash,
    /// Short-circuits every lookup to the sole configured node.
    SingleNode,
    Custom(Arc<dyn LocatorFactory>),
}

impl LocatorKind {
    pub(crate) fn build(&self, nodes: &[RingNode]) -> Arc<dyn NodeLocator> {
        match self {
            LocatorKind::ConsistentHash => Arc::new(KetamaRing::new(nodes)),
            LocatorKind::SingleNode => Arc::new(SingleNode::new(nodes)),
            LocatorKind::Custom(factory) => factory.build(nodes),
        }
    }
}

impl std::fmt::Debug for LocatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocatorKind::ConsistentHash => f.write_str("ConsistentHash"),
            LocatorKind::SingleNode => f.write_str("SingleNode"),
            LocatorKind::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A ketama-style consistent-hash ring. Each node contributes
/// [`POINTS_PER_NODE`] points derived from md5 digests of
/// `"{endpoint}-{i}"`, four u32 points per digest. Keys hash with 32-bit
/// FNV-1a and map to the first point at or after their hash, wrapping
/// around the ring.
///
/// Membership changes therefore move only the keys owned by the node that
/// joined or left, and the same node set produces the same ring no matter
/// the order nodes were listed in.
#[derive(Debug, Clone)]
pub struct KetamaRing {
    points: Vec<(u32, usize)>,
}

impl KetamaRing {
    pub fn new(nodes: &[RingNode]) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * POINTS_PER_NODE);
        for node in nodes {
            for i in 0..POINTS_PER_NODE / 4 {
                let digest = Md5::digest(format!("{}-{}", node.endpoint, i).as_bytes());
                for chunk in digest.chunks_exact(4) {
                    let hash = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((hash, node.index));
                }
            }
        }
        // Ties between nodes are broken by the endpoint so the ring is
        // identical for any insertion order.
        points.sort_by(|&(ha, ia), &(hb, ib)| {
            ha.cmp(&hb).then_with(|| {
                let ea = nodes.iter().find(|n| n.index == ia).map(|n| &n.endpoint);
                let eb = nodes.iter().find(|n| n.index == ib).map(|n| &n.endpoint);
                ea.cmp(&eb)
            })
        });
        Self { points }
    }
}

impl NodeLocator for KetamaRing {
    fn locate(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let hash = fnv1a_32(key);
        let at = self.points.partition_point(|&(point, _)| point < hash);
        let (_, index) = self.points[if at == self.points.len() { 0 } else { at }];
        Some(index)
    }
}

/// The degenerate single-server locator.
#[derive(Debug, Clone)]
pub struct SingleNode {
    index: Option<usize>,
}

impl SingleNode {
    pub fn new(nodes: &[RingNode]) -> Self {
        Self {
            index: nodes.first().map(|n| n.index),
        }
    }
}

impl NodeLocator for SingleNode {
    fn locate(&self, _key: &[u8]) -> Option<usize> {
        self.index
    }
}

/// 32-bit FNV-1a, the key hash of the ring.
pub(crate) fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter()
        .fold(OFFSET_BASIS, |hash, &byte| (hash ^ byte as u32).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(endpoints: &[&str]) -> Vec<RingNode> {
        endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| RingNode {
                index,
                endpoint: endpoint.to_string(),
            })
            .collect()
    }

    fn sample_keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key:{}", i).into_bytes()).collect()
    }

    #[test]
    fn fnv1a_known_values() {
        // Reference vectors for 32-bit FNV-1a.
        assert_eq!(0x811c9dc5, fnv1a_32(b""));
        assert_eq!(0xe40c292c, fnv1a_32(b"a"));
        assert_eq!(0xbf9cf968, fnv1a_32(b"foobar"));
    }

    #[test]
    fn ring_size() {
        let ring = KetamaRing::new(&view(&["a:11211", "b:11211", "c:11211"]));
        assert_eq!(3 * POINTS_PER_NODE, ring.points.len());
        assert!(ring.points.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn empty_ring_locates_nothing() {
        let ring = KetamaRing::new(&[]);
        assert_eq!(None, ring.locate(b"anything"));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let forward = KetamaRing::new(&view(&["a:11211", "b:11211", "c:11211"]));
        // Same endpoints, listed backwards, with matching indices.
        let mut reversed = view(&["a:11211", "b:11211", "c:11211"]);
        reversed.reverse();
        let backward = KetamaRing::new(&reversed);

        for key in sample_keys(500) {
            assert_eq!(forward.locate(&key), backward.locate(&key));
        }
    }

    #[test]
    fn removing_a_node_moves_only_its_keys() {
        let full = KetamaRing::new(&view(&["a:11211", "b:11211", "c:11211"]));
        let without_c = KetamaRing::new(&view(&["a:11211", "b:11211"]));

        for key in sample_keys(1000) {
            let before = full.locate(&key).unwrap();
            let after = without_c.locate(&key).unwrap();
            if before != 2 {
                assert_eq!(before, after, "key moved off a surviving node");
            }
        }
    }

    #[test]
    fn adding_a_node_steals_roughly_its_share() {
        let three = KetamaRing::new(&view(&["a:11211", "b:11211", "c:11211"]));
        let four = KetamaRing::new(&view(&["a:11211", "b:11211", "c:11211", "d:11211"]));

        let keys = sample_keys(4000);
        let moved = keys
            .iter()
            .filter(|k| three.locate(k) != four.locate(k))
            .count();
        // Expect about 1/4 of the keyspace to move; allow generous slack.
        assert!(moved > keys.len() / 8, "moved only {} keys", moved);
        assert!(moved < keys.len() / 2, "moved {} keys", moved);
        // Every moved key must land on the new node.
        for key in &keys {
            if three.locate(key) != four.locate(key) {
                assert_eq!(Some(3), four.locate(key));
            }
        }
    }

    #[test]
    fn distribution_is_roughly_uniform() {
        let ring = KetamaRing::new(&view(&["a:11211", "b:11211", "c:11211", "d:11211"]));
        let keys = sample_keys(8000);
        let mut counts = [0usize; 4];
        for key in &keys {
            counts[ring.locate(key).unwrap()] += 1;
        }
        for &count in &counts {
            // 25% ± 15 points.
            assert!(count > keys.len() / 10, "unbalanced ring: {:?}", counts);
            assert!(count < keys.len() * 2 / 5, "unbalanced ring: {:?}", counts);
        }
    }

    #[test]
    fn single_node_short_circuits() {
        let locator = SingleNode::new(&view(&["a:11211"]));
        assert_eq!(Some(0), locator.locate(b"k1"));
        assert_eq!(Some(0), locator.locate(b"k2"));
        let empty = SingleNode::new(&[]);
        assert_eq!(None, empty.locate(b"k1"));
    }

    #[test]
    fn kind_builds_the_right_locator() {
        let nodes = view(&["a:11211", "b:11211"]);
        let ring = LocatorKind::ConsistentHash.build(&nodes);
        let keys = sample_keys(200);
        let hits: std::collections::HashSet<_> =
            keys.iter().filter_map(|k| ring.locate(k)).collect();
        assert!(hits.len() > 1, "consistent hash should use both nodes");

        let single = LocatorKind::SingleNode.build(&nodes);
        assert!(keys.iter().all(|k| single.locate(k) == Some(0)));
    }
}
