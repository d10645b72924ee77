//! Strategy picks as pure functions over the eligible node set.
//!
//! Each function returns an index into the slice it was given. The caller
//! guarantees the slice is non-empty.

use std::sync::Arc;

use tidegate_state::Node;

/// Index of the node with the fewest in-flight connections. Ties go to the
/// earliest node, which is registration order for registry snapshots.
pub fn pick_least_connections(nodes: &[Arc<Node>]) -> usize {
    nodes
        .iter()
        .enumerate()
        .min_by_key(|(_, node)| node.current_connections())
        .map_or(0, |(idx, _)| idx)
}

/// Weighted draw. `r` must be uniform in `[0, total_weight)`; weights are
/// subtracted in order until `r` is no longer positive.
pub fn pick_weighted(weights: &[u32], mut r: f64) -> usize {
    for (idx, weight) in weights.iter().enumerate() {
        r -= f64::from(*weight);
        if r <= 0.0 {
            return idx;
        }
    }
    // Only reachable with r at or past the total because of rounding.
    weights.len().saturating_sub(1)
}

/// 32-bit polynomial hash: `h = h * 31 + c`, wrapping.
pub fn ip_hash(client_ip: &str) -> i32 {
    client_ip.chars().fold(0i32, |hash, c| {
        hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(c as i32)
    })
}

/// Index chosen for `client_ip` among `count` nodes.
pub fn ip_hash_index(client_ip: &str, count: usize) -> usize {
    ip_hash(client_ip).unsigned_abs() as usize % count
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidegate_state::{NodeAddress, NodeSpec};

    fn node(id: &str, seq: u64) -> Arc<Node> {
        Arc::new(Node::new(
            NodeSpec {
                id: id.into(),
                address: NodeAddress::new("http", "127.0.0.1", 4000 + seq as u16),
                weight: 1,
                max_connections: 100,
            },
            seq,
            true,
        ))
    }

    #[test]
    fn least_connections_finds_minimum() {
        let nodes = vec![node("a", 0), node("b", 1), node("c", 2)];
        for _ in 0..3 {
            nodes[0].try_acquire();
        }
        nodes[1].try_acquire();
        for _ in 0..2 {
            nodes[2].try_acquire();
        }
        assert_eq!(pick_least_connections(&nodes), 1);
    }

    #[test]
    fn least_connections_ties_go_to_first() {
        let nodes = vec![node("a", 0), node("b", 1), node("c", 2)];
        nodes[0].try_acquire();
        assert_eq!(pick_least_connections(&nodes), 1);

        nodes[1].try_acquire();
        nodes[2].try_acquire();
        assert_eq!(pick_least_connections(&nodes), 0);
    }

    #[test]
    fn weighted_boundaries() {
        let weights = [3, 1];
        assert_eq!(pick_weighted(&weights, 0.0), 0);
        assert_eq!(pick_weighted(&weights, 2.9), 0);
        assert_eq!(pick_weighted(&weights, 3.0), 0);
        assert_eq!(pick_weighted(&weights, 3.1), 1);
        assert_eq!(pick_weighted(&weights, 3.999), 1);
        assert_eq!(pick_weighted(&weights, 4.0), 1);
    }

    #[test]
    fn ip_hash_known_values() {
        assert_eq!(ip_hash(""), 0);
        assert_eq!(ip_hash("a"), 97);
        assert_eq!(ip_hash("ab"), 97 * 31 + 98);
    }

    #[test]
    fn ip_hash_wraps_without_panicking() {
        let long = "255.255.255.255".repeat(10);
        let idx = ip_hash_index(&long, 7);
        assert!(idx < 7);
    }

    #[test]
    fn ip_hash_is_deterministic() {
        for ip in ["10.0.0.1", "192.168.1.77", "::1", "2001:db8::42"] {
            assert_eq!(ip_hash_index(ip, 5), ip_hash_index(ip, 5));
        }
    }
}
