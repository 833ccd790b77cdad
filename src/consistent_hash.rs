// Copyright 2021 The yadcc developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Weighted consistent-hash ring. Used by the disk cache to map entry keys
//! onto shard directories so that adding or removing a shard only relocates
//! a proportional share of the keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use util;

/// Virtual nodes per weight unit. More virtual nodes make the distribution
/// more uniform at the cost of ring size.
const VIRTUAL_NODE_FACTOR: u64 = 100;

pub struct ConsistentHash {
    // hash point -> node name. BTreeMap gives us the successor lookup.
    ring: BTreeMap<u64, Arc<String>>,
}

impl ConsistentHash {
    /// `weighted_nodes` maps node name to its (non-zero) weight.
    pub fn new<I>(weighted_nodes: I) -> ConsistentHash
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut ring = BTreeMap::new();
        for (node, weight) in weighted_nodes {
            assert!(weight > 0, "node [{}] has zero weight", node);
            let node = Arc::new(node);
            for i in 0..weight * VIRTUAL_NODE_FACTOR {
                let point = util::placement_hash(format!("{}#VN{}", node, i).as_bytes());
                ring.insert(point, node.clone());
            }
        }
        assert!(!ring.is_empty());
        ConsistentHash { ring }
    }

    /// Maps `hash` to the owning node: the first virtual node at or after it
    /// on the ring, wrapping around at the top.
    pub fn get_node(&self, hash: u64) -> &str {
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
            .unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn key_hash(i: u32) -> u64 {
        util::placement_hash(format!("key-{}", i).as_bytes())
    }

    #[test]
    fn test_distribution_is_roughly_uniform() {
        let ring = ConsistentHash::new(vec![
            ("a".to_owned(), 1),
            ("b".to_owned(), 1),
            ("c".to_owned(), 1),
            ("d".to_owned(), 1),
        ]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        const KEYS: u32 = 40_000;
        for i in 0..KEYS {
            *counts.entry(ring.get_node(key_hash(i)).to_owned()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 4);
        for (_, count) in &counts {
            // Each node should see 25% +- 10% (absolute) of the keys.
            assert!(*count > (KEYS as usize) * 15 / 100);
            assert!(*count < (KEYS as usize) * 35 / 100);
        }
    }

    #[test]
    fn test_weights_are_respected() {
        let ring = ConsistentHash::new(vec![("small".to_owned(), 1), ("big".to_owned(), 3)]);
        let mut big = 0usize;
        const KEYS: u32 = 40_000;
        for i in 0..KEYS {
            if ring.get_node(key_hash(i)) == "big" {
                big += 1;
            }
        }
        // Expect ~75%.
        assert!(big > (KEYS as usize) * 65 / 100);
        assert!(big < (KEYS as usize) * 85 / 100);
    }

    #[test]
    fn test_adding_a_shard_moves_a_bounded_share_of_keys() {
        let nodes: Vec<(String, u64)> =
            (0..4).map(|i| (format!("node-{}", i), 1)).collect();
        let before = ConsistentHash::new(nodes.clone());
        let mut with_extra = nodes.clone();
        with_extra.push(("node-4".to_owned(), 1));
        let after = ConsistentHash::new(with_extra);

        const KEYS: u32 = 40_000;
        let mut moved = 0usize;
        for i in 0..KEYS {
            let h = key_hash(i);
            let (src, dst) = (before.get_node(h), after.get_node(h));
            if src != dst {
                // Keys only ever move *to* the new shard, never between the
                // old ones.
                assert_eq!(dst, "node-4");
                moved += 1;
            }
        }
        // Expectation is 1/5 of keys; allow generous slack.
        assert!(moved < (KEYS as usize) * 30 / 100, "moved {} keys", moved);
        assert!(moved > (KEYS as usize) * 10 / 100, "moved {} keys", moved);
    }
}
