use crate::worker::SerializedNode;
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

/// Structural similarity of two subtrees in `[0, 1]`: the longest common
/// subsequence of their preorder type sequences, normalized by the longer
/// sequence. Only used to decide direct replacement of large dissimilar
/// trees; never affects correctness.
pub fn structural_similarity(old: &SerializedNode, new: &SerializedNode) -> f64 {
    let mut a = Vec::new();
    type_sequence(old, &mut a);
    let mut b = Vec::new();
    type_sequence(new, &mut b);

    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    lcs_len(&a, &b) as f64 / longest as f64
}

fn type_sequence<'a>(node: &'a SerializedNode, out: &mut Vec<&'a str>) {
    out.push(node.type_name.as_str());
    for child in &node.children {
        type_sequence(child, out);
    }
}

fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    // Two-row table; trees at the gate are ~hundreds of nodes.
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for item_a in a {
        for (j, item_b) in b.iter().enumerate() {
            row[j + 1] = if item_a == item_b {
                prev[j] + 1
            } else {
                prev[j + 1].max(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

/// Cheap shape fingerprint of a snapshot, used as half of a similarity
/// cache key.
pub fn shape_hash(node: &SerializedNode) -> u64 {
    let mut hasher = FxHasher::default();
    hash_shape(node, &mut hasher);
    hasher.finish()
}

fn hash_shape<H: Hasher>(node: &SerializedNode, hasher: &mut H) {
    node.type_name.hash(hasher);
    node.key.hash(hasher);
    node.children.len().hash(hasher);
    for child in &node.children {
        hash_shape(child, hasher);
    }
}

/// Bounded similarity cache. FIFO: overflowing evicts the oldest 20% of
/// entries in one sweep, so eviction cost stays amortized.
pub struct SimilarityCache {
    entries: FxHashMap<(u64, u64), f64>,
    order: VecDeque<(u64, u64)>,
    capacity: usize,
}

impl SimilarityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: (u64, u64)) -> Option<f64> {
        self.entries.get(&key).copied()
    }

    pub fn insert(&mut self, key: (u64, u64), score: f64) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key, score);
            return;
        }
        if self.entries.len() >= self.capacity {
            let evict = (self.capacity / 5).max(1);
            for _ in 0..evict {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
            tracing::trace!(evicted = evict, "similarity cache overflow");
        }
        self.entries.insert(key, score);
        self.order.push_back(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::Props;

    fn tree(type_name: &str, children: Vec<SerializedNode>) -> SerializedNode {
        SerializedNode {
            type_name: type_name.to_owned(),
            key: None,
            props: Props::default(),
            listeners: Vec::new(),
            children,
            assigned: None,
        }
    }

    #[test]
    fn identical_shapes_score_one() {
        let a = tree("View", vec![tree("Text", vec![]), tree("Image", vec![])]);
        let b = tree("View", vec![tree("Text", vec![]), tree("Image", vec![])]);
        assert!((structural_similarity(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_types_score_near_zero() {
        let a = tree("View", (0..20).map(|_| tree("Text", vec![])).collect());
        let b = tree("Grid", (0..20).map(|_| tree("Cell", vec![])).collect());
        assert!(structural_similarity(&a, &b) < 0.05);
    }

    #[test]
    fn partial_overlap_scores_between() {
        let a = tree("View", vec![tree("Text", vec![]), tree("Text", vec![])]);
        let b = tree("View", vec![tree("Text", vec![]), tree("Image", vec![])]);
        let score = structural_similarity(&a, &b);
        assert!(score > 0.5 && score < 1.0);
    }

    #[test]
    fn cache_evicts_oldest_fifth() {
        let mut cache = SimilarityCache::new(10);
        for i in 0..10u64 {
            cache.insert((i, i), 0.5);
        }
        assert_eq!(cache.len(), 10);

        cache.insert((100, 100), 0.9);
        // Two oldest evicted, newcomer added.
        assert_eq!(cache.len(), 9);
        assert!(cache.get((0, 0)).is_none());
        assert!(cache.get((1, 1)).is_none());
        assert_eq!(cache.get((100, 100)), Some(0.9));
        assert_eq!(cache.get((2, 2)), Some(0.5));
    }
}
