use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::vector::{cosine_distance, cosine_similarity};

/// A scored match returned by an index.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub similarity: f32,
}

/// Seam between the store and its similarity search structure.
///
/// `accept` carries the metadata filter down to the index so that
/// implementations can skip non-matching ids before they take a result slot.
/// Results are ordered by descending cosine similarity and never contain an
/// entry below `min_similarity`.
pub trait NearestNeighborIndex: Send + Sync {
    fn insert(&mut self, id: &str, vector: &[f32]);

    fn remove(&mut self, id: &str) -> bool;

    fn search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
        accept: &dyn Fn(&str) -> bool,
    ) -> Vec<Neighbor>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);

    fn name(&self) -> &'static str;
}

// --- FLAT (BRUTE FORCE) ---

/// Exhaustive O(N) scan. Ties keep insertion order.
#[derive(Debug, Default)]
pub struct FlatIndex {
    entries: Vec<(String, Vec<f32>)>,
    positions: HashMap<String, usize>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NearestNeighborIndex for FlatIndex {
    fn insert(&mut self, id: &str, vector: &[f32]) {
        match self.positions.get(id) {
            Some(&pos) => {
                if let Some(entry) = self.entries.get_mut(pos) {
                    entry.1 = vector.to_vec();
                }
            }
            None => {
                self.positions.insert(id.to_string(), self.entries.len());
                self.entries.push((id.to_string(), vector.to_vec()));
            }
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(pos) = self.positions.remove(id) else {
            return false;
        };
        self.entries.remove(pos);
        for (i, (key, _)) in self.entries.iter().enumerate().skip(pos) {
            self.positions.insert(key.clone(), i);
        }
        true
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
        accept: &dyn Fn(&str) -> bool,
    ) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<Neighbor> = self
            .entries
            .iter()
            .filter(|(id, _)| accept(id))
            .filter_map(|(id, vector)| {
                let similarity = cosine_similarity(query, vector);
                (similarity >= min_similarity).then(|| Neighbor { id: id.clone(), similarity })
            })
            .collect();

        // Stable: equal scores stay in insertion order
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(k);
        scored
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    fn name(&self) -> &'static str {
        "flat"
    }
}

// --- HNSW ---

const MAX_LEVEL: usize = 16;

/// Tombstones tolerated before the graph is rebuilt from live nodes.
const REBUILD_MIN_TOMBSTONES: usize = 32;

#[derive(Debug, Clone)]
struct Node {
    id: String,
    vector: Vec<f32>,
    connections: Vec<Vec<usize>>,
}

/// Hierarchical navigable small world graph.
///
/// Removal is logical: the slot is emptied and incoming links are left
/// dangling. Search skips empty slots. Once tombstones outnumber live nodes
/// (and pass `REBUILD_MIN_TOMBSTONES`) the graph is rebuilt from scratch.
#[derive(Debug)]
pub struct HnswIndex {
    nodes: Vec<Option<Node>>,
    slots: HashMap<String, usize>,
    entry_point: Option<usize>,
    max_layer: usize,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    rng: StdRng,
}

impl HnswIndex {
    pub fn new(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self::with_seed(m, ef_construction, ef_search, rand::thread_rng().gen())
    }

    /// Deterministic level assignment, mostly for tests.
    pub fn with_seed(m: usize, ef_construction: usize, ef_search: usize, seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            m: m.max(2),
            ef_construction: ef_construction.max(1),
            ef_search: ef_search.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn select_level(&mut self) -> usize {
        // l = floor(-ln(U) * mL), mL = 1 / ln(M)
        let ml = 1.0 / (self.m as f64).ln();
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        ((-u.ln() * ml).floor() as usize).min(MAX_LEVEL)
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn dist(&self, query: &[f32], slot: usize) -> Option<f32> {
        self.node(slot).map(|n| cosine_distance(query, &n.vector))
    }

    /// Greedy walk on one layer toward the closest node.
    fn greedy_closest(&self, query: &[f32], mut current: usize, layer: usize) -> usize {
        let Some(mut best) = self.dist(query, current) else {
            return current;
        };

        let mut changed = true;
        while changed {
            changed = false;
            let Some(node) = self.node(current) else { break };
            let Some(links) = node.connections.get(layer) else { break };
            for &neighbor in links {
                if let Some(d) = self.dist(query, neighbor) {
                    if d < best {
                        best = d;
                        current = neighbor;
                        changed = true;
                    }
                }
            }
        }
        current
    }

    /// Beam search over a single layer. Returns (distance, slot) ascending.
    fn search_layer(&self, query: &[f32], entry: usize, ef: usize, layer: usize) -> Vec<(OrderedFloat<f32>, usize)> {
        let Some(d0) = self.dist(query, entry) else {
            return Vec::new();
        };

        let mut visited = HashSet::new();
        visited.insert(entry);

        let mut candidates = BinaryHeap::new();
        candidates.push(Reverse((OrderedFloat(d0), entry)));
        let mut results = BinaryHeap::new();
        results.push((OrderedFloat(d0), entry));

        while let Some(Reverse((dist, slot))) = candidates.pop() {
            let worst = results.peek().map(|(d, _)| *d).unwrap_or(OrderedFloat(f32::MAX));
            if dist > worst && results.len() >= ef {
                break;
            }

            let Some(node) = self.node(slot) else { continue };
            let Some(links) = node.connections.get(layer) else { continue };

            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let Some(d) = self.dist(query, neighbor) else { continue };
                let d = OrderedFloat(d);
                let worst = results.peek().map(|(w, _)| *w).unwrap_or(OrderedFloat(f32::MAX));
                if results.len() < ef || d < worst {
                    candidates.push(Reverse((d, neighbor)));
                    results.push((d, neighbor));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        out
    }

    /// Keep only the `limit` closest links of `slot` on `layer`.
    fn prune(&mut self, slot: usize, layer: usize, limit: usize) {
        let Some(node) = self.node(slot) else { return };
        let Some(links) = node.connections.get(layer) else { return };
        if links.len() <= limit {
            return;
        }

        let base = node.vector.clone();
        let mut scored: Vec<(OrderedFloat<f32>, usize)> = links
            .iter()
            .filter_map(|&n| self.dist(&base, n).map(|d| (OrderedFloat(d), n)))
            .collect();
        scored.sort();
        scored.truncate(limit);

        if let Some(Some(node)) = self.nodes.get_mut(slot) {
            if let Some(links) = node.connections.get_mut(layer) {
                *links = scored.into_iter().map(|(_, n)| n).collect();
            }
        }
    }

    pub fn tombstones(&self) -> usize {
        self.nodes.len() - self.slots.len()
    }

    /// Re-inserts every live node, in slot order, into a fresh graph.
    fn rebuild(&mut self) {
        let live: Vec<Node> = self.nodes.drain(..).flatten().collect();
        self.slots.clear();
        self.entry_point = None;
        self.max_layer = 0;
        for node in live {
            self.insert(&node.id, &node.vector);
        }
    }

    fn reelect_entry_point(&mut self) {
        let best = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, n)| n.as_ref().map(|n| (n.connections.len(), Reverse(slot))))
            .max();

        match best {
            Some((layers, Reverse(slot))) => {
                self.entry_point = Some(slot);
                self.max_layer = layers.saturating_sub(1);
            }
            None => {
                self.entry_point = None;
                self.max_layer = 0;
            }
        }
    }
}

impl NearestNeighborIndex for HnswIndex {
    fn insert(&mut self, id: &str, vector: &[f32]) {
        if self.slots.contains_key(id) {
            self.remove(id);
        }

        let level = self.select_level();
        let slot = self.nodes.len();
        self.nodes.push(Some(Node {
            id: id.to_string(),
            vector: vector.to_vec(),
            connections: vec![Vec::new(); level + 1],
        }));
        self.slots.insert(id.to_string(), slot);

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_layer = level;
            return;
        };

        let max_layer = self.max_layer;

        // Traverse upper layers greedily to find the entry for our top layer
        for layer in (level + 1..=max_layer).rev() {
            entry = self.greedy_closest(vector, entry, layer);
        }

        for layer in (0..=level.min(max_layer)).rev() {
            let candidates = self.search_layer(vector, entry, self.ef_construction, layer);
            let neighbors: Vec<usize> = candidates
                .iter()
                .map(|(_, n)| *n)
                .filter(|n| *n != slot)
                .take(self.m)
                .collect();

            if let Some(Some(node)) = self.nodes.get_mut(slot) {
                if let Some(links) = node.connections.get_mut(layer) {
                    links.extend(neighbors.iter().copied());
                }
            }

            let limit = self.max_connections(layer);
            for &peer in &neighbors {
                if let Some(Some(node)) = self.nodes.get_mut(peer) {
                    if let Some(links) = node.connections.get_mut(layer) {
                        links.push(slot);
                    }
                }
                self.prune(peer, layer, limit);
            }

            if let Some((_, closest)) = candidates.first() {
                entry = *closest;
            }
        }

        if level > max_layer {
            self.max_layer = level;
            self.entry_point = Some(slot);
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(slot) = self.slots.remove(id) else {
            return false;
        };
        if let Some(node) = self.nodes.get_mut(slot) {
            *node = None;
        }
        if self.entry_point == Some(slot) {
            self.reelect_entry_point();
        }

        let dead = self.tombstones();
        if dead >= REBUILD_MIN_TOMBSTONES && dead > self.slots.len() {
            self.rebuild();
        }
        true
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
        accept: &dyn Fn(&str) -> bool,
    ) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }
        let Some(mut entry) = self.entry_point else {
            return Vec::new();
        };

        // 1. Zoom in from the top layer
        for layer in (1..=self.max_layer).rev() {
            entry = self.greedy_closest(query, entry, layer);
        }

        // 2. Widen the base layer beam until enough candidates pass the filter
        let live = self.slots.len();
        let mut ef = self.ef_search.max(k);
        loop {
            let mut hits: Vec<(usize, Neighbor)> = self
                .search_layer(query, entry, ef, 0)
                .into_iter()
                .filter_map(|(_, slot)| {
                    let node = self.node(slot)?;
                    if !accept(&node.id) {
                        return None;
                    }
                    let similarity = cosine_similarity(query, &node.vector);
                    (similarity >= min_similarity).then(|| {
                        (slot, Neighbor { id: node.id.clone(), similarity })
                    })
                })
                .collect();

            if hits.len() >= k || ef >= live {
                hits.sort_by(|a, b| {
                    b.1.similarity
                        .total_cmp(&a.1.similarity)
                        .then_with(|| a.0.cmp(&b.0))
                });
                return hits.into_iter().take(k).map(|(_, n)| n).collect();
            }
            ef = ef.saturating_mul(2).min(live);
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.slots.clear();
        self.entry_point = None;
        self.max_layer = 0;
    }

    fn name(&self) -> &'static str {
        "hnsw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_all(_: &str) -> bool {
        true
    }

    /// Points along a quarter circle, so neighbors are well ordered.
    fn arc(i: usize) -> Vec<f32> {
        let theta = i as f32 * std::f32::consts::FRAC_PI_2 / 64.0;
        vec![theta.cos(), theta.sin()]
    }

    #[test]
    fn flat_orders_by_similarity() {
        let mut index = FlatIndex::new();
        index.insert("a", &[1.0, 0.0]);
        index.insert("b", &[0.7, 0.7]);
        index.insert("c", &[0.0, 1.0]);

        let hits = index.search(&[1.0, 0.0], 3, -1.0, &accept_all);
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(hits[0].similarity, 1.0);
    }

    #[test]
    fn flat_ties_keep_insertion_order() {
        let mut index = FlatIndex::new();
        index.insert("first", &[1.0, 1.0]);
        index.insert("second", &[2.0, 2.0]);
        index.insert("third", &[3.0, 3.0]);

        let hits = index.search(&[1.0, 1.0], 10, 0.0, &accept_all);
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["first", "second", "third"]);
    }

    #[test]
    fn flat_threshold_and_filter() {
        let mut index = FlatIndex::new();
        index.insert("keep", &[1.0, 0.0]);
        index.insert("skip", &[1.0, 0.0]);
        index.insert("far", &[0.0, 1.0]);

        assert!(index.search(&[1.0, 0.0], 5, 1.1, &accept_all).is_empty());

        let hits = index.search(&[1.0, 0.0], 5, 0.5, &|id| id != "skip");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "keep");

        assert!(index.search(&[1.0, 0.0], 0, -1.0, &accept_all).is_empty());
    }

    #[test]
    fn flat_remove_and_replace() {
        let mut index = FlatIndex::new();
        index.insert("a", &[1.0, 0.0]);
        index.insert("b", &[0.0, 1.0]);
        index.insert("c", &[1.0, 1.0]);

        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.len(), 2);

        index.insert("c", &[1.0, 0.0]);
        assert_eq!(index.len(), 2);
        let hits = index.search(&[1.0, 0.0], 1, 0.0, &accept_all);
        assert_eq!(hits[0].id, "c");
        assert_eq!(hits[0].similarity, 1.0);

        index.clear();
        assert!(index.is_empty());
    }

    #[test]
    fn hnsw_finds_exact_match() {
        let mut index = HnswIndex::with_seed(8, 64, 32, 7);
        for i in 0..64 {
            index.insert(&format!("v{i}"), &arc(i));
        }
        assert_eq!(index.len(), 64);

        for i in [0, 13, 40, 63] {
            let hits = index.search(&arc(i), 1, 0.5, &accept_all);
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].id, format!("v{i}"));
            assert_eq!(hits[0].similarity, 1.0);
        }
    }

    #[test]
    fn hnsw_agrees_with_flat_on_small_sets() {
        let mut flat = FlatIndex::new();
        let mut hnsw = HnswIndex::with_seed(16, 100, 100, 42);
        let mut rng = StdRng::seed_from_u64(1);

        for i in 0..200 {
            let v: Vec<f32> = (0..32).map(|_| rng.gen_range(0.0..1.0)).collect();
            flat.insert(&format!("v{i}"), &v);
            hnsw.insert(&format!("v{i}"), &v);
        }

        let query: Vec<f32> = (0..32).map(|_| rng.gen_range(0.0..1.0)).collect();
        let expected = flat.search(&query, 1, -1.0, &accept_all);
        let got = hnsw.search(&query, 5, -1.0, &accept_all);
        assert!(got.iter().any(|n| n.id == expected[0].id));
    }

    #[test]
    fn hnsw_filter_widens_beam() {
        let mut index = HnswIndex::with_seed(4, 16, 4, 3);
        for i in 0..64 {
            index.insert(&format!("v{i}"), &[1.0, i as f32 / 64.0]);
        }
        let hits = index.search(&[1.0, 0.0], 3, -1.0, &|id| id.ends_with('7'));
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.id.ends_with('7')));
    }

    #[test]
    fn hnsw_remove_entry_point() {
        let mut index = HnswIndex::with_seed(4, 16, 16, 9);
        index.insert("a", &[1.0, 0.0]);
        index.insert("b", &[0.0, 1.0]);
        index.insert("c", &[1.0, 1.0]);

        for id in ["a", "b"] {
            assert!(index.remove(id));
        }
        let hits = index.search(&[1.0, 1.0], 5, -1.0, &accept_all);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c");

        assert!(index.remove("c"));
        assert!(index.search(&[1.0, 1.0], 5, -1.0, &accept_all).is_empty());
    }

    #[test]
    fn hnsw_reinsert_replaces_vector() {
        let mut index = HnswIndex::with_seed(4, 16, 16, 11);
        index.insert("a", &[1.0, 0.0]);
        index.insert("b", &[0.0, 1.0]);
        index.insert("a", &[0.0, 1.0]);
        assert_eq!(index.len(), 2);

        let hits = index.search(&[0.0, 1.0], 2, 0.9, &accept_all);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn hnsw_rebuilds_after_heavy_churn() {
        let mut index = HnswIndex::with_seed(8, 32, 32, 5);
        for i in 0..10 {
            index.insert(&format!("v{i}"), &arc(i));
        }
        for round in 0..2_000 {
            index.insert("hot", &arc(round % 64));
        }

        assert_eq!(index.len(), 11);
        assert!(index.tombstones() <= REBUILD_MIN_TOMBSTONES);

        for i in 0..10 {
            let hits = index.search(&arc(i), 1, 0.0, &|id| id != "hot");
            assert_eq!(hits[0].id, format!("v{i}"));
            assert_eq!(hits[0].similarity, 1.0);
        }
    }
}
