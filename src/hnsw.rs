//! Hierarchical navigable small-world graph for approximate nearest
//! neighbor search over normalized embedding vectors.
//!
//! Distance is `1 - dot(a, b)`, which over unit vectors is cosine
//! distance. The graph is built in memory and rebuilt from the index
//! contents when invalidated; it is never persisted.

use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// Max-heap entry ordered by distance: the root is the worst candidate in
/// the working set, which makes trimming to `ef` cheap.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist: f32,
    node: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap entry (reversed ordering) for expanding the closest frontier
/// node first.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ReverseCandidate(Candidate);

impl Eq for ReverseCandidate {}

impl Ord for ReverseCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

impl PartialOrd for ReverseCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Node {
    vector: Vec<f32>,
    /// One adjacency list per layer the node participates in; index 0 is
    /// the base layer.
    neighbors: Vec<Vec<usize>>,
}

pub struct Hnsw {
    nodes: Vec<Node>,
    entry_point: Option<usize>,
    max_connections: usize,
    max_layers: usize,
    ef_construction: usize,
}

impl Hnsw {
    pub fn new(max_connections: usize, max_layers: usize, ef_construction: usize) -> Self {
        Self {
            nodes: Vec::new(),
            entry_point: None,
            max_connections: max_connections.max(2),
            max_layers: max_layers.max(1),
            ef_construction: ef_construction.max(16),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn distance(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        1.0 - dot
    }

    fn random_level(&self) -> usize {
        // Geometric level assignment, capped at max_layers.
        let mut rng = rand::thread_rng();
        let mut level = 0;
        while level + 1 < self.max_layers && rng.gen::<f64>() < 0.5 {
            level += 1;
        }
        level
    }

    /// Insert a vector and return its node id. Ids are dense and stable
    /// for the lifetime of the graph.
    pub fn insert(&mut self, vector: Vec<f32>) -> usize {
        let id = self.nodes.len();
        let level = self.random_level();
        self.nodes.push(Node {
            vector,
            neighbors: vec![Vec::new(); level + 1],
        });

        let Some(mut current) = self.entry_point else {
            self.entry_point = Some(id);
            return id;
        };

        let entry_level = self.nodes[current].neighbors.len() - 1;

        // Greedy descent through layers above the new node's top level.
        for layer in ((level + 1)..=entry_level).rev() {
            current = self.greedy_closest(id, current, layer);
        }

        // From the node's top level downward, connect to the ef best.
        for layer in (0..=level.min(entry_level)).rev() {
            let found = self.search_layer(&self.nodes[id].vector, current, layer, self.ef_construction);
            if let Some(best) = found.first() {
                current = best.node;
            }
            let limit = if layer == 0 {
                self.max_connections * 2
            } else {
                self.max_connections
            };
            for cand in found.iter().take(limit) {
                self.connect(id, cand.node, layer, limit);
            }
        }

        if level > entry_level {
            self.entry_point = Some(id);
        }
        id
    }

    fn connect(&mut self, a: usize, b: usize, layer: usize, limit: usize) {
        if a == b {
            return;
        }
        for (from, to) in [(a, b), (b, a)] {
            let list = &mut self.nodes[from].neighbors[layer];
            if !list.contains(&to) {
                list.push(to);
            }
            if list.len() > limit {
                // Keep the closest `limit` neighbors.
                let origin = self.nodes[from].vector.clone();
                let mut scored: Vec<(f32, usize)> = self.nodes[from].neighbors[layer]
                    .iter()
                    .map(|&n| (Self::distance(&origin, &self.nodes[n].vector), n))
                    .collect();
                scored.sort_by(|x, y| x.0.partial_cmp(&y.0).unwrap_or(Ordering::Equal));
                scored.truncate(limit);
                self.nodes[from].neighbors[layer] = scored.into_iter().map(|(_, n)| n).collect();
            }
        }
    }

    fn greedy_closest(&self, target: usize, mut current: usize, layer: usize) -> usize {
        let query = &self.nodes[target].vector;
        let mut best = Self::distance(query, &self.nodes[current].vector);
        loop {
            let mut improved = false;
            if layer < self.nodes[current].neighbors.len() {
                for &n in &self.nodes[current].neighbors[layer] {
                    let d = Self::distance(query, &self.nodes[n].vector);
                    if d < best {
                        best = d;
                        current = n;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search within one layer; returns candidates sorted closest
    /// first.
    fn search_layer(&self, query: &[f32], entry: usize, layer: usize, ef: usize) -> Vec<Candidate> {
        let mut visited = HashSet::new();
        visited.insert(entry);

        let start = Candidate {
            dist: Self::distance(query, &self.nodes[entry].vector),
            node: entry,
        };
        let mut frontier = BinaryHeap::new();
        frontier.push(ReverseCandidate(start));
        let mut working: BinaryHeap<Candidate> = BinaryHeap::new();
        working.push(start);

        while let Some(ReverseCandidate(closest)) = frontier.pop() {
            let worst = working.peek().map(|c| c.dist).unwrap_or(f32::MAX);
            if closest.dist > worst && working.len() >= ef {
                break;
            }
            if layer >= self.nodes[closest.node].neighbors.len() {
                continue;
            }
            for &n in &self.nodes[closest.node].neighbors[layer] {
                if !visited.insert(n) {
                    continue;
                }
                let cand = Candidate {
                    dist: Self::distance(query, &self.nodes[n].vector),
                    node: n,
                };
                let worst = working.peek().map(|c| c.dist).unwrap_or(f32::MAX);
                if working.len() < ef || cand.dist < worst {
                    working.push(cand);
                    if working.len() > ef {
                        working.pop();
                    }
                    frontier.push(ReverseCandidate(cand));
                }
            }
        }

        let mut out = working.into_sorted_vec();
        out.dedup_by_key(|c| c.node);
        out
    }

    /// Approximate k-nearest search; returns `(node_id, similarity)` pairs
    /// sorted by descending similarity.
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(usize, f32)> {
        let Some(mut current) = self.entry_point else {
            return Vec::new();
        };
        let entry_level = self.nodes[current].neighbors.len() - 1;

        for layer in (1..=entry_level).rev() {
            let found = self.search_layer(query, current, layer, 1);
            if let Some(best) = found.first() {
                current = best.node;
            }
        }

        let ef = ef_search.max(k);
        self.search_layer(query, current, 0, ef)
            .into_iter()
            .take(k)
            .map(|c| (c.node, 1.0 - c.dist))
            .collect()
    }
}
