use super::Correspondence;
use crate::math::{Rot3, Vec3};
use nalgebra::Unit;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Verified two-view geometry between images `i1 < i2`.
///
/// `rotation` is `i2Ri1` and `translation_dir` is the unit direction of `i2ti1`,
/// so a point maps as `X2 = R * X1 + s * t` for an unknown scale `s > 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativePose {
    pub i1: usize,
    pub i2: usize,
    pub rotation: Rot3,
    pub translation_dir: Unit<Vec3>,
    /// Verified correspondences (`a` indexes `i1`, `b` indexes `i2`).
    pub inliers: Vec<Correspondence>,
    /// Number of putative matches before verification.
    pub num_putative: usize,
}

impl RelativePose {
    pub fn num_inliers(&self) -> usize {
        self.inliers.len()
    }

    pub fn inlier_ratio(&self) -> f64 {
        if self.num_putative == 0 {
            0.0
        } else {
            self.inliers.len() as f64 / self.num_putative as f64
        }
    }
}

/// Sparse undirected graph over images with adjacency lists keyed by image index.
///
/// Edges keep their orientation `(i1, i2)` because the payload is directional.
#[derive(Debug, Clone)]
pub struct ViewGraph<E> {
    num_nodes: usize,
    edges: Vec<(usize, usize, E)>,
    adjacency: Vec<Vec<usize>>,
}

impl<E> ViewGraph<E> {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            edges: Vec::new(),
            adjacency: vec![Vec::new(); num_nodes],
        }
    }

    /// Add an oriented edge and return its index.
    ///
    /// # Panics
    /// If either endpoint is out of range or the edge is a self-loop.
    pub fn add_edge(&mut self, i1: usize, i2: usize, payload: E) -> usize {
        assert!(i1 < self.num_nodes && i2 < self.num_nodes && i1 != i2);
        let idx = self.edges.len();
        self.edges.push((i1, i2, payload));
        self.adjacency[i1].push(idx);
        self.adjacency[i2].push(idx);
        idx
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> &[(usize, usize, E)] {
        &self.edges
    }

    pub fn edge(&self, idx: usize) -> &(usize, usize, E) {
        &self.edges[idx]
    }

    /// `(neighbour, edge index)` pairs incident to `node`.
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.adjacency[node].iter().map(move |&e| {
            let (a, b, _) = &self.edges[e];
            (if *a == node { *b } else { *a }, e)
        })
    }

    /// Edge index joining `a` and `b` in either orientation.
    pub fn find_edge(&self, a: usize, b: usize) -> Option<usize> {
        self.adjacency[a].iter().copied().find(|&e| {
            let (x, y, _) = &self.edges[e];
            (*x == a && *y == b) || (*x == b && *y == a)
        })
    }

    /// Connected components with at least one edge, each sorted ascending.
    ///
    /// Components are ordered by size (largest first), then by smallest node.
    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let mut visited = vec![false; self.num_nodes];
        let mut components = Vec::new();
        for start in 0..self.num_nodes {
            if visited[start] || self.adjacency[start].is_empty() {
                continue;
            }
            let mut comp = Vec::new();
            let mut queue = VecDeque::from([start]);
            visited[start] = true;
            while let Some(n) = queue.pop_front() {
                comp.push(n);
                for (m, _) in self.neighbors(n) {
                    if !visited[m] {
                        visited[m] = true;
                        queue.push_back(m);
                    }
                }
            }
            comp.sort_unstable();
            components.push(comp);
        }
        components.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));
        components
    }

    /// Nodes without any incident edge.
    pub fn isolated_nodes(&self) -> Vec<usize> {
        (0..self.num_nodes)
            .filter(|&n| self.adjacency[n].is_empty())
            .collect()
    }

    /// Keep only the edges for which `keep(edge_index, edge)` holds.
    pub fn filter_edges<F>(&self, mut keep: F) -> Self
    where
        E: Clone,
        F: FnMut(usize, &(usize, usize, E)) -> bool,
    {
        let mut out = Self::new(self.num_nodes);
        for (idx, edge) in self.edges.iter().enumerate() {
            if keep(idx, edge) {
                out.add_edge(edge.0, edge.1, edge.2.clone());
            }
        }
        out
    }

    /// Graph with the same topology and transformed payloads.
    pub fn map_edges<F, T>(&self, mut f: F) -> ViewGraph<T>
    where
        F: FnMut(&E) -> T,
    {
        ViewGraph {
            num_nodes: self.num_nodes,
            edges: self.edges.iter().map(|(a, b, e)| (*a, *b, f(e))).collect(),
            adjacency: self.adjacency.clone(),
        }
    }

    /// Triangles `(a, b, c)` with `a < b < c`, as edge-index triples `(ab, bc, ac)`.
    pub fn triangles(&self) -> Vec<[usize; 3]> {
        let mut out = Vec::new();
        for a in 0..self.num_nodes {
            for (b, e_ab) in self.neighbors(a) {
                if b <= a {
                    continue;
                }
                for (c, e_bc) in self.neighbors(b) {
                    if c <= b {
                        continue;
                    }
                    if let Some(e_ac) = self.find_edge(a, c) {
                        out.push([e_ab, e_bc, e_ac]);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_and_isolated_nodes() {
        let mut g = ViewGraph::new(7);
        g.add_edge(0, 1, ());
        g.add_edge(1, 2, ());
        g.add_edge(4, 5, ());
        g.add_edge(5, 6, ());
        g.add_edge(6, 4, ());
        let comps = g.connected_components();
        assert_eq!(comps, vec![vec![0, 1, 2], vec![4, 5, 6]]);
        assert_eq!(g.isolated_nodes(), vec![3]);
        assert_eq!(g.triangles().len(), 1);
        assert_eq!(g.find_edge(4, 6), Some(5));
    }

    #[test]
    fn filtering_keeps_orientation() {
        let mut g = ViewGraph::new(3);
        g.add_edge(0, 1, 10);
        g.add_edge(2, 1, 20);
        let f = g.filter_edges(|_, (_, _, w)| *w > 15);
        assert_eq!(f.num_edges(), 1);
        assert_eq!(f.edge(0), &(2, 1, 20));
        assert_eq!(f.isolated_nodes(), vec![0]);
    }
}
