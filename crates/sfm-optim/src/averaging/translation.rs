//! Translation averaging from relative directions and absolute rotations.
//!
//! Every edge `(i1, i2)` carries the unit direction of `i2ti1`. Rotated into
//! the world frame it is parallel to `c1 - c2`. Outlier edges are found with
//! the 1DSfM test: project all directions onto random axes, order the cameras
//! along each axis with a greedy feedback-arc-set heuristic and flag edges that
//! disagree with the ordering too often. The centres then solve
//! `min Σ w_e |(c1 - c2) x d_e|²` with reweighting.
//!
//! Directions only fix centres up to one scale per parallel-rigid group of
//! cameras, so the solve runs per group: edges that share a triangle are
//! merged, and a camera whose edges all hang off a group by a single path
//! is left unregistered.

use crate::robust::RobustKernel;
use anyhow::{anyhow, Result};
use disjoint_sets::UnionFind;
use log::{debug, info, warn};
use nalgebra::{DMatrix, SymmetricEigen, Unit};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfm_core::{skew, Real, Rot3, Vec3, ViewGraph};
use std::collections::{BTreeSet, HashMap};

/// Camera centres, one gauge per parallel-rigid component.
#[derive(Debug, Clone, Default)]
pub struct TranslationAveragingResult {
    /// World camera centres; `None` for unregistered cameras.
    pub positions: Vec<Option<Vec3>>,
    /// Cameras outside every rigid component: no usable edge touches them,
    /// or their edges leave the relative scale undetermined.
    pub unregistered: Vec<usize>,
    /// Input edges rejected as outliers.
    pub outlier_edges: Vec<usize>,
    /// Parallel-rigid camera groups, largest first, nodes sorted.
    pub components: Vec<Vec<usize>>,
    pub converged: bool,
}

/// Strategy interface for the translation averaging stage.
pub trait TranslationAveraging: Send + Sync {
    fn name(&self) -> &'static str;

    /// `graph` payloads are unit directions of `i2ti1`; `rotations` are `wRi`.
    fn average(
        &self,
        graph: &ViewGraph<Unit<Vec3>>,
        rotations: &[Option<Rot3>],
    ) -> Result<TranslationAveragingResult>;
}

#[derive(Debug, Clone)]
pub struct OneDSfmOptions {
    /// Random 1D projections used by the outlier test.
    pub num_projections: usize,
    /// Fraction of projections an edge may disagree with before it is rejected.
    pub outlier_threshold: Real,
    pub irls_iters: usize,
    /// Huber threshold on `sin` of the direction error.
    pub huber_scale: Real,
    pub tolerance: Real,
    pub seed: u64,
}

impl Default for OneDSfmOptions {
    fn default() -> Self {
        Self {
            num_projections: 48,
            outlier_threshold: 0.1,
            irls_iters: 10,
            huber_scale: 0.05,
            tolerance: 1e-8,
            seed: 11,
        }
    }
}

/// 1DSfM outlier rejection followed by the reweighted linear solve.
#[derive(Debug, Clone, Default)]
pub struct OneDSfmTranslationAveraging {
    pub options: OneDSfmOptions,
}

impl OneDSfmTranslationAveraging {
    pub fn new(options: OneDSfmOptions) -> Self {
        Self { options }
    }
}

/// Reweighted linear solve over all edges, without outlier rejection.
#[derive(Debug, Clone, Default)]
pub struct LinearTranslationAveraging {
    pub options: OneDSfmOptions,
}

/// World direction of `c1 - c2` for every edge with both rotations known.
fn world_directions(
    graph: &ViewGraph<Unit<Vec3>>,
    rotations: &[Option<Rot3>],
) -> ViewGraph<Option<Vec3>> {
    let mut out = ViewGraph::new(graph.num_nodes());
    for (i1, i2, dir) in graph.edges() {
        let d = match (rotations.get(*i1).copied().flatten(), rotations.get(*i2).copied().flatten()) {
            (Some(_), Some(w_r_i2)) => Some(w_r_i2 * dir.into_inner()),
            _ => None,
        };
        out.add_edge(*i1, *i2, d);
    }
    out
}

fn random_unit(rng: &mut StdRng) -> Vec3 {
    loop {
        let v = Vec3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        );
        let n = v.norm();
        if n > 0.1 && n <= 1.0 {
            return v / n;
        }
    }
}

/// Greedy ordering of a weighted directed graph; `arcs` are `(from, to, w)`
/// meaning `from` should precede `to`. Returns the rank of every node.
fn greedy_mfas_order(n: usize, arcs: &[(usize, usize, Real)]) -> Vec<usize> {
    let mut in_w = vec![0.0; n];
    let mut out_w = vec![0.0; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (k, (a, b, w)) in arcs.iter().enumerate() {
        out_w[*a] += w;
        in_w[*b] += w;
        adj[*a].push(k);
        adj[*b].push(k);
    }
    let mut rank = vec![usize::MAX; n];
    for next in 0..n {
        // Sources first, otherwise the node with the best out/in balance.
        let pick = (0..n)
            .filter(|&v| rank[v] == usize::MAX)
            .min_by(|&a, &b| {
                let score = |v: usize| {
                    if in_w[v] <= 1e-12 {
                        -1.0 - out_w[v]
                    } else {
                        (in_w[v] + 1e-9) / (out_w[v] + 1e-9)
                    }
                };
                score(a).total_cmp(&score(b))
            });
        let Some(v) = pick else { break };
        rank[v] = next;
        for &k in &adj[v] {
            let (a, b, w) = arcs[k];
            let other = if a == v { b } else { a };
            if rank[other] != usize::MAX {
                continue;
            }
            if a == v {
                in_w[b] -= w;
            } else {
                out_w[a] -= w;
            }
        }
    }
    rank
}

/// Flags edges (by index into `edges`) that disagree with too many 1D orderings.
fn one_d_sfm_outliers(
    n: usize,
    edges: &[(usize, usize, Vec3)],
    opts: &OneDSfmOptions,
    rng: &mut StdRng,
) -> Vec<bool> {
    let mut broken = vec![0usize; edges.len()];
    let projections = opts.num_projections.max(1);
    for _ in 0..projections {
        let axis = random_unit(rng);
        // d ∝ c1 - c2: a positive projection puts c2 before c1 along the axis.
        let arcs: Vec<(usize, usize, Real)> = edges
            .iter()
            .map(|(a, b, d)| {
                let y = d.dot(&axis);
                if y >= 0.0 {
                    (*b, *a, y)
                } else {
                    (*a, *b, -y)
                }
            })
            .collect();
        let rank = greedy_mfas_order(n, &arcs);
        for (k, (from, to, w)) in arcs.iter().enumerate() {
            if *w > 1e-9 && rank[*from] > rank[*to] {
                broken[k] += 1;
            }
        }
    }
    broken
        .iter()
        .map(|b| (*b as Real) / (projections as Real) > opts.outlier_threshold)
        .collect()
}

/// Smallest eigenvector of the cross-product system with node 0 at the origin.
fn solve_centres(n: usize, edges: &[(usize, usize, Vec3)], weights: &[Real]) -> Result<Vec<Vec3>> {
    if n < 2 {
        return Ok(vec![Vec3::zeros(); n]);
    }
    let dim = 3 * (n - 1);
    let mut a = DMatrix::<Real>::zeros(dim, dim);
    for ((i, j, d), w) in edges.iter().zip(weights) {
        let s = skew(d);
        let block = (s.transpose() * s) * *w;
        // residual = S (c_i - c_j); node 0 is fixed and drops out
        let idx = |v: usize| (v > 0).then(|| 3 * (v - 1));
        for (u, su) in [(idx(*i), 1.0), (idx(*j), -1.0)] {
            for (v, sv) in [(idx(*i), 1.0), (idx(*j), -1.0)] {
                if let (Some(u), Some(v)) = (u, v) {
                    let mut view = a.fixed_view_mut::<3, 3>(u, v);
                    view += block * (su * sv);
                }
            }
        }
    }
    let eig = SymmetricEigen::new(a);
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or_else(|| anyhow!("empty translation system"))?;
    let x = eig.eigenvectors.column(min_idx);

    let mut centres = vec![Vec3::zeros(); n];
    for v in 1..n {
        centres[v] = Vec3::new(x[3 * (v - 1)], x[3 * (v - 1) + 1], x[3 * (v - 1) + 2]);
    }

    let agreement: Real = edges
        .iter()
        .map(|(i, j, d)| (centres[*i] - centres[*j]).dot(d))
        .sum();
    let sign = if agreement < 0.0 { -1.0 } else { 1.0 };
    let mean_len = edges
        .iter()
        .map(|(i, j, _)| (centres[*i] - centres[*j]).norm())
        .sum::<Real>()
        / edges.len().max(1) as Real;
    if mean_len <= 1e-12 {
        return Err(anyhow!("translation solve collapsed to a point"));
    }
    for c in centres.iter_mut() {
        *c *= sign / mean_len;
    }
    Ok(centres)
}

/// Camera groups whose centres the edges among them fix up to a single scale.
///
/// Edges that share a triangle are merged; a lone edge is rigid by itself.
/// Groups are peeled largest first so each camera lands in at most one.
/// Chordless cycles are split even though some of them are rigid.
fn rigid_components<E>(graph: &ViewGraph<E>) -> Vec<Vec<usize>> {
    let triangles = graph.triangles();
    let mut assigned = vec![false; graph.num_nodes()];
    let mut out = Vec::new();
    loop {
        let live: Vec<usize> = (0..graph.num_edges())
            .filter(|&k| {
                let (a, b, _) = graph.edge(k);
                !assigned[*a] && !assigned[*b]
            })
            .collect();
        if live.is_empty() {
            break;
        }
        let slot: HashMap<usize, usize> = live.iter().enumerate().map(|(s, k)| (*k, s)).collect();
        let mut uf = UnionFind::<usize>::new(live.len());
        for [ab, bc, ac] in &triangles {
            if let (Some(&x), Some(&y), Some(&z)) = (slot.get(ab), slot.get(bc), slot.get(ac)) {
                uf.union(x, y);
                uf.union(x, z);
            }
        }

        let mut groups: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        for (s, &k) in live.iter().enumerate() {
            let (a, b, _) = graph.edge(k);
            let group = groups.entry(uf.find(s)).or_default();
            group.insert(*a);
            group.insert(*b);
        }
        // Ties go to the lexicographically smallest camera set.
        let Some(best) = groups
            .into_values()
            .max_by(|x, y| x.len().cmp(&y.len()).then_with(|| y.iter().cmp(x.iter())))
        else {
            break;
        };
        for v in &best {
            assigned[*v] = true;
        }
        out.push(best.into_iter().collect());
    }
    out
}

fn average_translations(
    graph: &ViewGraph<Unit<Vec3>>,
    rotations: &[Option<Rot3>],
    opts: &OneDSfmOptions,
    reject_outliers: bool,
) -> Result<TranslationAveragingResult> {
    let directions = world_directions(graph, rotations);
    let usable = directions.filter_edges(|_, e| e.2.is_some());
    // Original indices of usable edges, in order.
    let mut usable_idx: Vec<usize> = directions
        .edges()
        .iter()
        .enumerate()
        .filter(|(_, e)| e.2.is_some())
        .map(|(k, _)| k)
        .collect();

    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut outlier_edges = Vec::new();
    let mut graph_in = usable;
    if reject_outliers {
        for component in graph_in.connected_components() {
            let local: HashMap<usize, usize> = component.iter().enumerate().map(|(k, n)| (*n, k)).collect();
            let comp_edges: Vec<usize> = (0..graph_in.num_edges())
                .filter(|&k| local.contains_key(&graph_in.edge(k).0))
                .collect();
            let data: Vec<(usize, usize, Vec3)> = comp_edges
                .iter()
                .filter_map(|&k| {
                    let (a, b, d) = graph_in.edge(k);
                    d.map(|d| (local[a], local[b], d))
                })
                .collect();
            let flags = one_d_sfm_outliers(component.len(), &data, opts, &mut rng);
            for (k, flag) in comp_edges.iter().zip(flags) {
                if flag {
                    outlier_edges.push(*k);
                }
            }
        }
        outlier_edges.sort_unstable();
        let rejected = outlier_edges.clone();
        graph_in = graph_in.filter_edges(|k, _| rejected.binary_search(&k).is_err());
        let kept: Vec<usize> = usable_idx
            .iter()
            .enumerate()
            .filter(|(k, _)| rejected.binary_search(k).is_err())
            .map(|(_, orig)| *orig)
            .collect();
        outlier_edges = outlier_edges.iter().map(|k| usable_idx[*k]).collect();
        usable_idx = kept;
        if !outlier_edges.is_empty() {
            debug!("1DSfM rejected edges {:?}", outlier_edges);
        }
    }
    debug_assert_eq!(usable_idx.len(), graph_in.num_edges());

    let components = rigid_components(&graph_in);
    let mut positions = vec![None; graph.num_nodes()];
    let mut converged = true;
    let kernel = RobustKernel::Huber {
        delta: opts.huber_scale,
    };

    for component in &components {
        let local: HashMap<usize, usize> = component.iter().enumerate().map(|(k, n)| (*n, k)).collect();
        let data: Vec<(usize, usize, Vec3)> = graph_in
            .edges()
            .iter()
            .filter(|e| local.contains_key(&e.0) && local.contains_key(&e.1))
            .filter_map(|(a, b, d)| d.map(|d| (local[a], local[b], d)))
            .collect();

        let mut weights = vec![1.0; data.len()];
        let mut centres = solve_centres(component.len(), &data, &weights)?;
        let mut comp_converged = opts.irls_iters == 0;
        for _ in 0..opts.irls_iters {
            for (k, (i, j, d)) in data.iter().enumerate() {
                let diff = centres[*i] - centres[*j];
                let len = diff.norm().max(1e-9);
                let sin = diff.cross(d).norm() / len;
                // 1/len² turns the cross-product residual into an angular one.
                weights[k] = kernel.weight(sin * sin) / (len * len);
            }
            let next = solve_centres(component.len(), &data, &weights)?;
            let change = next
                .iter()
                .zip(&centres)
                .map(|(a, b)| (a - b).norm())
                .fold(0.0, Real::max);
            centres = next;
            if change < opts.tolerance {
                comp_converged = true;
                break;
            }
        }
        if !comp_converged {
            warn!(
                "translation averaging reweighting did not settle on component of {} images",
                component.len()
            );
        }
        converged &= comp_converged;
        for (node, c) in component.iter().zip(centres) {
            positions[*node] = Some(c);
        }
    }

    let unregistered: Vec<usize> = (0..graph.num_nodes())
        .filter(|n| positions[*n].is_none())
        .collect();
    if !unregistered.is_empty() {
        warn!("translation averaging: unregistered cameras {:?}", unregistered);
    }
    info!(
        "translation averaging: {} rigid components, {} outlier edges",
        components.len(),
        outlier_edges.len()
    );

    Ok(TranslationAveragingResult {
        positions,
        unregistered,
        outlier_edges,
        components,
        converged,
    })
}

impl TranslationAveraging for OneDSfmTranslationAveraging {
    fn name(&self) -> &'static str {
        "one_d_sfm"
    }

    fn average(
        &self,
        graph: &ViewGraph<Unit<Vec3>>,
        rotations: &[Option<Rot3>],
    ) -> Result<TranslationAveragingResult> {
        average_translations(graph, rotations, &self.options, true)
    }
}

impl TranslationAveraging for LinearTranslationAveraging {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn average(
        &self,
        graph: &ViewGraph<Unit<Vec3>>,
        rotations: &[Option<Rot3>],
    ) -> Result<TranslationAveragingResult> {
        average_translations(graph, rotations, &self.options, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::synthetic::{circular_rig, look_at};
    use sfm_core::{Iso3, Pt3};

    /// Unit `i2ti1` direction between two camera-to-world poses.
    fn direction(poses: &[Iso3], i1: usize, i2: usize) -> Unit<Vec3> {
        let rel = poses[i2].inverse() * poses[i1];
        Unit::new_normalize(rel.translation.vector)
    }

    fn normalized(centres: &[Vec3]) -> Vec<Vec3> {
        let shifted: Vec<Vec3> = centres.iter().map(|c| c - centres[0]).collect();
        let scale = shifted.iter().map(|c| c.norm()).sum::<Real>();
        shifted.iter().map(|c| c / scale).collect()
    }

    fn assert_matches(result: &TranslationAveragingResult, poses: &[Iso3], tol: Real) {
        let est: Vec<Vec3> = result.positions.iter().map(|p| p.unwrap()).collect();
        let gt: Vec<Vec3> = poses.iter().map(|p| p.translation.vector).collect();
        for (a, b) in normalized(&est).iter().zip(normalized(&gt)) {
            assert!((a - b).norm() < tol, "{a} vs {b}");
        }
    }

    fn full_graph(poses: &[Iso3]) -> ViewGraph<Unit<Vec3>> {
        let mut g = ViewGraph::new(poses.len());
        for i in 0..poses.len() {
            for j in (i + 1)..poses.len() {
                g.add_edge(i, j, direction(poses, i, j));
            }
        }
        g
    }

    fn rig(n: usize) -> Vec<Iso3> {
        let mut poses = circular_rig(n, 6.0, 1.0, std::f64::consts::FRAC_PI_2);
        // A second, lower ring keeps the centres off a single plane.
        poses.push(look_at(&Pt3::new(0.5, -1.5, -7.0), &Pt3::origin(), &Vec3::y()));
        poses
    }

    #[test]
    fn linear_solve_recovers_rig_centres() {
        let poses = rig(5);
        let rotations: Vec<Option<Rot3>> = poses.iter().map(|p| Some(p.rotation.to_rotation_matrix())).collect();
        let res = LinearTranslationAveraging::default()
            .average(&full_graph(&poses), &rotations)
            .unwrap();
        assert!(res.unregistered.is_empty());
        assert_matches(&res, &poses, 1e-6);
    }

    #[test]
    fn one_d_sfm_rejects_flipped_edge() {
        let poses = rig(7);
        let rotations: Vec<Option<Rot3>> = poses.iter().map(|p| Some(p.rotation.to_rotation_matrix())).collect();
        let mut g = ViewGraph::new(poses.len());
        let mut bad = 0;
        for i in 0..poses.len() {
            for j in (i + 1)..poses.len() {
                let d = direction(&poses, i, j);
                if i == 1 && j == 4 {
                    bad = g.add_edge(i, j, Unit::new_unchecked(-d.into_inner()));
                } else {
                    g.add_edge(i, j, d);
                }
            }
        }
        let res = OneDSfmTranslationAveraging::default().average(&g, &rotations).unwrap();
        assert!(res.outlier_edges.contains(&bad));
        assert_matches(&res, &poses, 1e-4);
    }

    #[test]
    fn camera_without_rotation_is_unregistered() {
        let poses = rig(4);
        let mut rotations: Vec<Option<Rot3>> = poses.iter().map(|p| Some(p.rotation.to_rotation_matrix())).collect();
        rotations[2] = None;
        let res = OneDSfmTranslationAveraging::default()
            .average(&full_graph(&poses), &rotations)
            .unwrap();
        assert_eq!(res.unregistered, vec![2]);
        assert!(res.positions[2].is_none());
        assert_eq!(res.components.len(), 1);
    }

    #[test]
    fn pendant_camera_is_left_unregistered() {
        // Triangle 0-1-2 is rigid; camera 3 hangs off camera 2 by one edge and
        // its distance to the triangle is not observable.
        let poses = rig(3);
        let rotations: Vec<Option<Rot3>> = poses.iter().map(|p| Some(p.rotation.to_rotation_matrix())).collect();
        let mut g = ViewGraph::new(4);
        g.add_edge(0, 1, direction(&poses, 0, 1));
        g.add_edge(1, 2, direction(&poses, 1, 2));
        g.add_edge(0, 2, direction(&poses, 0, 2));
        g.add_edge(2, 3, direction(&poses, 2, 3));

        let res = LinearTranslationAveraging::default().average(&g, &rotations).unwrap();
        assert_eq!(res.components, vec![vec![0, 1, 2]]);
        assert_eq!(res.unregistered, vec![3]);
        assert!(res.positions[3].is_none());

        let est: Vec<Vec3> = res.positions[..3].iter().map(|p| p.unwrap()).collect();
        let gt: Vec<Vec3> = poses[..3].iter().map(|p| p.translation.vector).collect();
        for (a, b) in normalized(&est).iter().zip(normalized(&gt)) {
            assert!((a - b).norm() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn chain_without_triangle_splits_into_pairs() {
        let poses = rig(3);
        let rotations: Vec<Option<Rot3>> = poses.iter().map(|p| Some(p.rotation.to_rotation_matrix())).collect();
        let mut g = ViewGraph::new(3);
        g.add_edge(0, 1, direction(&poses, 0, 1));
        g.add_edge(1, 2, direction(&poses, 1, 2));

        let res = LinearTranslationAveraging::default().average(&g, &rotations).unwrap();
        assert_eq!(res.components, vec![vec![0, 1]]);
        assert_eq!(res.unregistered, vec![2]);
    }

    #[test]
    fn triangles_sharing_an_edge_form_one_component() {
        let poses = rig(4);
        let rotations: Vec<Option<Rot3>> = poses.iter().map(|p| Some(p.rotation.to_rotation_matrix())).collect();
        let mut g = ViewGraph::new(poses.len());
        for (i, j) in [(0, 1), (1, 2), (0, 2), (2, 3), (1, 3)] {
            g.add_edge(i, j, direction(&poses, i, j));
        }
        let res = LinearTranslationAveraging::default().average(&g, &rotations).unwrap();
        assert_eq!(res.components, vec![vec![0, 1, 2, 3]]);
        assert_eq!(res.unregistered, vec![4]);
    }

    #[test]
    fn reweighting_cap_reports_unconverged_centres() {
        let poses = rig(6);
        let rotations: Vec<Option<Rot3>> = poses.iter().map(|p| Some(p.rotation.to_rotation_matrix())).collect();
        let tilt = Rot3::from_euler_angles(0.02, -0.01, 0.015);
        let mut g = ViewGraph::new(poses.len());
        for i in 0..poses.len() {
            for j in (i + 1)..poses.len() {
                let d = direction(&poses, i, j);
                let d = if (i + j) % 3 == 0 {
                    Unit::new_normalize(tilt * d.into_inner())
                } else {
                    d
                };
                g.add_edge(i, j, d);
            }
        }
        let averaging = LinearTranslationAveraging {
            options: OneDSfmOptions {
                irls_iters: 1,
                ..OneDSfmOptions::default()
            },
        };

        let res = averaging.average(&g, &rotations).unwrap();
        assert!(!res.converged);
        assert!(res.unregistered.is_empty());
        assert!(res.positions.iter().all(|p| p.is_some()));
    }

    #[test]
    fn greedy_order_respects_acyclic_arcs() {
        let arcs = vec![(2, 0, 1.0), (0, 1, 0.5), (2, 1, 0.2), (1, 3, 2.0)];
        let rank = greedy_mfas_order(4, &arcs);
        for (a, b, _) in arcs {
            assert!(rank[a] < rank[b]);
        }
    }
}
