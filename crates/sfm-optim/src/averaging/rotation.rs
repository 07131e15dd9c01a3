//! Rotation averaging.
//!
//! [`ShonanRotationAveraging`] lifts every rotation to a `p x 3` Stiefel
//! block, minimises the chordal cost with block-coordinate descent and
//! Cauchy reweighting, rounds back to SO(3) through the dominant 3D
//! subspace, and finally polishes the result with a robust
//! Levenberg-Marquardt refinement.

use crate::backend::{solve_with_backend, BackendSolveOptions};
use crate::ir::{FactorKind, FixedMask, ManifoldKind, ProblemIR, RobustLoss};
use crate::params::pose_se3::{quat_dvec_to_rot3, rot3_to_quat_array, rot3_to_quat_dvec};
use crate::robust::RobustKernel;
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfm_core::{project_to_so3, Mat3, Real, Rot3, ViewGraph};
use std::collections::HashMap;

/// Relative rotation `i2Ri1` of a view-graph edge with its confidence weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationMeasurement {
    pub i2_r_i1: Rot3,
    pub weight: Real,
}

impl RotationMeasurement {
    pub fn new(i2_r_i1: Rot3) -> Self {
        Self {
            i2_r_i1,
            weight: 1.0,
        }
    }
}

/// Absolute rotations `wRi`, one gauge per connected component.
#[derive(Debug, Clone, Default)]
pub struct RotationAveragingResult {
    /// `None` for images without any edge.
    pub rotations: Vec<Option<Rot3>>,
    /// Components as sorted node lists; the first node of each has identity rotation.
    pub components: Vec<Vec<usize>>,
    pub converged: bool,
    pub iterations: usize,
}

/// Strategy interface for the rotation averaging stage.
pub trait RotationAveraging: Send + Sync {
    fn name(&self) -> &'static str;

    fn average(&self, graph: &ViewGraph<RotationMeasurement>) -> Result<RotationAveragingResult>;
}

/// Options of the lifted rotation averaging solver.
#[derive(Debug, Clone)]
pub struct ShonanOptions {
    /// Row dimension `p >= 3` of the lifted Stiefel blocks.
    pub lifting_dim: usize,
    /// Block-coordinate sweeps per reweighting round.
    pub max_iters: usize,
    /// Largest block change (Frobenius) that counts as converged.
    pub tolerance: Real,
    /// Cauchy scale of the edge reweighting, degrees.
    pub robust_scale_deg: Real,
    pub irls_rounds: usize,
    /// Run the robust manifold refinement after rounding.
    pub refine: bool,
    pub seed: u64,
    pub solve: BackendSolveOptions,
}

impl Default for ShonanOptions {
    fn default() -> Self {
        Self {
            lifting_dim: 5,
            max_iters: 500,
            tolerance: 1e-10,
            robust_scale_deg: 5.0,
            irls_rounds: 10,
            refine: true,
            seed: 7,
            solve: BackendSolveOptions::default(),
        }
    }
}

/// Lifted rotation averaging with robust reweighting and local refinement.
#[derive(Debug, Clone, Default)]
pub struct ShonanRotationAveraging {
    pub options: ShonanOptions,
}

impl ShonanRotationAveraging {
    pub fn new(options: ShonanOptions) -> Self {
        Self { options }
    }
}

/// Chains relative rotations along a breadth-first spanning tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanningTreeRotationAveraging;

fn to_dmatrix(r: &Rot3) -> DMatrix<Real> {
    let m = r.matrix();
    DMatrix::from_fn(3, 3, |i, j| m[(i, j)])
}

/// Orthonormal factor `U Vᵀ` of `b` (p x 3), or `None` if `b` is rank deficient.
fn polar(b: &DMatrix<Real>) -> Option<DMatrix<Real>> {
    let svd = b.clone().svd(true, true);
    let max_sv = svd.singular_values.max();
    if max_sv.is_nan() || max_sv <= 1e-12 || svd.singular_values.min() <= 1e-12 * max_sv {
        return None;
    }
    Some(svd.u? * svd.v_t?)
}

fn random_stiefel(p: usize, rng: &mut StdRng) -> DMatrix<Real> {
    loop {
        let m = DMatrix::from_fn(p, 3, |_, _| rng.random_range(-1.0..1.0));
        if let Some(y) = polar(&m) {
            return y;
        }
    }
}

/// Edge residual angle of `wRi1 ≈ wRi2 * i2Ri1`.
fn edge_error(r1: &Rot3, r2: &Rot3, rel: &Rot3) -> Real {
    (r2 * rel).angle_to(r1)
}

/// Rotations of one component with the first node as identity, by BFS chaining.
fn chain_component(
    graph: &ViewGraph<RotationMeasurement>,
    component: &[usize],
    out: &mut [Option<Rot3>],
) {
    let anchor = component[0];
    out[anchor] = Some(Rot3::identity());
    let mut queue = std::collections::VecDeque::from([anchor]);
    while let Some(node) = queue.pop_front() {
        let Some(r_node) = out[node] else { continue };
        for (nbr, e) in graph.neighbors(node) {
            if out[nbr].is_some() {
                continue;
            }
            let (i1, _, m) = graph.edge(e);
            // wRi1 = wRi2 * i2Ri1
            let r_nbr = if *i1 == node {
                r_node * m.i2_r_i1.inverse()
            } else {
                r_node * m.i2_r_i1
            };
            out[nbr] = Some(r_nbr);
            queue.push_back(nbr);
        }
    }
}

impl RotationAveraging for SpanningTreeRotationAveraging {
    fn name(&self) -> &'static str {
        "spanning_tree"
    }

    fn average(&self, graph: &ViewGraph<RotationMeasurement>) -> Result<RotationAveragingResult> {
        let components = graph.connected_components();
        let mut rotations = vec![None; graph.num_nodes()];
        for component in &components {
            chain_component(graph, component, &mut rotations);
        }
        Ok(RotationAveragingResult {
            rotations,
            components,
            converged: true,
            iterations: 0,
        })
    }
}

struct ComponentSolution {
    rotations: Vec<Rot3>,
    converged: bool,
    iterations: usize,
}

impl ShonanRotationAveraging {
    /// Lifted block-coordinate descent with Cauchy reweighting for one component.
    fn solve_component(
        &self,
        graph: &ViewGraph<RotationMeasurement>,
        component: &[usize],
        edges: &[usize],
        rng: &mut StdRng,
    ) -> Result<ComponentSolution> {
        let opts = &self.options;
        let p = opts.lifting_dim.max(3);
        let local: HashMap<usize, usize> = component.iter().enumerate().map(|(k, n)| (*n, k)).collect();
        let n = component.len();

        let rel: Vec<DMatrix<Real>> = edges.iter().map(|&e| to_dmatrix(&graph.edge(e).2.i2_r_i1)).collect();
        let rel_t: Vec<DMatrix<Real>> = rel.iter().map(|m| m.transpose()).collect();
        let ends: Vec<(usize, usize)> = edges
            .iter()
            .map(|&e| {
                let (a, b, _) = graph.edge(e);
                (local[a], local[b])
            })
            .collect();
        let base_w: Vec<Real> = edges.iter().map(|&e| graph.edge(e).2.weight.max(0.0)).collect();

        let mut incident: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (k, (a, b)) in ends.iter().enumerate() {
            incident[*a].push(k);
            incident[*b].push(k);
        }

        let mut ys: Vec<DMatrix<Real>> = (0..n).map(|_| random_stiefel(p, rng)).collect();
        let mut weights = base_w.clone();
        let kernel = RobustKernel::Cauchy {
            c: opts.robust_scale_deg.to_radians(),
        };

        let mut total_sweeps = 0;
        let mut inner_converged = false;
        for round in 0..opts.irls_rounds.max(1) {
            inner_converged = false;
            for _ in 0..opts.max_iters {
                total_sweeps += 1;
                let mut max_change: Real = 0.0;
                for node in 0..n {
                    let mut b = DMatrix::zeros(p, 3);
                    for &k in &incident[node] {
                        let (a, c) = ends[k];
                        // Y_a ≈ Y_c * R  (a = i1, c = i2)
                        if a == node {
                            b += weights[k] * (&ys[c] * &rel[k]);
                        } else {
                            b += weights[k] * (&ys[a] * &rel_t[k]);
                        }
                    }
                    if let Some(y) = polar(&b) {
                        max_change = max_change.max((&y - &ys[node]).norm());
                        ys[node] = y;
                    }
                }
                if max_change < opts.tolerance {
                    inner_converged = true;
                    break;
                }
            }

            let rotations = round_to_so3(&ys)?;
            let mut max_w_change: Real = 0.0;
            for (k, (a, c)) in ends.iter().enumerate() {
                let err = edge_error(&rotations[*a], &rotations[*c], &graph.edge(edges[k]).2.i2_r_i1);
                let w = base_w[k] * kernel.weight(err * err);
                max_w_change = max_w_change.max((w - weights[k]).abs());
                weights[k] = w;
            }
            debug!(
                "rotation averaging round {}: {} sweeps so far, max weight change {:.3e}",
                round, total_sweeps, max_w_change
            );
            if max_w_change < 1e-6 {
                break;
            }
        }

        let mut rotations = round_to_so3(&ys)?;
        let anchor_inv = rotations[0].inverse();
        for r in rotations.iter_mut() {
            *r = anchor_inv * *r;
        }
        Ok(ComponentSolution {
            rotations,
            converged: inner_converged,
            iterations: total_sweeps,
        })
    }

    /// Robust manifold refinement with the first node held fixed.
    fn refine_component(
        &self,
        graph: &ViewGraph<RotationMeasurement>,
        component: &[usize],
        edges: &[usize],
        initial: &[Rot3],
    ) -> Result<(Vec<Rot3>, bool)> {
        let mut ir = ProblemIR::new();
        let mut values = HashMap::new();
        let mut ids = HashMap::new();
        for (k, node) in component.iter().enumerate() {
            let name = format!("rot/{node}");
            let fixed = if k == 0 {
                FixedMask::all_fixed(4)
            } else {
                FixedMask::all_free()
            };
            ids.insert(*node, ir.add_param_block(&name, 4, ManifoldKind::SO3, fixed));
            values.insert(name, rot3_to_quat_dvec(&initial[k]));
        }
        let loss = RobustLoss::Cauchy {
            scale: self.options.robust_scale_deg.to_radians().sin(),
        };
        for &e in edges {
            let (i1, i2, m) = graph.edge(e);
            ir.add_residual_block(
                vec![ids[i1], ids[i2]],
                FactorKind::RelativeRotation {
                    rel: rot3_to_quat_array(&m.i2_r_i1),
                    w: m.weight.max(0.0),
                },
                loss,
            );
        }

        let solution = solve_with_backend(&ir, &values, &self.options.solve)?;
        let rotations = component
            .iter()
            .map(|node| {
                let v = solution
                    .params
                    .get(&format!("rot/{node}"))
                    .ok_or_else(|| anyhow!("refinement lost rotation {}", node))?;
                quat_dvec_to_rot3(v.as_view())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((rotations, solution.converged))
    }
}

/// Rounds lifted blocks to rotations through the dominant 3D row subspace.
fn round_to_so3(ys: &[DMatrix<Real>]) -> Result<Vec<Rot3>> {
    let p = ys[0].nrows();
    let mut stacked = DMatrix::zeros(p, 3 * ys.len());
    for (k, y) in ys.iter().enumerate() {
        stacked.columns_mut(3 * k, 3).copy_from(y);
    }
    let svd = stacked.svd(true, false);
    let u = svd.u.ok_or_else(|| anyhow!("svd failed while rounding rotations"))?;
    let u3 = u.columns(0, 3).into_owned();

    let blocks: Vec<Mat3> = ys
        .iter()
        .map(|y| {
            let m = u3.transpose() * y;
            Mat3::from_fn(|i, j| m[(i, j)])
        })
        .collect();
    let negative = blocks.iter().filter(|m| m.determinant() < 0.0).count();
    let flip = Mat3::from_diagonal(&nalgebra::Vector3::new(1.0, 1.0, -1.0));

    blocks
        .into_iter()
        .map(|m| {
            let m = if 2 * negative > ys.len() { flip * m } else { m };
            project_to_so3(&m).ok_or_else(|| anyhow!("failed to project block onto SO(3)"))
        })
        .collect()
}

impl RotationAveraging for ShonanRotationAveraging {
    fn name(&self) -> &'static str {
        "shonan"
    }

    fn average(&self, graph: &ViewGraph<RotationMeasurement>) -> Result<RotationAveragingResult> {
        let components = graph.connected_components();
        let mut rotations = vec![None; graph.num_nodes()];
        let mut converged = true;
        let mut iterations = 0;
        let mut rng = StdRng::seed_from_u64(self.options.seed);

        for component in &components {
            let mut edges: Vec<usize> = component
                .iter()
                .flat_map(|n| graph.neighbors(*n).map(|(_, e)| e))
                .collect();
            edges.sort_unstable();
            edges.dedup();

            let lifted = self.solve_component(graph, component, &edges, &mut rng)?;
            iterations += lifted.iterations;
            let mut comp_converged = lifted.converged;
            let mut solved = lifted.rotations;

            if self.options.refine {
                let (refined, ok) = self.refine_component(graph, component, &edges, &solved)?;
                solved = refined;
                comp_converged &= ok;
            }
            if !comp_converged {
                warn!(
                    "rotation averaging did not converge on component of {} images",
                    component.len()
                );
            }
            converged &= comp_converged;
            for (node, r) in component.iter().zip(solved) {
                rotations[*node] = Some(r);
            }
        }

        info!(
            "rotation averaging: {} components, {} of {} images registered",
            components.len(),
            rotations.iter().filter(|r| r.is_some()).count(),
            graph.num_nodes()
        );
        Ok(RotationAveragingResult {
            rotations,
            components,
            converged,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::align_rotations;

    fn random_rotations(n: usize, seed: u64) -> Vec<Rot3> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Rot3::from_euler_angles(
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                )
            })
            .collect()
    }

    fn measurement(gt: &[Rot3], i1: usize, i2: usize) -> RotationMeasurement {
        RotationMeasurement::new(gt[i2].inverse() * gt[i1])
    }

    fn max_error(estimated: &[Option<Rot3>], gt: &[Rot3]) -> Real {
        let est: Vec<Rot3> = estimated.iter().map(|r| r.unwrap()).collect();
        let aligned = align_rotations(&est, gt);
        aligned
            .iter()
            .zip(gt)
            .map(|(a, b)| a.angle_to(b))
            .fold(0.0, Real::max)
    }

    #[test]
    fn spanning_tree_is_exact_without_noise() {
        let gt = random_rotations(5, 1);
        let mut g = ViewGraph::new(5);
        for (a, b) in [(0, 1), (1, 2), (0, 3), (3, 4), (2, 4)] {
            g.add_edge(a, b, measurement(&gt, a, b));
        }
        let res = SpanningTreeRotationAveraging.average(&g).unwrap();
        assert!(max_error(&res.rotations, &gt) < 1e-9);
        assert_eq!(res.rotations[0].unwrap().angle(), 0.0);
    }

    #[test]
    fn lifted_solver_recovers_clean_graph() {
        let gt = random_rotations(6, 3);
        let mut g = ViewGraph::new(6);
        for i in 0..6 {
            for j in (i + 1)..6 {
                g.add_edge(i, j, measurement(&gt, i, j));
            }
        }
        let res = ShonanRotationAveraging::default().average(&g).unwrap();
        assert!(res.converged);
        let err = max_error(&res.rotations, &gt);
        assert!(err < 1e-6, "max error {err}");
    }

    #[test]
    fn disconnected_components_are_anchored_separately() {
        let gt = random_rotations(7, 5);
        let mut g = ViewGraph::new(7);
        for (a, b) in [(0, 1), (1, 2), (0, 2), (3, 4), (4, 5), (3, 5)] {
            g.add_edge(a, b, measurement(&gt, a, b));
        }
        let res = ShonanRotationAveraging::default().average(&g).unwrap();
        assert_eq!(res.components.len(), 2);
        assert!(res.rotations[6].is_none());
        assert!(res.rotations[0].unwrap().angle() < 1e-9);
        assert!(res.rotations[3].unwrap().angle() < 1e-9);
        for comp in &res.components {
            let est: Vec<Option<Rot3>> = comp.iter().map(|n| res.rotations[*n]).collect();
            let reference: Vec<Rot3> = comp.iter().map(|n| gt[*n]).collect();
            assert!(max_error(&est, &reference) < 1e-6);
        }
    }
}
