//! Backend adapters that compile the IR into solver-specific problems.
//!
//! Backends translate the IR into solver-native graphs, apply manifolds and
//! fixed parameters, and return the solved parameter map.

mod tiny_solver_backend;

use anyhow::{anyhow, ensure, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::factors::prior::baseline_prior_residual_generic;
use crate::factors::reprojection::reproj_residual_generic;
use crate::factors::rotation::relative_rotation_residual_generic;
use crate::ir::{FactorKind, ProblemIR, ResidualBlock, RobustLoss};
use crate::robust::RobustKernel;

pub use tiny_solver_backend::TinySolverBackend;

/// Backend-agnostic solver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSolveOptions {
    /// Maximum number of iterations for the optimizer.
    pub max_iters: usize,
    /// Verbosity level (backend-specific).
    pub verbosity: usize,
    /// Optional linear solver selection.
    pub linear_solver: Option<LinearSolverKind>,
    /// Absolute error decrease threshold for early termination.
    pub min_abs_decrease: Option<f64>,
    /// Relative error decrease threshold for early termination.
    pub min_rel_decrease: Option<f64>,
    /// Error threshold for early termination.
    pub min_error: Option<f64>,
    /// Relative cost decrease of one extra iteration below which the solve
    /// counts as converged.
    pub convergence_rel_tol: f64,
}

impl Default for BackendSolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 100,
            verbosity: 0,
            linear_solver: Some(LinearSolverKind::SparseCholesky),
            min_abs_decrease: Some(1e-5),
            min_rel_decrease: Some(1e-5),
            min_error: Some(1e-10),
            convergence_rel_tol: 1e-4,
        }
    }
}

/// Linear solver selection (backend-agnostic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolverKind {
    /// Sparse Cholesky decomposition.
    SparseCholesky,
    /// Sparse QR decomposition.
    SparseQR,
}

/// Solver output from a backend.
///
/// The `params` map uses the IR parameter block names.
#[derive(Debug, Clone)]
pub struct BackendSolution {
    /// Optimized parameter vectors keyed by block name.
    pub params: HashMap<String, DVector<f64>>,
    /// Robustified cost at the initial values.
    pub initial_cost: f64,
    /// Robustified cost at the returned values.
    pub final_cost: f64,
    /// `false` when the solver failed or the cost was still dropping.
    pub converged: bool,
}

/// Backend interface implemented by solver adapters.
pub trait OptimBackend {
    /// Solve a compiled IR with the provided initial parameters.
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution>;
}

/// Solve a problem with the default backend.
pub fn solve_with_backend(
    ir: &ProblemIR,
    initial: &HashMap<String, DVector<f64>>,
    opts: &BackendSolveOptions,
) -> Result<BackendSolution> {
    TinySolverBackend.solve(ir, initial, opts)
}

fn kernel_for(loss: RobustLoss) -> RobustKernel {
    match loss {
        RobustLoss::None => RobustKernel::None,
        RobustLoss::Huber { scale } => RobustKernel::Huber { delta: scale },
        RobustLoss::Cauchy { scale } => RobustKernel::Cauchy { c: scale },
    }
}

/// Evaluates one residual block in `f64`.
pub fn evaluate_residual(block: &ResidualBlock, params: &[&DVector<f64>]) -> Result<DVector<f64>> {
    ensure!(
        params.len() == block.params.len(),
        "residual expects {} params, got {}",
        block.params.len(),
        params.len()
    );
    let r = match &block.factor {
        FactorKind::ReprojPoint { uv, w } => {
            let r = reproj_residual_generic(
                params[0].as_view(),
                params[1].as_view(),
                params[2].as_view(),
                *uv,
                *w,
            );
            DVector::from_column_slice(r.as_slice())
        }
        FactorKind::RelativeRotation { rel, w } => {
            let r = relative_rotation_residual_generic(
                params[0].as_view(),
                params[1].as_view(),
                *rel,
                *w,
            );
            DVector::from_column_slice(r.as_slice())
        }
        FactorKind::BaselinePrior {
            anchor,
            distance,
            w,
        } => {
            let r = baseline_prior_residual_generic(params[0].as_view(), *anchor, *distance, *w);
            DVector::from_column_slice(r.as_slice())
        }
    };
    Ok(r)
}

/// Robustified cost `0.5 * Σ rho(|r|²)` of all residual blocks.
pub fn evaluate_cost(ir: &ProblemIR, values: &HashMap<String, DVector<f64>>) -> Result<f64> {
    let mut cost = 0.0;
    for block in &ir.residuals {
        let params = block
            .params
            .iter()
            .map(|id| {
                let name = &ir.params[id.0].name;
                values
                    .get(name)
                    .ok_or_else(|| anyhow!("missing value for parameter {}", name))
            })
            .collect::<Result<Vec<_>>>()?;
        let r = evaluate_residual(block, &params)?;
        let (rho, _) = kernel_for(block.loss).rho_and_weight(r.norm_squared());
        cost += rho;
    }
    Ok(0.5 * cost)
}
