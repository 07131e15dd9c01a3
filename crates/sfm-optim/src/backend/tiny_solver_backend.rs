use crate::backend::{evaluate_cost, BackendSolution, BackendSolveOptions, LinearSolverKind, OptimBackend};
use crate::factors::prior::baseline_prior_residual_generic;
use crate::factors::reprojection::reproj_residual_generic;
use crate::factors::rotation::relative_rotation_residual_generic;
use crate::ir::{FactorKind, ManifoldKind, ProblemIR, RobustLoss};
use anyhow::{anyhow, ensure, Result};
use log::{debug, warn};
use nalgebra::DVector;
use std::collections::HashMap;
use std::sync::Arc;
use tiny_solver::factors::Factor;
use tiny_solver::loss_functions::{CauchyLoss, HuberLoss, Loss};
use tiny_solver::manifold::se3::SE3Manifold;
use tiny_solver::manifold::so3::QuaternionManifold;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;
use tiny_solver::{linear::sparse::LinearSolverType, LevenbergMarquardtOptimizer};

/// tiny-solver backend adapter.
#[derive(Debug, Clone, Copy)]
pub struct TinySolverBackend;

impl TinySolverBackend {
    fn compile(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
    ) -> Result<(Problem, HashMap<String, DVector<f64>>)> {
        ir.validate()?;

        let mut problem = Problem::new();
        let mut initial_map = HashMap::with_capacity(ir.params.len());

        for param in &ir.params {
            let init = initial.get(&param.name).ok_or_else(|| {
                anyhow!(
                    "initial values missing parameter {} (id {:?})",
                    param.name,
                    param.id
                )
            })?;
            ensure!(
                init.len() == param.dim,
                "initial dimension mismatch for {}: expected {}, got {}",
                param.name,
                param.dim,
                init.len()
            );

            // Fully fixed manifold blocks are held constant without a manifold.
            let mut set_manifold = true;
            match param.manifold {
                ManifoldKind::Euclidean => {}
                ManifoldKind::SE3 => {
                    if !param.fixed.is_empty() {
                        if param.fixed.is_all_fixed(param.dim) {
                            set_manifold = false;
                        } else {
                            return Err(anyhow!(
                                "tiny-solver cannot partially fix SE3 manifold {}",
                                param.name
                            ));
                        }
                    }
                    if set_manifold {
                        problem.set_variable_manifold(&param.name, Arc::new(SE3Manifold));
                    }
                }
                ManifoldKind::SO3 => {
                    if !param.fixed.is_empty() {
                        if param.fixed.is_all_fixed(param.dim) {
                            set_manifold = false;
                        } else {
                            return Err(anyhow!(
                                "tiny-solver cannot partially fix SO3 manifold {}",
                                param.name
                            ));
                        }
                    }
                    if set_manifold {
                        problem.set_variable_manifold(&param.name, Arc::new(QuaternionManifold));
                    }
                }
            }

            for idx in param.fixed.iter() {
                problem.fix_variable(&param.name, idx);
            }
            initial_map.insert(param.name.clone(), init.clone());
        }

        for residual in &ir.residuals {
            let (factor, loss) = compile_factor(residual)?;
            let param_names: Vec<&str> = residual
                .params
                .iter()
                .map(|id| ir.params[id.0].name.as_str())
                .collect();
            problem.add_residual_block(residual.residual_dim(), &param_names, factor, loss);
        }

        Ok((problem, initial_map))
    }
}

impl OptimBackend for TinySolverBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution> {
        let (problem, initial_map) = self.compile(ir, initial)?;
        let initial_cost = evaluate_cost(ir, &initial_map)?;
        if initial_cost <= opts.min_error.unwrap_or(0.0) {
            return Ok(BackendSolution {
                params: initial_map,
                initial_cost,
                final_cost: initial_cost,
                converged: true,
            });
        }
        let optimizer = LevenbergMarquardtOptimizer::default();

        let Some(solution) = optimizer.optimize(&problem, &initial_map, Some(to_optimizer_options(opts)))
        else {
            warn!("tiny-solver returned no solution; keeping initial values");
            return Ok(BackendSolution {
                params: initial_map,
                initial_cost,
                final_cost: initial_cost,
                converged: false,
            });
        };
        let final_cost = evaluate_cost(ir, &solution)?;

        // One more iteration tells whether the cost is still dropping.
        let step_opts = BackendSolveOptions {
            max_iters: 1,
            ..opts.clone()
        };
        let converged = match optimizer.optimize(&problem, &solution, Some(to_optimizer_options(&step_opts))) {
            Some(next) => {
                let next_cost = evaluate_cost(ir, &next)?;
                let drop = final_cost - next_cost;
                let tol = (opts.convergence_rel_tol * final_cost)
                    .max(opts.min_abs_decrease.unwrap_or(0.0))
                    .max(f64::EPSILON);
                drop <= tol || final_cost <= opts.min_error.unwrap_or(0.0)
            }
            None => true,
        };
        debug!(
            "tiny-solver: cost {:.6e} -> {:.6e}, converged = {}",
            initial_cost, final_cost, converged
        );

        Ok(BackendSolution {
            params: solution,
            initial_cost,
            final_cost,
            converged,
        })
    }
}

fn to_optimizer_options(opts: &BackendSolveOptions) -> OptimizerOptions {
    let mut options = OptimizerOptions {
        max_iteration: opts.max_iters,
        verbosity_level: opts.verbosity,
        ..OptimizerOptions::default()
    };
    if let Some(solver) = opts.linear_solver {
        options.linear_solver_type = match solver {
            LinearSolverKind::SparseCholesky => LinearSolverType::SparseCholesky,
            LinearSolverKind::SparseQR => LinearSolverType::SparseQR,
        };
    }
    if let Some(v) = opts.min_abs_decrease {
        options.min_abs_error_decrease_threshold = v;
    }
    if let Some(v) = opts.min_rel_decrease {
        options.min_rel_error_decrease_threshold = v;
    }
    if let Some(v) = opts.min_error {
        options.min_error_threshold = v;
    }
    options
}

fn compile_loss(loss: RobustLoss) -> Result<Option<Box<dyn Loss + Send>>> {
    match loss {
        RobustLoss::None => Ok(None),
        RobustLoss::Huber { scale } => {
            ensure!(scale > 0.0, "Huber scale must be positive");
            Ok(Some(Box::new(HuberLoss::new(scale))))
        }
        RobustLoss::Cauchy { scale } => {
            ensure!(scale > 0.0, "Cauchy scale must be positive");
            Ok(Some(Box::new(CauchyLoss::new(scale))))
        }
    }
}

type CompiledFactor = (
    Box<dyn tiny_solver::factors::FactorImpl + Send>,
    Option<Box<dyn Loss + Send>>,
);

fn compile_factor(residual: &crate::ir::ResidualBlock) -> Result<CompiledFactor> {
    let loss = compile_loss(residual.loss)?;
    let factor: Box<dyn tiny_solver::factors::FactorImpl + Send> = match &residual.factor {
        FactorKind::ReprojPoint { uv, w } => Box::new(TinyReprojPointFactor { uv: *uv, w: *w }),
        FactorKind::RelativeRotation { rel, w } => {
            Box::new(TinyRelativeRotationFactor { rel: *rel, w: *w })
        }
        FactorKind::BaselinePrior {
            anchor,
            distance,
            w,
        } => Box::new(TinyBaselinePriorFactor {
            anchor: *anchor,
            distance: *distance,
            w: *w,
        }),
    };
    Ok((factor, loss))
}

#[derive(Debug, Clone)]
struct TinyReprojPointFactor {
    uv: [f64; 2],
    w: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyReprojPointFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 3, "expected [calib, pose, point] parameter blocks");
        let r = reproj_residual_generic(
            params[0].as_view(),
            params[1].as_view(),
            params[2].as_view(),
            self.uv,
            self.w,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyRelativeRotationFactor {
    rel: [f64; 4],
    w: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyRelativeRotationFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 2, "expected [rot_i1, rot_i2] parameter blocks");
        let r = relative_rotation_residual_generic(
            params[0].as_view(),
            params[1].as_view(),
            self.rel,
            self.w,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyBaselinePriorFactor {
    anchor: [f64; 3],
    distance: f64,
    w: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyBaselinePriorFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 1, "expected [pose] parameter block");
        let r = baseline_prior_residual_generic(params[0].as_view(), self.anchor, self.distance, self.w);
        DVector::from_row_slice(r.as_slice())
    }
}
