use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identifier for a parameter block, stable within one [`ProblemIR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// Supported manifold types for parameter blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifoldKind {
    /// Standard Euclidean vector space.
    Euclidean,
    /// SE(3) pose stored as `[qx, qy, qz, qw, tx, ty, tz]`.
    SE3,
    /// SO(3) rotation stored as quaternion `[qx, qy, qz, qw]`.
    SO3,
}

impl ManifoldKind {
    /// Returns `true` if the given ambient dimension matches the manifold storage.
    pub fn compatible_dim(self, dim: usize) -> bool {
        match self {
            ManifoldKind::Euclidean => dim > 0,
            ManifoldKind::SE3 => dim == 7,
            ManifoldKind::SO3 => dim == 4,
        }
    }
}

/// Fixed parameter mask for a block.
///
/// Manifold blocks can only be fixed as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixedMask {
    fixed_indices: HashSet<usize>,
}

impl FixedMask {
    pub fn all_free() -> Self {
        Self::default()
    }

    pub fn all_fixed(dim: usize) -> Self {
        Self {
            fixed_indices: (0..dim).collect(),
        }
    }

    pub fn fix_indices(indices: &[usize]) -> Self {
        Self {
            fixed_indices: indices.iter().copied().collect(),
        }
    }

    pub fn is_all_fixed(&self, dim: usize) -> bool {
        (0..dim).all(|i| self.fixed_indices.contains(&i))
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed_indices.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fixed_indices.is_empty()
    }
}

/// Robust loss applied to a residual block.
///
/// One residual block per observation makes the loss act per measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobustLoss {
    #[default]
    None,
    Huber {
        scale: f64,
    },
    Cauchy {
        scale: f64,
    },
}

/// Backend-agnostic factor kinds.
///
/// Each kind implies its parameter layout and residual dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Pixel reprojection of a free 3D point.
    ///
    /// Params: `[calib (fx, fy, cx, cy, k1, k2), pose cTw (SE3), point (3)]`.
    ReprojPoint { uv: [f64; 2], w: f64 },
    /// Relative rotation `i2Ri1` between two absolute rotations `wRi1`, `wRi2`.
    ///
    /// Params: `[rot_i1 (SO3), rot_i2 (SO3)]`. `rel` is `[qx, qy, qz, qw]`.
    RelativeRotation { rel: [f64; 4], w: f64 },
    /// Distance between the camera centre of an SE3 `cTw` pose and a fixed anchor.
    ///
    /// Params: `[pose cTw (SE3)]`.
    BaselinePrior {
        anchor: [f64; 3],
        distance: f64,
        w: f64,
    },
}

impl FactorKind {
    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::ReprojPoint { .. } => 2,
            FactorKind::RelativeRotation { .. } => 3,
            FactorKind::BaselinePrior { .. } => 1,
        }
    }

    /// Expected `(dim, manifold)` of each parameter block.
    fn layout(&self) -> &'static [(usize, ManifoldKind)] {
        match self {
            FactorKind::ReprojPoint { .. } => &[
                (6, ManifoldKind::Euclidean),
                (7, ManifoldKind::SE3),
                (3, ManifoldKind::Euclidean),
            ],
            FactorKind::RelativeRotation { .. } => {
                &[(4, ManifoldKind::SO3), (4, ManifoldKind::SO3)]
            }
            FactorKind::BaselinePrior { .. } => &[(7, ManifoldKind::SE3)],
        }
    }
}

/// Parameter block definition in the IR.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    pub name: String,
    pub dim: usize,
    pub manifold: ManifoldKind,
    pub fixed: FixedMask,
}

/// Residual block definition in the IR.
///
/// The order of `params` must match the factor's expected parameter order.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub loss: RobustLoss,
    pub factor: FactorKind,
}

impl ResidualBlock {
    pub fn residual_dim(&self) -> usize {
        self.factor.residual_dim()
    }
}

/// Backend-agnostic optimization problem.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
}

impl ProblemIR {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter block and returns its `ParamId`.
    pub fn add_param_block(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        manifold: ManifoldKind,
        fixed: FixedMask,
    ) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(ParamBlock {
            id,
            name: name.into(),
            dim,
            manifold,
            fixed,
        });
        id
    }

    pub fn add_residual_block(&mut self, params: Vec<ParamId>, factor: FactorKind, loss: RobustLoss) {
        self.residuals.push(ResidualBlock {
            params,
            loss,
            factor,
        });
    }

    pub fn param_by_name(&self, name: &str) -> Option<ParamId> {
        self.params.iter().find(|p| p.name == name).map(|p| p.id)
    }

    /// Validates internal consistency and factor expectations.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (idx, param) in self.params.iter().enumerate() {
            ensure!(param.id.0 == idx, "param id mismatch at {}: {:?}", idx, param.id);
            ensure!(names.insert(param.name.as_str()), "duplicate param name {}", param.name);
            ensure!(
                param.manifold.compatible_dim(param.dim),
                "param {} manifold {:?} incompatible with dim {}",
                param.name,
                param.manifold,
                param.dim
            );
            for fixed_idx in param.fixed.iter() {
                ensure!(
                    fixed_idx < param.dim,
                    "param {} fixed index {} out of range",
                    param.name,
                    fixed_idx
                );
            }
        }

        for (r_idx, residual) in self.residuals.iter().enumerate() {
            let layout = residual.factor.layout();
            ensure!(
                residual.params.len() == layout.len(),
                "residual {} expects {} params, got {}",
                r_idx,
                layout.len(),
                residual.params.len()
            );
            for (pid, (dim, manifold)) in residual.params.iter().zip(layout) {
                ensure!(
                    pid.0 < self.params.len(),
                    "residual {} references missing param {:?}",
                    r_idx,
                    pid
                );
                let p = &self.params[pid.0];
                ensure!(
                    p.dim == *dim && p.manifold == *manifold,
                    "residual {} expects {}D {:?} for {}, got {}D {:?}",
                    r_idx,
                    dim,
                    manifold,
                    p.name,
                    p.dim,
                    p.manifold
                );
            }
        }
        Ok(())
    }
}
