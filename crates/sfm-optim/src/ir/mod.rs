//! Backend-independent intermediate representation of optimization problems.

mod types;

pub use types::{FactorKind, FixedMask, ManifoldKind, ParamBlock, ParamId, ProblemIR, ResidualBlock, RobustLoss};
