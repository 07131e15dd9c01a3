//! Non-linear optimization for structure from motion, built on tiny-solver.
//!
//! Problems are described in a small backend-independent IR ([`ir`]), compiled
//! by [`backend::TinySolverBackend`] and solved with Levenberg-Marquardt. On
//! top of that sit the global stages of the pipeline:
//! - [`averaging::rotation`]: lifted rotation averaging with robust refinement,
//! - [`averaging::translation`]: 1DSfM outlier rejection and linear translation averaging,
//! - [`problems::bundle_adjustment`]: joint refinement of poses, calibrations and points.

pub mod averaging;
pub mod backend;
pub mod factors;
pub mod ir;
pub mod params;
pub mod problems;
pub mod robust;

pub use averaging::*;
pub use backend::{BackendSolveOptions, LinearSolverKind};
pub use problems::bundle_adjustment::{
    bundle_adjust, reprojection_metrics, BundleAdjustmentMetrics, BundleAdjustmentOptions,
    BundleAdjustmentResult, ReprojectionMetrics,
};
pub use robust::RobustKernel;
