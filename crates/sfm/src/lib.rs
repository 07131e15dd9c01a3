//! High-level entry crate for the `sfm` global structure-from-motion library.
//!
//! Given a set of images (or pre-computed keypoints), the scene optimizer
//! recovers camera poses, calibrations and a sparse point cloud:
//! - pairwise matching and geometric verification,
//! - cycle-consistency filtering of the view-graph,
//! - global rotation and translation averaging,
//! - track building and triangulation,
//! - bundle adjustment.
//!
//! # Quick Start
//!
//! ```no_run
//! # fn main() -> Result<(), sfm::PipelineError> {
//! # let images = Vec::new();
//! use sfm::prelude::*;
//!
//! let optimizer = SceneOptimizer::new(SceneOptimizerConfig::default())?;
//! let result = optimizer.run(&SceneInput::new(images))?;
//! for reconstruction in &result.reconstructions {
//!     println!(
//!         "{} cameras, {} points",
//!         reconstruction.num_cameras(),
//!         reconstruction.tracks.len()
//!     );
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`core`] - Math types, camera models, data model, RANSAC
//! - [`features`] - Keypoint detection, description and matching
//! - [`linear`] - Two-view geometry and triangulation
//! - [`optim`] - Rotation/translation averaging and bundle adjustment
//! - [`pipeline`] - The scene optimizer and its stages
//! - [`synthetic`] - Synthetic scenes with ground truth

// ═══════════════════════════════════════════════════════════════════════════════
// Foundation Crates
// ═══════════════════════════════════════════════════════════════════════════════

pub use sfm_core as core;
pub use sfm_features as features;
pub use sfm_linear as linear;
pub use sfm_optim as optim;
pub use sfm_pipeline as pipeline;

/// Synthetic scenes with known ground truth.
pub mod synthetic {
    pub use sfm_core::synthetic::{circular_rig, look_at, random_points, SceneConfig, SyntheticScene};
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scene Optimizer
// ═══════════════════════════════════════════════════════════════════════════════

pub use sfm_pipeline::{
    CycleConsistencyOptions, DataAssociationMode, DataAssociationOptions, Diagnostics,
    InlierSupportOptions, PairRejection, PipelineError, PoseErrorMetrics, Reconstruction,
    RejectedPair, SceneInput, SceneOptimizer, SceneOptimizerConfig, SceneResult, TwoViewReport,
    VerifierModel, VerifierOptions,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Core Types
// ═══════════════════════════════════════════════════════════════════════════════

pub use sfm_core::{
    CameraCalibration, Correspondence, Image, Iso3, Keypoint, KeypointSet, Observation,
    PinholeIntrinsics, Pt2, Pt3, Real, RelativePose, Rot3, Track, Vec2, Vec3, ViewGraph,
};
pub use sfm_optim::{BundleAdjustmentMetrics, ReprojectionMetrics};

/// Convenient re-exports for common use.
///
/// ```no_run
/// use sfm::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CameraCalibration, Image, Iso3, KeypointSet, PipelineError, Reconstruction, SceneInput,
        SceneOptimizer, SceneOptimizerConfig, SceneResult,
    };
}
