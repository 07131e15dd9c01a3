//! The structure-from-motion scene optimizer.
//!
//! ```no_run
//! use sfm_pipeline::{SceneInput, SceneOptimizer, SceneOptimizerConfig};
//! # fn main() -> Result<(), sfm_pipeline::PipelineError> {
//! # let images = Vec::new();
//! let optimizer = SceneOptimizer::new(SceneOptimizerConfig::default())?;
//! let result = optimizer.run(&SceneInput::new(images))?;
//! if let Some(reconstruction) = result.largest() {
//!     println!("registered {} cameras", reconstruction.num_cameras());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Stages, in order: feature extraction, two-view estimation on every image
//! pair, cycle-consistency filtering, rotation averaging, translation
//! averaging, data association and bundle adjustment. The last three run once
//! per parallel-rigid component of the verified view-graph.

pub mod config;
pub mod cycle_consistency;
pub mod data_association;
pub mod error;
pub mod result;
pub mod scene_optimizer;
pub mod two_view;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports
// ─────────────────────────────────────────────────────────────────────────────

pub use crate::config::{
    BundleAdjustmentConfig, DataAssociationConfig, DetectorKind, FeatureExtractorConfig,
    MatcherConfig, MatcherStrategy, RotationAveragingAlgorithm, RotationAveragingConfig,
    SceneOptimizerConfig, TranslationAveragingAlgorithm, TranslationAveragingConfig,
};
pub use crate::cycle_consistency::{
    filter_to_cycle_consistent_edges, CycleConsistencyOptions, CycleConsistencyReport,
};
pub use crate::data_association::{
    generate_tracks, DataAssociation, DataAssociationMetrics, DataAssociationMode,
    DataAssociationOptions, DataAssociationResult, ExitCodeCounts, PairMatches,
};
pub use crate::error::PipelineError;
pub use crate::result::{
    Diagnostics, PoseErrorMetrics, Reconstruction, RejectedPair, SceneInput, SceneResult,
};
pub use crate::scene_optimizer::SceneOptimizer;
pub use crate::two_view::{
    InlierSupportOptions, PairRejection, TwoViewEstimator, TwoViewOutcome, TwoViewReport,
    VerifierModel, VerifierOptions,
};
