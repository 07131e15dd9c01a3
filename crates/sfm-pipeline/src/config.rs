//! Scene optimizer configuration.
//!
//! One JSON section per stage. Every section has defaults, so a partial file
//! only needs to name what it changes.

use crate::cycle_consistency::CycleConsistencyOptions;
use crate::data_association::{DataAssociationMode, DataAssociationOptions};
use crate::error::PipelineError;
use crate::two_view::{InlierSupportOptions, VerifierOptions};
use serde::{Deserialize, Serialize};
use sfm_core::Real;
use sfm_features::{HarrisOptions, MatchFilter};
use sfm_optim::{BackendSolveOptions, BundleAdjustmentOptions, OneDSfmOptions, ShonanOptions};

/// Full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneOptimizerConfig {
    pub feature_extractor: FeatureExtractorConfig,
    pub matcher: MatcherConfig,
    pub verifier: VerifierOptions,
    pub inlier_support: InlierSupportOptions,
    /// `null` disables the cycle consistency filter.
    pub cycle_consistency: Option<CycleConsistencyOptions>,
    pub rotation_averaging: RotationAveragingConfig,
    pub translation_averaging: TranslationAveragingConfig,
    pub data_association: DataAssociationConfig,
    pub bundle_adjustment: BundleAdjustmentConfig,
}

impl Default for SceneOptimizerConfig {
    fn default() -> Self {
        Self {
            feature_extractor: FeatureExtractorConfig::default(),
            matcher: MatcherConfig::default(),
            verifier: VerifierOptions::default(),
            inlier_support: InlierSupportOptions::default(),
            cycle_consistency: Some(CycleConsistencyOptions::default()),
            rotation_averaging: RotationAveragingConfig::default(),
            translation_averaging: TranslationAveragingConfig::default(),
            data_association: DataAssociationConfig::default(),
            bundle_adjustment: BundleAdjustmentConfig::default(),
        }
    }
}

impl SceneOptimizerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        fn check(ok: bool, msg: &str) -> Result<(), PipelineError> {
            if ok {
                Ok(())
            } else {
                Err(PipelineError::Config(msg.to_string()))
            }
        }

        check(
            self.feature_extractor.patch_size >= 7,
            "feature_extractor.patch_size must be at least 7",
        )?;
        check(
            self.verifier.estimation_threshold_px > 0.0,
            "verifier.estimation_threshold_px must be positive",
        )?;
        check(
            self.verifier.confidence > 0.0 && self.verifier.confidence < 1.0,
            "verifier.confidence must lie in (0, 1)",
        )?;
        check(
            (0.0..=1.0).contains(&self.inlier_support.min_inlier_ratio_est_model),
            "inlier_support.min_inlier_ratio_est_model must lie in [0, 1]",
        )?;
        if let Some(cc) = &self.cycle_consistency {
            check(
                cc.max_cycle_error_deg > 0.0,
                "cycle_consistency.max_cycle_error_deg must be positive",
            )?;
        }
        check(
            self.rotation_averaging.lifting_dim >= 3,
            "rotation_averaging.lifting_dim must be at least 3",
        )?;
        check(
            self.translation_averaging.num_projections > 0,
            "translation_averaging.num_projections must be positive",
        )?;
        self.data_association.to_options()?;
        check(
            self.bundle_adjustment.output_reproj_error_thresh > 0.0,
            "bundle_adjustment.output_reproj_error_thresh must be positive",
        )?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Feature extraction and matching
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Harris corners with oriented BRIEF descriptors.
    HarrisBrief,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureExtractorConfig {
    pub detector: DetectorKind,
    pub max_keypoints: usize,
    pub harris_k: Real,
    /// Fraction of the strongest response a corner must reach.
    pub response_threshold: Real,
    pub nms_radius: u32,
    pub patch_size: u32,
}

impl Default for FeatureExtractorConfig {
    fn default() -> Self {
        let harris = HarrisOptions::default();
        Self {
            detector: DetectorKind::HarrisBrief,
            max_keypoints: harris.max_keypoints,
            harris_k: harris.k,
            response_threshold: harris.response_threshold,
            nms_radius: harris.nms_radius,
            patch_size: 31,
        }
    }
}

impl FeatureExtractorConfig {
    pub fn harris_options(&self) -> HarrisOptions {
        HarrisOptions {
            k: self.harris_k,
            response_threshold: self.response_threshold,
            nms_radius: self.nms_radius,
            max_keypoints: self.max_keypoints,
            ..HarrisOptions::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherStrategy {
    /// Mutual nearest neighbours.
    TwoWay,
    OneWay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub strategy: MatcherStrategy,
    pub ratio_test: Option<f32>,
    pub max_descriptor_distance: Option<u32>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            strategy: MatcherStrategy::TwoWay,
            ratio_test: None,
            max_descriptor_distance: Some(80),
        }
    }
}

impl MatcherConfig {
    pub fn filter(&self) -> MatchFilter {
        MatchFilter {
            ratio_test: self.ratio_test,
            max_descriptor_distance: self.max_descriptor_distance,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Global averaging
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationAveragingAlgorithm {
    Shonan,
    SpanningTree,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationAveragingConfig {
    pub algorithm: RotationAveragingAlgorithm,
    pub lifting_dim: usize,
    pub max_iters: usize,
    pub tolerance: Real,
    pub robust_scale_deg: Real,
    pub refine: bool,
}

impl Default for RotationAveragingConfig {
    fn default() -> Self {
        let shonan = ShonanOptions::default();
        Self {
            algorithm: RotationAveragingAlgorithm::Shonan,
            lifting_dim: shonan.lifting_dim,
            max_iters: shonan.max_iters,
            tolerance: shonan.tolerance,
            robust_scale_deg: shonan.robust_scale_deg,
            refine: shonan.refine,
        }
    }
}

impl RotationAveragingConfig {
    pub fn shonan_options(&self) -> ShonanOptions {
        ShonanOptions {
            lifting_dim: self.lifting_dim,
            max_iters: self.max_iters,
            tolerance: self.tolerance,
            robust_scale_deg: self.robust_scale_deg,
            refine: self.refine,
            ..ShonanOptions::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationAveragingAlgorithm {
    /// 1DSfM outlier rejection, then the reweighted linear solve.
    OneDSfm,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationAveragingConfig {
    pub algorithm: TranslationAveragingAlgorithm,
    pub num_projections: usize,
    pub outlier_threshold: Real,
    pub irls_iters: usize,
    pub seed: u64,
}

impl Default for TranslationAveragingConfig {
    fn default() -> Self {
        let opts = OneDSfmOptions::default();
        Self {
            algorithm: TranslationAveragingAlgorithm::OneDSfm,
            num_projections: opts.num_projections,
            outlier_threshold: opts.outlier_threshold,
            irls_iters: opts.irls_iters,
            seed: opts.seed,
        }
    }
}

impl TranslationAveragingConfig {
    pub fn one_d_sfm_options(&self) -> OneDSfmOptions {
        OneDSfmOptions {
            num_projections: self.num_projections,
            outlier_threshold: self.outlier_threshold,
            irls_iters: self.irls_iters,
            seed: self.seed,
            ..OneDSfmOptions::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Data association and bundle adjustment
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataAssociationConfig {
    /// 0 = no RANSAC, 1 = uniform, 2 = baseline-biased, 3 = top-k baselines.
    pub mode: u8,
    pub reproj_error_thresh: Real,
    pub min_track_len: usize,
    pub num_ransac_hypotheses: usize,
    pub min_tri_angle_deg: Real,
    pub select_largest_component: bool,
}

impl Default for DataAssociationConfig {
    fn default() -> Self {
        let opts = DataAssociationOptions::default();
        Self {
            mode: opts.mode.code(),
            reproj_error_thresh: opts.reproj_error_thresh,
            min_track_len: opts.min_track_len,
            num_ransac_hypotheses: opts.num_ransac_hypotheses,
            min_tri_angle_deg: opts.min_tri_angle_deg,
            select_largest_component: opts.select_largest_component,
        }
    }
}

impl DataAssociationConfig {
    pub fn to_options(&self) -> Result<DataAssociationOptions, PipelineError> {
        let mode = DataAssociationMode::try_from(self.mode)?;
        if self.min_track_len < 2 {
            return Err(PipelineError::Config(
                "data_association.min_track_len must be at least 2".to_string(),
            ));
        }
        if self.reproj_error_thresh <= 0.0 {
            return Err(PipelineError::Config(
                "data_association.reproj_error_thresh must be positive".to_string(),
            ));
        }
        if mode != DataAssociationMode::NoRansac && self.num_ransac_hypotheses == 0 {
            return Err(PipelineError::Config(
                "data_association.num_ransac_hypotheses must be positive in RANSAC modes"
                    .to_string(),
            ));
        }
        Ok(DataAssociationOptions {
            mode,
            reproj_error_thresh: self.reproj_error_thresh,
            min_track_len: self.min_track_len,
            num_ransac_hypotheses: self.num_ransac_hypotheses,
            min_tri_angle_deg: self.min_tri_angle_deg,
            select_largest_component: self.select_largest_component,
            ..DataAssociationOptions::default()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    /// Observations above this reprojection error are removed after the solve.
    pub output_reproj_error_thresh: Real,
    /// Huber loss on the reprojection residuals.
    pub robust_measurement_noise: bool,
    pub huber_scale_px: Real,
    /// One calibration shared by every camera.
    pub shared_calib: bool,
    /// Refine focal length and radial distortion.
    pub refine_intrinsics: bool,
    pub max_iters: usize,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        let opts = BundleAdjustmentOptions::default();
        Self {
            output_reproj_error_thresh: opts.output_reproj_error_thresh,
            robust_measurement_noise: opts.robust_measurement_noise,
            huber_scale_px: opts.huber_scale_px,
            shared_calib: opts.shared_calib,
            refine_intrinsics: true,
            max_iters: opts.solve.max_iters,
        }
    }
}

impl BundleAdjustmentConfig {
    pub fn to_options(&self, min_track_len: usize) -> BundleAdjustmentOptions {
        BundleAdjustmentOptions {
            output_reproj_error_thresh: self.output_reproj_error_thresh,
            robust_measurement_noise: self.robust_measurement_noise,
            huber_scale_px: self.huber_scale_px,
            shared_calib: self.shared_calib,
            refine_focal: self.refine_intrinsics,
            refine_distortion: self.refine_intrinsics,
            min_track_len,
            solve: BackendSolveOptions {
                max_iters: self.max_iters,
                ..BackendSolveOptions::default()
            },
            ..BundleAdjustmentOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::two_view::VerifierModel;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = SceneOptimizerConfig::from_json(
            r#"{
                "verifier": { "model": "fundamental", "estimation_threshold_px": 2.5 },
                "data_association": { "mode": 2, "num_ransac_hypotheses": 40 },
                "bundle_adjustment": { "shared_calib": false }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.verifier.model, VerifierModel::Fundamental);
        assert!((cfg.verifier.estimation_threshold_px - 2.5).abs() < 1e-12);
        assert!(cfg.verifier.use_intrinsics_in_verification);
        assert_eq!(cfg.inlier_support.min_num_inliers_est_model, 15);
        assert!((cfg.inlier_support.min_inlier_ratio_est_model - 0.1).abs() < 1e-12);
        assert!(cfg.cycle_consistency.is_some());
        let da = cfg.data_association.to_options().unwrap();
        assert_eq!(da.mode, DataAssociationMode::RansacSampleBiasedBaseline);
        assert_eq!(da.num_ransac_hypotheses, 40);
        assert!(!cfg.bundle_adjustment.shared_calib);
        assert!(cfg.bundle_adjustment.robust_measurement_noise);
    }

    #[test]
    fn null_disables_cycle_consistency() {
        let cfg = SceneOptimizerConfig::from_json(r#"{ "cycle_consistency": null }"#).unwrap();
        assert!(cfg.cycle_consistency.is_none());
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for text in [
            r#"{ "data_association": { "mode": 7 } }"#,
            r#"{ "data_association": { "min_track_len": 1 } }"#,
            r#"{ "verifier": { "confidence": 1.5 } }"#,
            r#"{ "rotation_averaging": { "algorithm": "magic" } }"#,
        ] {
            assert!(
                matches!(SceneOptimizerConfig::from_json(text), Err(PipelineError::Config(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn bundle_adjustment_section_maps_to_solver_options() {
        let cfg = BundleAdjustmentConfig {
            refine_intrinsics: false,
            max_iters: 17,
            ..BundleAdjustmentConfig::default()
        };
        let opts = cfg.to_options(3);
        assert!(!opts.refine_focal && !opts.refine_distortion);
        assert_eq!(opts.solve.max_iters, 17);
        assert_eq!(opts.min_track_len, 3);
    }
}
