//! Pipeline input and output types.

use crate::cycle_consistency::CycleConsistencyReport;
use crate::data_association::DataAssociationMetrics;
use crate::two_view::{PairRejection, TwoViewReport};
use serde::{Deserialize, Serialize};
use sfm_core::{CameraCalibration, Image, Iso3, KeypointSet, Real, Track};
use sfm_optim::BundleAdjustmentMetrics;
use std::collections::BTreeMap;

/// Everything the scene optimizer consumes.
#[derive(Debug, Clone, Default)]
pub struct SceneInput {
    pub images: Vec<Image>,
    /// Pre-computed features, one set per image. Skips feature extraction.
    pub keypoints: Option<Vec<KeypointSet>>,
    /// Camera-to-world poses used only for evaluation.
    pub ground_truth: Option<Vec<Iso3>>,
}

impl SceneInput {
    pub fn new(images: Vec<Image>) -> Self {
        Self {
            images,
            keypoints: None,
            ground_truth: None,
        }
    }

    pub fn with_keypoints(mut self, keypoints: Vec<KeypointSet>) -> Self {
        self.keypoints = Some(keypoints);
        self
    }

    pub fn with_ground_truth(mut self, poses: Vec<Iso3>) -> Self {
        self.ground_truth = Some(poses);
        self
    }
}

/// Pose accuracy of a reconstruction after similarity alignment to ground truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoseErrorMetrics {
    pub mean_rotation_error_deg: Real,
    pub max_rotation_error_deg: Real,
    /// Camera centre errors relative to the largest ground-truth distance
    /// from the first camera.
    pub mean_relative_position_error: Real,
    pub max_relative_position_error: Real,
}

/// One rigid component of the view-graph, registered in its own gauge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconstruction {
    /// Camera-to-world poses keyed by image index.
    pub poses: BTreeMap<usize, Iso3>,
    pub calibrations: BTreeMap<usize, CameraCalibration>,
    pub tracks: Vec<Track>,
    pub metrics: BundleAdjustmentMetrics,
    pub data_association: DataAssociationMetrics,
    /// `false` when bundle adjustment stopped on its iteration budget or failed.
    pub converged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose_errors: Option<PoseErrorMetrics>,
}

impl Reconstruction {
    pub fn cameras(&self) -> Vec<usize> {
        self.poses.keys().copied().collect()
    }

    pub fn num_cameras(&self) -> usize {
        self.poses.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedPair {
    pub i1: usize,
    pub i2: usize,
    pub reason: PairRejection,
}

/// What the pipeline recovered from, per stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub images_without_keypoints: Vec<usize>,
    pub two_view_reports: Vec<TwoViewReport>,
    pub rejected_pairs: Vec<RejectedPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_consistency: Option<CycleConsistencyReport>,
    pub rotation_averaging_converged: bool,
    pub translation_averaging_converged: bool,
    /// View-graph edges rejected by translation averaging.
    pub translation_outlier_edges: Vec<(usize, usize)>,
    /// Images that are part of no reconstruction.
    pub unregistered_cameras: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneResult {
    /// Largest reconstruction first.
    pub reconstructions: Vec<Reconstruction>,
    pub diagnostics: Diagnostics,
}

impl SceneResult {
    pub fn largest(&self) -> Option<&Reconstruction> {
        self.reconstructions.first()
    }
}
