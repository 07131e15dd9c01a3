//! End-to-end orchestration.
//!
//! Per-image feature extraction and per-pair two-view estimation run on the
//! rayon pool, each task writing its own output slot. The view-graph is
//! merged sequentially once every pair has finished; the global stages
//! (cycle filtering, rotation and translation averaging, data association,
//! bundle adjustment) then run once per parallel-rigid component of the
//! verified view-graph.

use crate::config::{
    DetectorKind, MatcherStrategy, RotationAveragingAlgorithm, SceneOptimizerConfig,
    TranslationAveragingAlgorithm,
};
use crate::cycle_consistency::filter_to_cycle_consistent_edges;
use crate::data_association::{DataAssociation, PairMatches};
use crate::error::PipelineError;
use crate::result::{Diagnostics, PoseErrorMetrics, Reconstruction, RejectedPair, SceneInput, SceneResult};
use crate::two_view::{TwoViewEstimator, TwoViewOutcome};
use log::{info, warn};
use nalgebra::{Translation3, UnitQuaternion};
use rayon::prelude::*;
use sfm_core::{
    align_poses, relative_pose, CameraCalibration, Image, Iso3, KeypointSet, Real, RelativePose,
    Rot3, Vec3, ViewGraph,
};
use sfm_features::{FeatureExtractor, HarrisBriefExtractor, Matcher, OneWayMatcher, TwoWayMatcher};
use sfm_optim::{
    bundle_adjust, reprojection_metrics, BundleAdjustmentMetrics, BundleAdjustmentOptions,
    LinearTranslationAveraging, OneDSfmTranslationAveraging, RotationAveraging,
    RotationMeasurement, ShonanRotationAveraging, SpanningTreeRotationAveraging,
    TranslationAveraging,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// The configured pipeline. Strategies are resolved once, at construction.
pub struct SceneOptimizer {
    config: SceneOptimizerConfig,
    feature_extractor: Box<dyn FeatureExtractor>,
    two_view: TwoViewEstimator,
    rotation_averaging: Box<dyn RotationAveraging>,
    translation_averaging: Box<dyn TranslationAveraging>,
    data_association: DataAssociation,
    bundle_adjustment: BundleAdjustmentOptions,
}

impl SceneOptimizer {
    pub fn new(config: SceneOptimizerConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let feature_extractor: Box<dyn FeatureExtractor> = match config.feature_extractor.detector {
            DetectorKind::HarrisBrief => Box::new(HarrisBriefExtractor::new(
                config.feature_extractor.harris_options(),
                config.feature_extractor.patch_size,
            )),
        };

        let filter = config.matcher.filter();
        let matcher: Box<dyn Matcher> = match config.matcher.strategy {
            MatcherStrategy::TwoWay => Box::new(TwoWayMatcher { filter }),
            MatcherStrategy::OneWay => Box::new(OneWayMatcher { filter }),
        };
        let two_view = TwoViewEstimator::new(
            matcher,
            config.verifier.clone(),
            config.inlier_support.clone(),
        );

        let rotation_averaging: Box<dyn RotationAveraging> =
            match config.rotation_averaging.algorithm {
                RotationAveragingAlgorithm::Shonan => Box::new(ShonanRotationAveraging::new(
                    config.rotation_averaging.shonan_options(),
                )),
                RotationAveragingAlgorithm::SpanningTree => Box::new(SpanningTreeRotationAveraging),
            };

        let ta_options = config.translation_averaging.one_d_sfm_options();
        let translation_averaging: Box<dyn TranslationAveraging> =
            match config.translation_averaging.algorithm {
                TranslationAveragingAlgorithm::OneDSfm => {
                    Box::new(OneDSfmTranslationAveraging::new(ta_options))
                }
                TranslationAveragingAlgorithm::Linear => Box::new(LinearTranslationAveraging {
                    options: ta_options,
                }),
            };

        let da_options = config.data_association.to_options()?;
        let bundle_adjustment = config
            .bundle_adjustment
            .to_options(da_options.min_track_len);

        info!(
            "scene optimizer: extractor={}, matcher={}, rotation averaging={}, translation averaging={}, data association mode={:?}",
            feature_extractor.name(),
            two_view.matcher_name(),
            rotation_averaging.name(),
            translation_averaging.name(),
            da_options.mode
        );

        Ok(Self {
            config,
            feature_extractor,
            two_view,
            rotation_averaging,
            translation_averaging,
            data_association: DataAssociation::new(da_options),
            bundle_adjustment,
        })
    }

    pub fn config(&self) -> &SceneOptimizerConfig {
        &self.config
    }

    /// Run every stage on `input`.
    ///
    /// Fails only on malformed input, before any stage runs.
    pub fn run(&self, input: &SceneInput) -> Result<SceneResult, PipelineError> {
        validate_input(input)?;
        let num_images = input.images.len();
        info!("reconstructing {} images", num_images);

        let calibrations: Vec<CameraCalibration> = input
            .images
            .iter()
            .map(Image::calibration_or_default)
            .collect();
        let keypoints = self.extract_features(input);

        let mut diagnostics = Diagnostics {
            images_without_keypoints: keypoints
                .iter()
                .enumerate()
                .filter(|(_, k)| k.is_empty())
                .map(|(i, _)| i)
                .collect(),
            ..Diagnostics::default()
        };
        if !diagnostics.images_without_keypoints.is_empty() {
            warn!(
                "images without keypoints: {:?}",
                diagnostics.images_without_keypoints
            );
        }

        let outcomes = self.estimate_pairs(input, &keypoints, &calibrations);
        let view_graph = merge_view_graph(num_images, outcomes, &mut diagnostics);

        let view_graph = match &self.config.cycle_consistency {
            Some(opts) => {
                let (filtered, report) = filter_to_cycle_consistent_edges(&view_graph, opts);
                diagnostics.cycle_consistency = Some(report);
                filtered
            }
            None => view_graph,
        };

        let mut reconstructions = if view_graph.num_edges() == 0 {
            warn!("no verified image pairs; nothing to reconstruct");
            Vec::new()
        } else {
            self.reconstruct(
                &view_graph,
                &keypoints,
                &calibrations,
                input.ground_truth.as_deref(),
                &mut diagnostics,
            )
        };
        reconstructions.sort_by(|a, b| {
            b.num_cameras()
                .cmp(&a.num_cameras())
                .then(a.poses.keys().next().cmp(&b.poses.keys().next()))
        });

        diagnostics.unregistered_cameras = (0..num_images)
            .filter(|i| !reconstructions.iter().any(|r| r.poses.contains_key(i)))
            .collect();
        info!(
            "{} reconstruction(s), {} unregistered camera(s)",
            reconstructions.len(),
            diagnostics.unregistered_cameras.len()
        );

        Ok(SceneResult {
            reconstructions,
            diagnostics,
        })
    }

    fn extract_features(&self, input: &SceneInput) -> Vec<KeypointSet> {
        match &input.keypoints {
            Some(keypoints) => keypoints.clone(),
            None => input
                .images
                .par_iter()
                .map(|image| self.feature_extractor.extract(image))
                .collect(),
        }
    }

    fn estimate_pairs(
        &self,
        input: &SceneInput,
        keypoints: &[KeypointSet],
        calibrations: &[CameraCalibration],
    ) -> Vec<TwoViewOutcome> {
        let n = keypoints.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i1| ((i1 + 1)..n).map(move |i2| (i1, i2)))
            .collect();
        pairs
            .par_iter()
            .map(|&(i1, i2)| {
                let gt = input
                    .ground_truth
                    .as_ref()
                    .map(|gt| relative_pose(&gt[i1], &gt[i2]));
                self.two_view.estimate(
                    i1,
                    i2,
                    &keypoints[i1],
                    &keypoints[i2],
                    &calibrations[i1],
                    &calibrations[i2],
                    gt.as_ref(),
                )
            })
            .collect()
    }

    /// Averaging, data association and bundle adjustment per component.
    fn reconstruct(
        &self,
        view_graph: &ViewGraph<RelativePose>,
        keypoints: &[KeypointSet],
        calibrations: &[CameraCalibration],
        ground_truth: Option<&[Iso3]>,
        diagnostics: &mut Diagnostics,
    ) -> Vec<Reconstruction> {
        let num_images = view_graph.num_nodes();
        let rotation_graph = view_graph.map_edges(|p| RotationMeasurement::new(p.rotation));
        let rotations: Vec<Option<Rot3>> = match self.rotation_averaging.average(&rotation_graph) {
            Ok(result) => {
                diagnostics.rotation_averaging_converged = result.converged;
                result.rotations
            }
            Err(e) => {
                warn!("rotation averaging failed: {e:#}");
                return Vec::new();
            }
        };
        debug_assert_eq!(rotations.len(), num_images);

        let direction_graph = view_graph.map_edges(|p| p.translation_dir);
        let translations = match self
            .translation_averaging
            .average(&direction_graph, &rotations)
        {
            Ok(result) => result,
            Err(e) => {
                warn!("translation averaging failed: {e:#}");
                return Vec::new();
            }
        };
        diagnostics.translation_averaging_converged = translations.converged;
        diagnostics.translation_outlier_edges = translations
            .outlier_edges
            .iter()
            .map(|&e| {
                let (i1, i2, _) = view_graph.edge(e);
                (*i1, *i2)
            })
            .collect();
        let outliers: HashSet<usize> = translations.outlier_edges.iter().copied().collect();

        let mut reconstructions = Vec::new();
        for component in &translations.components {
            let poses: BTreeMap<usize, Iso3> = component
                .iter()
                .filter_map(|&i| {
                    let rotation = rotations.get(i).copied().flatten()?;
                    let centre = translations.positions.get(i).copied().flatten()?;
                    Some((i, camera_to_world(&rotation, &centre)))
                })
                .collect();
            if poses.len() < 2 {
                continue;
            }
            let matches: Vec<PairMatches<'_>> = view_graph
                .edges()
                .iter()
                .enumerate()
                .filter(|(idx, (i1, i2, _))| {
                    !outliers.contains(idx) && poses.contains_key(i1) && poses.contains_key(i2)
                })
                .map(|(_, (i1, i2, pose))| (*i1, *i2, pose.inliers.as_slice()))
                .collect();
            if let Some(r) =
                self.reconstruct_component(poses, &matches, keypoints, calibrations, ground_truth)
            {
                reconstructions.push(r);
            }
        }
        reconstructions
    }

    fn reconstruct_component(
        &self,
        poses: BTreeMap<usize, Iso3>,
        matches: &[PairMatches<'_>],
        keypoints: &[KeypointSet],
        calibrations: &[CameraCalibration],
        ground_truth: Option<&[Iso3]>,
    ) -> Option<Reconstruction> {
        let cameras: Vec<usize> = poses.keys().copied().collect();
        let calib_map: BTreeMap<usize, CameraCalibration> =
            cameras.iter().map(|&i| (i, calibrations[i])).collect();
        let association = self
            .data_association
            .run(&poses, &calib_map, keypoints, matches);

        let observed: BTreeSet<usize> = association
            .tracks
            .iter()
            .flat_map(|t| t.observations.iter().map(|o| o.image))
            .collect();
        let poses: BTreeMap<usize, Iso3> = poses
            .into_iter()
            .filter(|(i, _)| observed.contains(i))
            .collect();
        if poses.len() < 2 {
            warn!(
                "component {:?} has no triangulated structure; skipping",
                cameras
            );
            return None;
        }
        let calib_map: BTreeMap<usize, CameraCalibration> = calib_map
            .into_iter()
            .filter(|(i, _)| observed.contains(i))
            .collect();

        let (poses, calibrations, tracks, metrics, converged) =
            match bundle_adjust(&poses, &calib_map, &association.tracks, &self.bundle_adjustment) {
                Ok(ba) => (ba.poses, ba.calibrations, ba.tracks, ba.metrics, ba.converged),
                Err(e) => {
                    warn!("bundle adjustment failed: {e:#}; keeping the initial estimate");
                    let m = reprojection_metrics(&poses, &calib_map, &association.tracks);
                    let metrics = BundleAdjustmentMetrics {
                        before: m,
                        after: m,
                        filtered: m,
                    };
                    (poses, calib_map, association.tracks, metrics, false)
                }
            };

        let pose_errors = ground_truth.map(|gt| pose_error_metrics(&poses, gt));
        Some(Reconstruction {
            poses,
            calibrations,
            tracks,
            metrics,
            data_association: association.metrics,
            converged,
            pose_errors,
        })
    }
}

fn validate_input(input: &SceneInput) -> Result<(), PipelineError> {
    for (index, image) in input.images.iter().enumerate() {
        image
            .validate()
            .map_err(|reason| PipelineError::InvalidImage { index, reason })?;
    }
    if let Some(keypoints) = &input.keypoints {
        if keypoints.len() != input.images.len() {
            return Err(PipelineError::InvalidInput(format!(
                "{} keypoint sets for {} images",
                keypoints.len(),
                input.images.len()
            )));
        }
        for (index, set) in keypoints.iter().enumerate() {
            if set.keypoints.len() != set.descriptors.len() {
                return Err(PipelineError::InvalidKeypoints {
                    index,
                    reason: format!(
                        "{} keypoints but {} descriptors",
                        set.keypoints.len(),
                        set.descriptors.len()
                    ),
                });
            }
            if set
                .keypoints
                .iter()
                .any(|k| !k.pt.x.is_finite() || !k.pt.y.is_finite())
            {
                return Err(PipelineError::InvalidKeypoints {
                    index,
                    reason: "non-finite keypoint location".to_string(),
                });
            }
        }
    }
    if let Some(gt) = &input.ground_truth {
        if gt.len() != input.images.len() {
            return Err(PipelineError::InvalidInput(format!(
                "{} ground-truth poses for {} images",
                gt.len(),
                input.images.len()
            )));
        }
    }
    Ok(())
}

/// Sequential merge of the per-pair outcomes into the view-graph.
fn merge_view_graph(
    num_images: usize,
    outcomes: Vec<TwoViewOutcome>,
    diagnostics: &mut Diagnostics,
) -> ViewGraph<RelativePose> {
    let mut graph = ViewGraph::new(num_images);
    for outcome in outcomes {
        let TwoViewOutcome {
            relative_pose,
            report,
        } = outcome;
        match relative_pose {
            Ok(pose) => {
                graph.add_edge(pose.i1, pose.i2, pose);
            }
            Err(reason) => diagnostics.rejected_pairs.push(RejectedPair {
                i1: report.i1,
                i2: report.i2,
                reason,
            }),
        }
        diagnostics.two_view_reports.push(report);
    }
    info!(
        "view-graph: {} verified pairs, {} rejected",
        graph.num_edges(),
        diagnostics.rejected_pairs.len()
    );
    graph
}

fn camera_to_world(w_r_i: &Rot3, centre: &Vec3) -> Iso3 {
    Iso3::from_parts(
        Translation3::from(*centre),
        UnitQuaternion::from_rotation_matrix(w_r_i),
    )
}

fn pose_error_metrics(poses: &BTreeMap<usize, Iso3>, ground_truth: &[Iso3]) -> PoseErrorMetrics {
    let estimated: Vec<Iso3> = poses.values().copied().collect();
    let reference: Vec<Iso3> = poses.keys().map(|&i| ground_truth[i]).collect();
    let aligned = align_poses(&estimated, &reference);

    let first = reference[0].translation.vector;
    let spread = reference
        .iter()
        .map(|p| (p.translation.vector - first).norm())
        .fold(0.0, Real::max)
        .max(Real::EPSILON);
    let rotation_errors: Vec<Real> = aligned
        .iter()
        .zip(&reference)
        .map(|(a, r)| a.rotation.angle_to(&r.rotation).to_degrees())
        .collect();
    let position_errors: Vec<Real> = aligned
        .iter()
        .zip(&reference)
        .map(|(a, r)| (a.translation.vector - r.translation.vector).norm() / spread)
        .collect();
    let n = rotation_errors.len() as Real;
    PoseErrorMetrics {
        mean_rotation_error_deg: rotation_errors.iter().sum::<Real>() / n,
        max_rotation_error_deg: rotation_errors.iter().copied().fold(0.0, Real::max),
        mean_relative_position_error: position_errors.iter().sum::<Real>() / n,
        max_relative_position_error: position_errors.iter().copied().fold(0.0, Real::max),
    }
}
