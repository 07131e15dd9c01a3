//! Two-view estimation: descriptor matching, robust verification and
//! inlier support filtering.
//!
//! A pair either yields a [`RelativePose`] or an explicit [`PairRejection`];
//! there is no low-confidence middle ground.

use log::debug;
use nalgebra::Unit;
use serde::{Deserialize, Serialize};
use sfm_core::{
    relative_rotation_angle, relative_unit_translation_angle, CameraCalibration, Correspondence,
    Iso3, KeypointSet, Mat3, Pt2, RansacOptions, Real, RelativePose, Rot3, Vec2, Vec3,
};
use sfm_features::Matcher;
use sfm_linear::{
    decompose_homography, essential_from_fundamental, estimate_two_view, recover_pose,
    select_homography_motion, EssentialEstimator, FundamentalEstimator, HomographyEstimator,
    PointPair,
};

/// Geometric model fitted during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierModel {
    Essential,
    Fundamental,
    Homography,
}

impl VerifierModel {
    fn min_samples(self) -> usize {
        match self {
            VerifierModel::Homography => 4,
            VerifierModel::Essential | VerifierModel::Fundamental => 8,
        }
    }
}

/// Options of the sampling-consensus verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierOptions {
    pub model: VerifierModel,
    /// Inlier threshold in pixels (Sampson distance, or transfer error for homographies).
    pub estimation_threshold_px: Real,
    /// Fit an essential matrix on calibrated coordinates instead of a
    /// fundamental matrix on pixels. Only affects the `essential` model.
    pub use_intrinsics_in_verification: bool,
    /// Hard cap on RANSAC hypotheses per pair.
    pub max_iters: usize,
    pub confidence: Real,
    pub seed: u64,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            model: VerifierModel::Essential,
            estimation_threshold_px: 4.0,
            use_intrinsics_in_verification: true,
            max_iters: 2000,
            confidence: 0.999,
            seed: 0,
        }
    }
}

/// Minimum geometric support for a pair to enter the view-graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InlierSupportOptions {
    pub min_num_inliers_est_model: usize,
    /// Inliers over putative matches.
    pub min_inlier_ratio_est_model: Real,
}

impl Default for InlierSupportOptions {
    fn default() -> Self {
        Self {
            min_num_inliers_est_model: 15,
            min_inlier_ratio_est_model: 0.1,
        }
    }
}

/// Why a pair was kept out of the view-graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PairRejection {
    /// Fewer putative matches than the minimal sample of the model.
    TooFewMatches { num_matches: usize },
    /// No consensus set was found within the iteration budget.
    VerificationFailed,
    /// The verified model did not decompose into a valid motion.
    PoseRecoveryFailed,
    /// The homography is a pure rotation; the translation direction is undefined.
    PureRotation,
    InsufficientInliers { num_inliers: usize },
    LowInlierRatio { inlier_ratio: Real },
}

/// Per-pair summary, filled for accepted and rejected pairs alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoViewReport {
    pub i1: usize,
    pub i2: usize,
    pub model: VerifierModel,
    pub num_putative: usize,
    pub num_inliers: usize,
    pub inlier_ratio: Real,
    /// RMS verification residual over the inliers, pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inlier_rms_px: Option<Real>,
    /// Angle between estimated and ground-truth `i2Ri1`, degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_error_deg: Option<Real>,
    /// Angle between estimated and ground-truth translation directions, degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_error_deg: Option<Real>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<PairRejection>,
}

impl TwoViewReport {
    fn new(i1: usize, i2: usize, model: VerifierModel, num_putative: usize) -> Self {
        Self {
            i1,
            i2,
            model,
            num_putative,
            num_inliers: 0,
            inlier_ratio: 0.0,
            inlier_rms_px: None,
            rotation_error_deg: None,
            translation_error_deg: None,
            rejection: None,
        }
    }
}

/// Result of [`TwoViewEstimator::estimate`].
#[derive(Debug, Clone)]
pub struct TwoViewOutcome {
    pub relative_pose: Result<RelativePose, PairRejection>,
    pub report: TwoViewReport,
}

struct VerifiedGeometry {
    rotation: Rot3,
    translation_dir: Unit<Vec3>,
    inliers: Vec<Correspondence>,
    inlier_rms: Real,
}

/// Matching + verification + support filtering for one image pair.
pub struct TwoViewEstimator {
    matcher: Box<dyn Matcher>,
    verifier: VerifierOptions,
    support: InlierSupportOptions,
}

impl TwoViewEstimator {
    pub fn new(
        matcher: Box<dyn Matcher>,
        verifier: VerifierOptions,
        support: InlierSupportOptions,
    ) -> Self {
        Self {
            matcher,
            verifier,
            support,
        }
    }

    pub fn matcher_name(&self) -> &'static str {
        self.matcher.name()
    }

    /// Estimate `i2Ti1` (up to scale) for the pair `(i1, i2)`.
    ///
    /// `gt_i2_t_i1`, when given, only feeds the error fields of the report.
    #[allow(clippy::too_many_arguments)]
    pub fn estimate(
        &self,
        i1: usize,
        i2: usize,
        keypoints1: &KeypointSet,
        keypoints2: &KeypointSet,
        calib1: &CameraCalibration,
        calib2: &CameraCalibration,
        gt_i2_t_i1: Option<&Iso3>,
    ) -> TwoViewOutcome {
        let matches = self.matcher.match_keypoints(keypoints1, keypoints2);
        let mut report = TwoViewReport::new(i1, i2, self.verifier.model, matches.len());

        let relative_pose = self
            .verify(i1, i2, &matches, keypoints1, keypoints2, calib1, calib2)
            .and_then(|geometry| {
                report.num_inliers = geometry.inliers.len();
                report.inlier_ratio = geometry.inliers.len() as Real / matches.len() as Real;
                report.inlier_rms_px = Some(geometry.inlier_rms);
                if let Some(gt) = gt_i2_t_i1 {
                    fill_ground_truth_errors(&mut report, &geometry, gt);
                }
                self.check_support(&report)?;
                Ok(RelativePose {
                    i1,
                    i2,
                    rotation: geometry.rotation,
                    translation_dir: geometry.translation_dir,
                    inliers: geometry.inliers,
                    num_putative: matches.len(),
                })
            });

        match &relative_pose {
            Ok(pose) => debug!(
                "pair ({}, {}): {} / {} inliers",
                i1,
                i2,
                pose.num_inliers(),
                pose.num_putative
            ),
            Err(reason) => {
                debug!("pair ({}, {}) rejected: {:?}", i1, i2, reason);
                report.rejection = Some(reason.clone());
            }
        }
        TwoViewOutcome {
            relative_pose,
            report,
        }
    }

    fn check_support(&self, report: &TwoViewReport) -> Result<(), PairRejection> {
        if report.num_inliers < self.support.min_num_inliers_est_model {
            return Err(PairRejection::InsufficientInliers {
                num_inliers: report.num_inliers,
            });
        }
        if report.inlier_ratio < self.support.min_inlier_ratio_est_model {
            return Err(PairRejection::LowInlierRatio {
                inlier_ratio: report.inlier_ratio,
            });
        }
        Ok(())
    }

    fn ransac_options(&self, i1: usize, i2: usize, min_samples: usize) -> RansacOptions {
        RansacOptions {
            max_iters: self.verifier.max_iters.max(1),
            thresh: self.verifier.estimation_threshold_px,
            min_inliers: min_samples,
            confidence: self.verifier.confidence,
            adaptive: true,
            seed: self
                .verifier
                .seed
                .wrapping_add(((i1 as u64) << 32) | i2 as u64),
            refit_on_inliers: true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn verify(
        &self,
        i1: usize,
        i2: usize,
        matches: &[Correspondence],
        keypoints1: &KeypointSet,
        keypoints2: &KeypointSet,
        calib1: &CameraCalibration,
        calib2: &CameraCalibration,
    ) -> Result<VerifiedGeometry, PairRejection> {
        let model = self.verifier.model;
        let min_samples = model.min_samples();
        if matches.len() < min_samples {
            return Err(PairRejection::TooFewMatches {
                num_matches: matches.len(),
            });
        }

        let calibrated =
            model == VerifierModel::Essential && self.verifier.use_intrinsics_in_verification;
        let data: Vec<PointPair> = matches
            .iter()
            .map(|c| {
                let (p1, p2) = (keypoints1.point(c.a), keypoints2.point(c.b));
                if calibrated {
                    PointPair {
                        x1: Pt2::from(calib1.normalize(&p1)),
                        x2: Pt2::from(calib2.normalize(&p2)),
                    }
                } else {
                    PointPair {
                        x1: undistorted_pixel(calib1, &p1),
                        x2: undistorted_pixel(calib2, &p2),
                    }
                }
            })
            .collect();

        let opts = self.ransac_options(i1, i2, min_samples);
        let result = match model {
            VerifierModel::Essential if calibrated => {
                let pixel_scale =
                    0.5 * (calib1.intrinsics.mean_focal() + calib2.intrinsics.mean_focal());
                estimate_two_view(&EssentialEstimator { pixel_scale }, &data, &opts)
            }
            VerifierModel::Homography => estimate_two_view(&HomographyEstimator, &data, &opts),
            _ => estimate_two_view(&FundamentalEstimator, &data, &opts),
        };
        let fitted = match result.model {
            Some(m) if result.success => m,
            _ => return Err(PairRejection::VerificationFailed),
        };

        let inliers: Vec<Correspondence> = result.inliers.iter().map(|&k| matches[k]).collect();
        let (n1, n2): (Vec<Vec2>, Vec<Vec2>) = inliers
            .iter()
            .map(|c| {
                (
                    calib1.normalize(&keypoints1.point(c.a)),
                    calib2.normalize(&keypoints2.point(c.b)),
                )
            })
            .unzip();

        let k1 = calib1.intrinsics.k_matrix();
        let k2 = calib2.intrinsics.k_matrix();
        let (rotation, translation_dir) = match model {
            VerifierModel::Homography => homography_motion(&fitted, &k1, &k2, &n1, &n2)?,
            _ => {
                let e = if calibrated {
                    fitted
                } else {
                    essential_from_fundamental(&fitted, &k1, &k2)
                        .map_err(|_| PairRejection::PoseRecoveryFailed)?
                };
                let pose =
                    recover_pose(&e, &n1, &n2).map_err(|_| PairRejection::PoseRecoveryFailed)?;
                (pose.rotation, pose.translation_dir)
            }
        };

        Ok(VerifiedGeometry {
            rotation,
            translation_dir,
            inliers,
            inlier_rms: result.inlier_rms,
        })
    }
}

fn undistorted_pixel(calib: &CameraCalibration, px: &Pt2) -> Pt2 {
    calib.intrinsics.to_pixel(&calib.normalize(px))
}

/// Motion of a pixel homography: the decomposition candidate that puts the
/// most inliers in front of both cameras.
fn homography_motion(
    h: &Mat3,
    k1: &Mat3,
    k2: &Mat3,
    n1: &[Vec2],
    n2: &[Vec2],
) -> Result<(Rot3, Unit<Vec3>), PairRejection> {
    let k2_inv = k2.try_inverse().ok_or(PairRejection::PoseRecoveryFailed)?;
    let hn = k2_inv * h * k1;
    let motions =
        decompose_homography(&hn, n1, n2).map_err(|_| PairRejection::PoseRecoveryFailed)?;
    if motions.iter().any(|m| m.translation.norm() < 1e-9) {
        return Err(PairRejection::PureRotation);
    }
    let (motion, in_front) =
        select_homography_motion(&motions, n1, n2).ok_or(PairRejection::PoseRecoveryFailed)?;
    debug!(
        "homography motion: {in_front}/{} inliers in front among {} candidates",
        n1.len(),
        motions.len()
    );
    Ok((motion.rotation, Unit::new_normalize(motion.translation)))
}

fn fill_ground_truth_errors(report: &mut TwoViewReport, geometry: &VerifiedGeometry, gt: &Iso3) {
    let gt_rotation = gt.rotation.to_rotation_matrix();
    report.rotation_error_deg =
        Some(relative_rotation_angle(&geometry.rotation, &gt_rotation).to_degrees());
    let t = gt.translation.vector;
    if t.norm() > Real::EPSILON {
        let gt_dir = Unit::new_normalize(t);
        report.translation_error_deg = Some(
            relative_unit_translation_angle(&geometry.translation_dir, &gt_dir).to_degrees(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use sfm_core::synthetic::{SceneConfig, SyntheticScene};
    use sfm_core::{Keypoint, Pt3, DESCRIPTOR_BYTES};
    use sfm_features::TwoWayMatcher;

    fn estimator(verifier: VerifierOptions, support: InlierSupportOptions) -> TwoViewEstimator {
        TwoViewEstimator::new(Box::new(TwoWayMatcher::default()), verifier, support)
    }

    #[test]
    fn noise_free_pair_recovers_ground_truth() {
        let scene = SyntheticScene::generate(&SceneConfig::default());
        let kps = scene.keypoint_sets();
        let gt = scene.relative_pose(0, 2);
        let est = estimator(VerifierOptions::default(), InlierSupportOptions::default());

        let out = est.estimate(
            0,
            2,
            &kps[0],
            &kps[2],
            &scene.calibration,
            &scene.calibration,
            Some(&gt),
        );
        let pose = out.relative_pose.expect("pair accepted");
        assert_eq!(pose.num_inliers(), pose.num_putative);
        let rot_err = out.report.rotation_error_deg.unwrap();
        let dir_err = out.report.translation_error_deg.unwrap();
        assert!(rot_err < 1e-3, "rotation error {rot_err} deg");
        assert!(dir_err < 1e-3, "translation error {dir_err} deg");
        assert!(out.report.rejection.is_none());
    }

    #[test]
    fn uncalibrated_verification_also_recovers_pose() {
        let scene = SyntheticScene::generate(&SceneConfig::default());
        let kps = scene.keypoint_sets();
        let gt = scene.relative_pose(1, 3);
        let verifier = VerifierOptions {
            model: VerifierModel::Fundamental,
            ..VerifierOptions::default()
        };
        let est = estimator(verifier, InlierSupportOptions::default());

        let out = est.estimate(
            1,
            3,
            &kps[1],
            &kps[3],
            &scene.calibration,
            &scene.calibration,
            Some(&gt),
        );
        assert!(out.relative_pose.is_ok());
        assert!(out.report.rotation_error_deg.unwrap() < 0.1);
        assert!(out.report.translation_error_deg.unwrap() < 0.5);
    }

    #[test]
    fn planar_pair_recovers_ground_truth_with_homography() {
        // Plane z = 5 in front of camera 1; camera 2 slides sideways.
        let cal = CameraCalibration::default_for_image(640, 480);
        let gt = Iso3::new(Vec3::new(-0.8, 0.05, 0.0), Vec3::new(0.01, 0.05, -0.02));
        let mut rng = StdRng::seed_from_u64(5);
        let (mut kps1, mut kps2, mut descriptors) = (Vec::new(), Vec::new(), Vec::new());
        for i in 0..9 {
            for j in 0..6 {
                let p = Pt3::new(-2.0 + 0.5 * i as f64, -1.5 + 0.6 * j as f64, 5.0);
                let a = cal.project_camera_point(&p).unwrap();
                let b = cal.project_camera_point(&(gt * p)).unwrap();
                kps1.push(Keypoint::at(a.x, a.y));
                kps2.push(Keypoint::at(b.x, b.y));
                let mut d = [0u8; DESCRIPTOR_BYTES];
                rng.fill(&mut d[..]);
                descriptors.push(d);
            }
        }
        let set1 = KeypointSet::new(kps1, descriptors.clone());
        let set2 = KeypointSet::new(kps2, descriptors);
        let verifier = VerifierOptions {
            model: VerifierModel::Homography,
            ..VerifierOptions::default()
        };
        let est = estimator(verifier, InlierSupportOptions::default());

        let out = est.estimate(0, 1, &set1, &set2, &cal, &cal, Some(&gt));
        let pose = out.relative_pose.expect("planar pair accepted");
        assert_eq!(pose.num_inliers(), 54);
        let rot_err = out.report.rotation_error_deg.unwrap();
        let dir_err = out.report.translation_error_deg.unwrap();
        assert!(rot_err < 1e-3, "rotation error {rot_err} deg");
        assert!(dir_err < 1e-3, "translation error {dir_err} deg");
    }

    #[test]
    fn low_inlier_ratio_rejects_pair() {
        let scene = SyntheticScene::generate(&SceneConfig::default());
        let mut kps = scene.keypoint_sets();
        let num_true = kps[0].len().min(kps[1].len());

        // Matchable garbage: identical descriptors at unrelated positions.
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..num_true {
            let mut d = [0u8; DESCRIPTOR_BYTES];
            rng.fill(&mut d[..]);
            for set in kps.iter_mut().take(2) {
                let kp = Keypoint::at(rng.random_range(0.0..640.0), rng.random_range(0.0..480.0));
                set.keypoints.push(kp);
                set.descriptors.push(d);
            }
        }

        let verifier = VerifierOptions {
            max_iters: 20_000,
            ..VerifierOptions::default()
        };
        let support = InlierSupportOptions {
            min_num_inliers_est_model: 15,
            min_inlier_ratio_est_model: 0.7,
        };
        let est = estimator(verifier, support);
        let out = est.estimate(
            0,
            1,
            &kps[0],
            &kps[1],
            &scene.calibration,
            &scene.calibration,
            None,
        );
        assert!(out.relative_pose.is_err());
        match out.report.rejection {
            Some(PairRejection::LowInlierRatio { inlier_ratio }) => {
                assert!(inlier_ratio < 0.7, "ratio {inlier_ratio}")
            }
            other => panic!("unexpected rejection {other:?}"),
        }
    }

    #[test]
    fn empty_keypoints_are_rejected_not_fatal() {
        let cal = CameraCalibration::default_for_image(640, 480);
        let est = estimator(VerifierOptions::default(), InlierSupportOptions::default());
        let empty = KeypointSet::default();
        let out = est.estimate(0, 1, &empty, &empty, &cal, &cal, None);
        assert_eq!(
            out.relative_pose.unwrap_err(),
            PairRejection::TooFewMatches { num_matches: 0 }
        );
        assert_eq!(out.report.num_putative, 0);
    }
}
