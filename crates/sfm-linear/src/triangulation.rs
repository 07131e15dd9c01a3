//! Multi-view triangulation.
//!
//! [`triangulate_dlt`] is the homogeneous direct linear transform: it
//! minimises the algebraic error `‖A X‖` over unit `X` via SVD. It is exact on
//! noise-free data and needs no initial guess, but it is not the maximum
//! likelihood estimate under pixel noise; bundle adjustment refines it.
//!
//! [`triangulate_views`] and [`triangulate_views_ransac`] add the checks that
//! decide whether a track survives: conditioning, cheirality, triangulation
//! angle and reprojection error.

use crate::math::null_vector;
use nalgebra::DMatrix;
use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};
use sfm_core::{
    extrinsic_matrix, ransac_fit, CameraCalibration, Estimator, Iso3, Mat34, Pt2, Pt3, Real,
    RansacOptions, Vec2,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TriangulationError {
    #[error("need at least 2 views, got {0}")]
    NotEnoughViews(usize),
    #[error("mismatched number of cameras ({0}) and points ({1})")]
    LengthMismatch(usize, usize),
    #[error("rays are degenerate (coincident or parallel)")]
    Degenerate,
    #[error("triangulated point is at infinity")]
    PointAtInfinity,
    #[error("svd failed during triangulation")]
    SvdFailed,
}

/// Linear triangulation from `[R | t]` camera matrices and normalized points.
pub fn triangulate_dlt(cameras: &[Mat34], points: &[Vec2]) -> Result<Pt3, TriangulationError> {
    if cameras.len() != points.len() {
        return Err(TriangulationError::LengthMismatch(cameras.len(), points.len()));
    }
    if cameras.len() < 2 {
        return Err(TriangulationError::NotEnoughViews(cameras.len()));
    }

    let mut a = DMatrix::<Real>::zeros(2 * cameras.len(), 4);
    for (i, (p, cam)) in points.iter().zip(cameras).enumerate() {
        a.row_mut(2 * i).copy_from(&(p.x * cam.row(2) - cam.row(0)));
        a.row_mut(2 * i + 1).copy_from(&(p.y * cam.row(2) - cam.row(1)));
    }

    let (x_h, sv) = null_vector(&a).ok_or(TriangulationError::SvdFailed)?;
    if sv.len() < 3 || sv[2] <= 1e-12 * sv[0] {
        return Err(TriangulationError::Degenerate);
    }
    let w = x_h[3];
    if w.abs() <= 1e-12 * x_h.norm() {
        return Err(TriangulationError::PointAtInfinity);
    }
    Ok(Pt3::new(x_h[0] / w, x_h[1] / w, x_h[2] / w))
}

/// One observation of a point by a posed, calibrated camera.
#[derive(Debug, Clone)]
pub struct TriangulationView {
    /// Camera-to-world pose.
    pub pose: Iso3,
    pub calibration: CameraCalibration,
    /// Measured pixel.
    pub uv: Pt2,
    extrinsic: Mat34,
    normalized: Vec2,
}

impl TriangulationView {
    pub fn new(pose: Iso3, calibration: CameraCalibration, uv: Pt2) -> Self {
        Self {
            extrinsic: extrinsic_matrix(&pose),
            normalized: calibration.normalize(&uv),
            pose,
            calibration,
            uv,
        }
    }

    pub fn reprojection_error(&self, point: &Pt3) -> Real {
        self.calibration.reprojection_error(&self.pose, point, &self.uv)
    }

    pub fn depth(&self, point: &Pt3) -> Real {
        self.pose.inverse_transform_point(point).z
    }
}

fn dlt_subset(views: &[TriangulationView], idx: &[usize]) -> Result<Pt3, TriangulationError> {
    let cams: Vec<Mat34> = idx.iter().map(|&i| views[i].extrinsic).collect();
    let pts: Vec<Vec2> = idx.iter().map(|&i| views[i].normalized).collect();
    triangulate_dlt(&cams, &pts)
}

/// Largest angle (degrees) between viewing rays of `point` over all view pairs.
pub fn max_triangulation_angle_deg(views: &[TriangulationView], point: &Pt3) -> Real {
    let rays: Vec<_> = views
        .iter()
        .map(|v| (point - v.pose.translation.vector).coords.normalize())
        .collect();
    let mut best: Real = 0.0;
    for i in 0..rays.len() {
        for j in (i + 1)..rays.len() {
            best = best.max(rays[i].dot(&rays[j]).clamp(-1.0, 1.0).acos());
        }
    }
    best.to_degrees()
}

/// Why a track was kept or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriangulationExitCode {
    Success,
    /// Rays are coincident or the linear system is rank deficient.
    Degenerate,
    /// The point lies behind at least one camera.
    CheiralityFailure,
    /// All viewing rays are nearly parallel.
    SmallBaseline,
    /// Mean reprojection error above the threshold.
    ExceedsReprojThresh,
    /// Fewer consistent observations than the minimum track length.
    InsufficientInliers,
}

/// Thresholds applied to every triangulated track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangulationParams {
    pub reproj_error_thresh: Real,
    pub min_tri_angle_deg: Real,
    pub min_track_len: usize,
}

impl Default for TriangulationParams {
    fn default() -> Self {
        Self {
            reproj_error_thresh: 3.0,
            min_tri_angle_deg: 1.0,
            min_track_len: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriangulationOutcome {
    pub exit_code: TriangulationExitCode,
    /// Estimated point, present only on success.
    pub point: Option<Pt3>,
    /// Indices of the views kept for the track.
    pub inliers: Vec<usize>,
    pub mean_reproj_error: Real,
}

impl TriangulationOutcome {
    fn failed(exit_code: TriangulationExitCode) -> Self {
        Self {
            exit_code,
            point: None,
            inliers: Vec::new(),
            mean_reproj_error: Real::INFINITY,
        }
    }
}

/// Validate a point against the views it is supposed to explain.
fn finalize(
    views: &[TriangulationView],
    point: Pt3,
    inliers: Vec<usize>,
    params: &TriangulationParams,
) -> TriangulationOutcome {
    use TriangulationExitCode::*;

    if inliers.len() < params.min_track_len.max(2) {
        return TriangulationOutcome::failed(InsufficientInliers);
    }
    let kept: Vec<TriangulationView> = inliers.iter().map(|&i| views[i].clone()).collect();
    if kept.iter().any(|v| v.depth(&point) <= 0.0) {
        return TriangulationOutcome::failed(CheiralityFailure);
    }
    if max_triangulation_angle_deg(&kept, &point) < params.min_tri_angle_deg {
        return TriangulationOutcome::failed(SmallBaseline);
    }
    let mean = kept.iter().map(|v| v.reprojection_error(&point)).sum::<Real>() / kept.len() as Real;
    if mean > params.reproj_error_thresh {
        return TriangulationOutcome {
            mean_reproj_error: mean,
            ..TriangulationOutcome::failed(ExceedsReprojThresh)
        };
    }
    TriangulationOutcome {
        exit_code: Success,
        point: Some(point),
        inliers,
        mean_reproj_error: mean,
    }
}

/// Closed-form triangulation from every view, followed by the track checks.
pub fn triangulate_views(
    views: &[TriangulationView],
    params: &TriangulationParams,
) -> TriangulationOutcome {
    if views.len() < params.min_track_len.max(2) {
        return TriangulationOutcome::failed(TriangulationExitCode::InsufficientInliers);
    }
    let all: Vec<usize> = (0..views.len()).collect();
    match dlt_subset(views, &all) {
        Ok(point) => finalize(views, point, all, params),
        Err(_) => TriangulationOutcome::failed(TriangulationExitCode::Degenerate),
    }
}

/// How two-view hypotheses are drawn in [`triangulate_views_ransac`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairSampling {
    /// Every view pair equally likely.
    Uniform,
    /// Pairs drawn with probability proportional to their camera baseline.
    BiasedBaseline,
    /// Only the `k` widest-baseline pairs, `k` = number of hypotheses.
    TopKBaselines,
}

struct TriangulationEstimator {
    pairs: Vec<(usize, usize)>,
    /// Cumulative sampling weights over `pairs`.
    cumulative: Vec<Real>,
}

impl TriangulationEstimator {
    fn new(views: &[TriangulationView], sampling: PairSampling, num_hypotheses: usize) -> Self {
        let mut pairs: Vec<(usize, usize, Real)> = Vec::new();
        for i in 0..views.len() {
            for j in (i + 1)..views.len() {
                let baseline =
                    (views[i].pose.translation.vector - views[j].pose.translation.vector).norm();
                pairs.push((i, j, baseline));
            }
        }
        if sampling == PairSampling::TopKBaselines {
            pairs.sort_by(|a, b| b.2.total_cmp(&a.2));
            pairs.truncate(num_hypotheses.max(1));
        }
        let mut acc = 0.0;
        let cumulative = pairs
            .iter()
            .map(|p| {
                acc += match sampling {
                    PairSampling::BiasedBaseline => p.2.max(1e-12),
                    _ => 1.0,
                };
                acc
            })
            .collect();
        Self {
            pairs: pairs.into_iter().map(|(i, j, _)| (i, j)).collect(),
            cumulative,
        }
    }
}

impl Estimator for TriangulationEstimator {
    type Datum = TriangulationView;
    type Model = Pt3;

    const MIN_SAMPLES: usize = 2;

    fn fit(&self, data: &[TriangulationView], sample: &[usize]) -> Option<Pt3> {
        dlt_subset(data, sample).ok()
    }

    fn residual(&self, point: &Pt3, view: &TriangulationView) -> f64 {
        view.reprojection_error(point)
    }

    fn refit(&self, data: &[TriangulationView], inliers: &[usize]) -> Option<Pt3> {
        dlt_subset(data, inliers).ok()
    }

    fn draw_sample(&self, _data: &[TriangulationView], rng: &mut StdRng, out: &mut Vec<usize>) {
        out.clear();
        let Some(&total) = self.cumulative.last() else {
            return;
        };
        let r = rng.random::<Real>() * total;
        let k = self
            .cumulative
            .partition_point(|&c| c <= r)
            .min(self.pairs.len() - 1);
        let (i, j) = self.pairs[k];
        out.extend([i, j]);
    }
}

/// Sampling-consensus triangulation: two-view hypotheses scored by
/// reprojection error, refit on the inlier views, then the track checks.
pub fn triangulate_views_ransac(
    views: &[TriangulationView],
    params: &TriangulationParams,
    sampling: PairSampling,
    num_hypotheses: usize,
    seed: u64,
) -> TriangulationOutcome {
    if views.len() < params.min_track_len.max(2) {
        return TriangulationOutcome::failed(TriangulationExitCode::InsufficientInliers);
    }
    let est = TriangulationEstimator::new(views, sampling, num_hypotheses);
    let opts = RansacOptions {
        max_iters: num_hypotheses.max(1),
        thresh: params.reproj_error_thresh,
        min_inliers: 2,
        adaptive: false,
        seed,
        refit_on_inliers: true,
        ..RansacOptions::default()
    };
    let res = ransac_fit(&est, views, &opts);
    match res.model {
        Some(point) if res.success => finalize(views, point, res.inliers, params),
        _ => TriangulationOutcome::failed(TriangulationExitCode::InsufficientInliers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::{synthetic::look_at, PinholeIntrinsics, Vec3};

    fn cameras(n: usize) -> Vec<Iso3> {
        (0..n)
            .map(|i| {
                let eye = Pt3::new(-1.0 + i as f64, 0.2 * i as f64, -5.0);
                look_at(&eye, &Pt3::origin(), &Vec3::y())
            })
            .collect()
    }

    fn calibration() -> CameraCalibration {
        CameraCalibration::pinhole(PinholeIntrinsics::new(600.0, 600.0, 320.0, 240.0))
    }

    fn views_of(point: &Pt3, poses: &[Iso3]) -> Vec<TriangulationView> {
        let cal = calibration();
        poses
            .iter()
            .map(|p| TriangulationView::new(*p, cal, cal.project(p, point).unwrap()))
            .collect()
    }

    #[test]
    fn dlt_recovers_point_from_three_views() {
        let point = Pt3::new(0.3, -0.2, 0.5);
        let views = views_of(&point, &cameras(3));
        let out = triangulate_views(&views, &TriangulationParams::default());
        assert_eq!(out.exit_code, TriangulationExitCode::Success);
        let p = out.point.unwrap();
        assert!((p - point).norm() < 1e-9);
        assert!(out.mean_reproj_error < 1e-6);
        assert_eq!(out.inliers, vec![0, 1, 2]);
    }

    #[test]
    fn short_tracks_are_rejected() {
        let point = Pt3::new(0.0, 0.0, 0.0);
        let views = views_of(&point, &cameras(2));
        let params = TriangulationParams {
            min_track_len: 3,
            ..TriangulationParams::default()
        };
        let out = triangulate_views(&views, &params);
        assert_eq!(out.exit_code, TriangulationExitCode::InsufficientInliers);
        assert!(out.point.is_none());
    }

    #[test]
    fn coincident_cameras_give_small_baseline() {
        let pose = cameras(1)[0];
        let point = Pt3::new(0.1, 0.1, 0.0);
        let views = views_of(&point, &[pose, pose]);
        let out = triangulate_views(&views, &TriangulationParams::default());
        assert!(matches!(
            out.exit_code,
            TriangulationExitCode::Degenerate | TriangulationExitCode::SmallBaseline
        ));
    }

    #[test]
    fn ransac_drops_mismatched_observation() {
        let point = Pt3::new(0.2, 0.1, -0.3);
        let mut views = views_of(&point, &cameras(5));
        views[2].uv.x += 40.0;
        let views: Vec<TriangulationView> = views
            .into_iter()
            .map(|v| TriangulationView::new(v.pose, v.calibration, v.uv))
            .collect();

        let params = TriangulationParams {
            min_track_len: 3,
            ..TriangulationParams::default()
        };
        let naive = triangulate_views(&views, &params);
        assert_eq!(naive.exit_code, TriangulationExitCode::ExceedsReprojThresh);

        for sampling in [
            PairSampling::Uniform,
            PairSampling::BiasedBaseline,
            PairSampling::TopKBaselines,
        ] {
            let out = triangulate_views_ransac(&views, &params, sampling, 20, 3);
            assert_eq!(out.exit_code, TriangulationExitCode::Success, "{sampling:?}");
            assert_eq!(out.inliers, vec![0, 1, 3, 4]);
            assert!((out.point.unwrap() - point).norm() < 1e-8);
        }
    }
}
