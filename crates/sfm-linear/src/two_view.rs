//! RANSAC estimators for two-view verification.
//!
//! Every residual is expressed in pixels so one threshold
//! (`estimation_threshold_px`) serves all three model families.

use crate::epipolar::{essential_8point, fundamental_8point, sampson_distance};
use crate::homography::{dlt_homography, transfer_error};
use log::debug;
use sfm_core::{ransac_fit, Estimator, Mat3, Pt2, RansacOptions, RansacResult, Real};

/// A correspondence in the coordinates the estimator works in.
#[derive(Debug, Clone, Copy)]
pub struct PointPair {
    pub x1: Pt2,
    pub x2: Pt2,
}

fn split(data: &[PointPair], idx: &[usize]) -> (Vec<Pt2>, Vec<Pt2>) {
    idx.iter().map(|&i| (data[i].x1, data[i].x2)).unzip()
}

/// Uncalibrated 8-point fundamental matrix on pixel coordinates.
pub struct FundamentalEstimator;

impl Estimator for FundamentalEstimator {
    type Datum = PointPair;
    type Model = Mat3;

    const MIN_SAMPLES: usize = 8;

    fn fit(&self, data: &[PointPair], sample: &[usize]) -> Option<Mat3> {
        let (a, b) = split(data, sample);
        fundamental_8point(&a, &b).ok()
    }

    fn residual(&self, f: &Mat3, d: &PointPair) -> f64 {
        sampson_distance(f, &d.x1, &d.x2)
    }

    fn refit(&self, data: &[PointPair], inliers: &[usize]) -> Option<Mat3> {
        self.fit(data, inliers)
    }
}

/// Calibrated 8-point essential matrix on normalized coordinates.
///
/// `pixel_scale` (a focal length) converts the normalized Sampson distance
/// back into pixels.
pub struct EssentialEstimator {
    pub pixel_scale: Real,
}

impl Estimator for EssentialEstimator {
    type Datum = PointPair;
    type Model = Mat3;

    const MIN_SAMPLES: usize = 8;

    fn fit(&self, data: &[PointPair], sample: &[usize]) -> Option<Mat3> {
        let (a, b) = split(data, sample);
        essential_8point(&a, &b).ok()
    }

    fn residual(&self, e: &Mat3, d: &PointPair) -> f64 {
        sampson_distance(e, &d.x1, &d.x2) * self.pixel_scale
    }

    fn refit(&self, data: &[PointPair], inliers: &[usize]) -> Option<Mat3> {
        self.fit(data, inliers)
    }
}

/// 4-point homography on pixel coordinates, scored by forward transfer error.
pub struct HomographyEstimator;

impl Estimator for HomographyEstimator {
    type Datum = PointPair;
    type Model = Mat3;

    const MIN_SAMPLES: usize = 4;

    fn fit(&self, data: &[PointPair], sample: &[usize]) -> Option<Mat3> {
        let (a, b) = split(data, sample);
        dlt_homography(&a, &b).ok()
    }

    fn residual(&self, h: &Mat3, d: &PointPair) -> f64 {
        transfer_error(h, &d.x1, &d.x2)
    }

    fn is_degenerate(&self, data: &[PointPair], sample: &[usize]) -> bool {
        // Any three collinear points in either image.
        let collinear = |p: [Pt2; 3]| {
            let area = (p[1] - p[0]).perp(&(p[2] - p[0]));
            area.abs() < 1e-9
        };
        for a in 0..sample.len() {
            for b in (a + 1)..sample.len() {
                for c in (b + 1)..sample.len() {
                    let (i, j, k) = (sample[a], sample[b], sample[c]);
                    if collinear([data[i].x1, data[j].x1, data[k].x1])
                        || collinear([data[i].x2, data[j].x2, data[k].x2])
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn refit(&self, data: &[PointPair], inliers: &[usize]) -> Option<Mat3> {
        self.fit(data, inliers)
    }
}

/// Run RANSAC for any of the two-view estimators.
pub fn estimate_two_view<E>(est: &E, data: &[PointPair], opts: &RansacOptions) -> RansacResult<Mat3>
where
    E: Estimator<Datum = PointPair, Model = Mat3>,
{
    let result = ransac_fit(est, data, opts);
    if !result.success {
        debug!("two-view RANSAC found no consensus among {} pairs", data.len());
    }
    result
}
