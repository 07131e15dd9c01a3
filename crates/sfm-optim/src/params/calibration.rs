//! Packing of [`CameraCalibration`] into the 6-vector `[fx, fy, cx, cy, k1, k2]`.

use anyhow::{ensure, Result};
use nalgebra::{DVector, DVectorView};
use sfm_core::{CameraCalibration, PinholeIntrinsics, RadialDistortion};

/// Number of scalars in a calibration block.
pub const CALIB_DIM: usize = 6;

pub fn calibration_to_dvec(cal: &CameraCalibration) -> DVector<f64> {
    let k = &cal.intrinsics;
    let d = &cal.distortion;
    nalgebra::dvector![k.fx, k.fy, k.cx, k.cy, d.k1, d.k2]
}

pub fn dvec_to_calibration(v: DVectorView<'_, f64>) -> Result<CameraCalibration> {
    ensure!(
        v.len() == CALIB_DIM,
        "expected calibration vector of length {}, got {}",
        CALIB_DIM,
        v.len()
    );
    Ok(CameraCalibration {
        intrinsics: PinholeIntrinsics::new(v[0], v[1], v[2], v[3]),
        distortion: RadialDistortion { k1: v[4], k2: v[5] },
    })
}

/// Indices of the calibration block held fixed during refinement.
///
/// The principal point is never refined, focal lengths and distortion only
/// on request.
pub fn calibration_fixed_indices(refine_focal: bool, refine_distortion: bool) -> Vec<usize> {
    let mut fixed = vec![2, 3];
    if !refine_focal {
        fixed.extend([0, 1]);
    }
    if !refine_distortion {
        fixed.extend([4, 5]);
    }
    fixed.sort_unstable();
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_indices_keep_principal_point() {
        assert_eq!(calibration_fixed_indices(true, true), vec![2, 3]);
        assert_eq!(calibration_fixed_indices(true, false), vec![2, 3, 4, 5]);
        assert_eq!(calibration_fixed_indices(false, false), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(dvec_to_calibration(DVector::zeros(4).as_view()).is_err());
    }
}
