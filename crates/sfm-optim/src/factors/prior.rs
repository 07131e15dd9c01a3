//! Gauge prior fixing the reconstruction scale.

use super::reprojection::se3_parts;
use nalgebra::{DVectorView, RealField, SVector, Vector3};

/// Residual `sqrt(w) * (|C - anchor| - distance)` where `C = -Rᵀ t` is the
/// centre of the `cTw` pose.
pub fn baseline_prior_residual_generic<T: RealField>(
    pose: DVectorView<'_, T>,
    anchor: [f64; 3],
    distance: f64,
    w: f64,
) -> SVector<T, 1> {
    let (rot, t) = se3_parts(pose);
    let centre = -rot.inverse_transform_vector(&t);
    let a = Vector3::new(
        T::from_f64(anchor[0]).unwrap(),
        T::from_f64(anchor[1]).unwrap(),
        T::from_f64(anchor[2]).unwrap(),
    );
    let d = (centre - a).norm();
    SVector::<T, 1>::new((d - T::from_f64(distance).unwrap()) * T::from_f64(w.sqrt()).unwrap())
}
