//! SE(3) and SO(3) parameter conversions for tiny-solver.

use anyhow::{ensure, Result};
use nalgebra::{DVector, DVectorView, Quaternion, UnitQuaternion, Vector3};
use sfm_core::{Iso3, Rot3};

/// Convert an `Iso3` into a 7D SE(3) parameter vector `[qx, qy, qz, qw, tx, ty, tz]`.
pub fn iso3_to_se3_dvec(pose: &Iso3) -> DVector<f64> {
    let q = pose.rotation.into_inner();
    let t = pose.translation.vector;
    nalgebra::dvector![
        q.coords[0],
        q.coords[1],
        q.coords[2],
        q.coords[3],
        t.x,
        t.y,
        t.z
    ]
}

/// Convert a 7D SE(3) vector `[qx, qy, qz, qw, tx, ty, tz]` into an `Iso3`.
pub fn se3_dvec_to_iso3(v: DVectorView<'_, f64>) -> Result<Iso3> {
    ensure!(
        v.len() == 7,
        "expected se3 vector of length 7, got {}",
        v.len()
    );
    let quat = Quaternion::new(v[3], v[0], v[1], v[2]);
    let rot = UnitQuaternion::from_quaternion(quat);
    let trans = Vector3::new(v[4], v[5], v[6]);
    Ok(Iso3::from_parts(trans.into(), rot))
}

/// Convert a rotation into a quaternion vector `[qx, qy, qz, qw]`.
pub fn rot3_to_quat_dvec(rot: &Rot3) -> DVector<f64> {
    let q = UnitQuaternion::from_rotation_matrix(rot);
    nalgebra::dvector![q.i, q.j, q.k, q.w]
}

/// Convert a quaternion vector `[qx, qy, qz, qw]` into a rotation.
pub fn quat_dvec_to_rot3(v: DVectorView<'_, f64>) -> Result<Rot3> {
    ensure!(
        v.len() == 4,
        "expected quaternion vector of length 4, got {}",
        v.len()
    );
    let q = UnitQuaternion::from_quaternion(Quaternion::new(v[3], v[0], v[1], v[2]));
    Ok(q.to_rotation_matrix())
}

/// Quaternion array `[qx, qy, qz, qw]` of a rotation, as stored in factors.
pub fn rot3_to_quat_array(rot: &Rot3) -> [f64; 4] {
    let q = UnitQuaternion::from_rotation_matrix(rot);
    [q.i, q.j, q.k, q.w]
}
