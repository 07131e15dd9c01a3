//! Reprojection residual of a free point through a radial pinhole camera.

use nalgebra::{DVectorView, Quaternion, RealField, SVector, UnitQuaternion, Vector3};

/// Depth offset guarding the perspective division.
pub const PROJECTION_EPS: f64 = 1.0e-9;

/// Rotation and translation of an SE3 block `[qx, qy, qz, qw, tx, ty, tz]`.
pub(crate) fn se3_parts<T: RealField>(pose: DVectorView<'_, T>) -> (UnitQuaternion<T>, Vector3<T>) {
    let q = Quaternion::new(
        pose[3].clone(),
        pose[0].clone(),
        pose[1].clone(),
        pose[2].clone(),
    );
    let t = Vector3::new(pose[4].clone(), pose[5].clone(), pose[6].clone());
    (UnitQuaternion::from_quaternion(q), t)
}

/// Residual `sqrt(w) * (uv - project(calib, cTw * point))`, ordered `[u, v]`.
///
/// `calib` is `[fx, fy, cx, cy, k1, k2]`, `pose` is `cTw` as SE3.
pub fn reproj_residual_generic<T: RealField>(
    calib: DVectorView<'_, T>,
    pose: DVectorView<'_, T>,
    point: DVectorView<'_, T>,
    uv: [f64; 2],
    w: f64,
) -> SVector<T, 2> {
    debug_assert!(calib.len() == 6, "calibration must have 6 params");
    debug_assert!(pose.len() == 7, "pose must have 7 params");
    debug_assert!(point.len() == 3, "point must have 3 params");

    let (rot, t) = se3_parts(pose);
    let pw = Vector3::new(point[0].clone(), point[1].clone(), point[2].clone());
    let pc = rot.transform_vector(&pw) + t;

    let z = pc.z.clone() + T::from_f64(PROJECTION_EPS).unwrap();
    let x = pc.x.clone() / z.clone();
    let y = pc.y.clone() / z;
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let radial = T::one() + calib[4].clone() * r2.clone() + calib[5].clone() * r2.clone() * r2;

    let u = calib[0].clone() * x * radial.clone() + calib[2].clone();
    let v = calib[1].clone() * y * radial + calib[3].clone();

    let sqrt_w = T::from_f64(w.sqrt()).unwrap();
    SVector::<T, 2>::new(
        (T::from_f64(uv[0]).unwrap() - u) * sqrt_w.clone(),
        (T::from_f64(uv[1]).unwrap() - v) * sqrt_w,
    )
}
