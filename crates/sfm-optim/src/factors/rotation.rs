//! Relative rotation residual for rotation averaging.

use nalgebra::{DVectorView, Quaternion, RealField, SVector, UnitQuaternion};

fn unit_quat<T: RealField>(q: DVectorView<'_, T>) -> UnitQuaternion<T> {
    UnitQuaternion::from_quaternion(Quaternion::new(
        q[3].clone(),
        q[0].clone(),
        q[1].clone(),
        q[2].clone(),
    ))
}

/// Residual `sqrt(w) * sin(θ) * axis` of `E = (wRi2 * i2Ri1)ᵀ * wRi1`.
///
/// `rel` is `i2Ri1` as `[qx, qy, qz, qw]`. Using `2 q_w q_v` keeps the
/// residual smooth and independent of the quaternion sign.
pub fn relative_rotation_residual_generic<T: RealField>(
    rot_i1: DVectorView<'_, T>,
    rot_i2: DVectorView<'_, T>,
    rel: [f64; 4],
    w: f64,
) -> SVector<T, 3> {
    let q1 = unit_quat(rot_i1);
    let q2 = unit_quat(rot_i2);
    let q_rel = UnitQuaternion::from_quaternion(Quaternion::new(
        T::from_f64(rel[3]).unwrap(),
        T::from_f64(rel[0]).unwrap(),
        T::from_f64(rel[1]).unwrap(),
        T::from_f64(rel[2]).unwrap(),
    ));
    let err = (q2 * q_rel).inverse() * q1;
    let e = err.quaternion();
    let scale = (T::one() + T::one()) * e.w.clone() * T::from_f64(w.sqrt()).unwrap();
    SVector::<T, 3>::new(
        e.i.clone() * scale.clone(),
        e.j.clone() * scale.clone(),
        e.k.clone() * scale,
    )
}
