//! Mathematical utilities and type definitions.

use nalgebra::{Isometry3, Matrix3, Matrix3x4, Matrix4, Point2, Point3, Rotation3, Vector2, Vector3};

pub mod geometry;

pub use geometry::{
    align_poses, align_rotations, compare_global_poses, compare_rotations,
    relative_rotation_angle, relative_unit_translation_angle,
};

/// Scalar type used throughout the library (currently `f64`).
pub type Real = f64;

/// 2D vector with [`Real`] components.
pub type Vec2 = Vector2<Real>;
/// 3D vector with [`Real`] components.
pub type Vec3 = Vector3<Real>;
/// 2D point with [`Real`] coordinates.
pub type Pt2 = Point2<Real>;
/// 3D point with [`Real`] coordinates.
pub type Pt3 = Point3<Real>;
/// 3×3 matrix with [`Real`] entries.
pub type Mat3 = Matrix3<Real>;
/// 3×4 camera matrix with [`Real`] entries.
pub type Mat34 = Matrix3x4<Real>;
/// 4×4 matrix with [`Real`] entries.
pub type Mat4 = Matrix4<Real>;
/// Rotation in SO(3).
pub type Rot3 = Rotation3<Real>;
/// 3D rigid transform (SE(3)) using [`Real`].
pub type Iso3 = Isometry3<Real>;

/// Convert a 2D point in Euclidean coordinates into homogeneous coordinates.
pub fn to_homogeneous(p: &Pt2) -> Vec3 {
    Vec3::new(p.x, p.y, 1.0)
}

/// Convert a 3D homogeneous vector back to a 2D point.
///
/// The caller is responsible for ensuring that `w != 0`.
pub fn from_homogeneous(v: &Vec3) -> Pt2 {
    Pt2::new(v.x / v.z, v.y / v.z)
}

/// Cross-product (skew-symmetric) matrix `[v]_x`.
pub fn skew(v: &Vec3) -> Mat3 {
    Mat3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Closest rotation (Frobenius norm) to an arbitrary 3×3 matrix.
///
/// Returns `None` if the SVD does not produce both singular vector sets.
pub fn project_to_so3(m: &Mat3) -> Option<Rot3> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        let mut col = u_fix.column_mut(2);
        col *= -1.0;
        r = u_fix * v_t;
    }
    Some(Rot3::from_matrix_unchecked(r))
}

/// `[R | t]` matrix of the world-to-camera transform of a camera-to-world pose.
pub fn extrinsic_matrix(w_t_i: &Iso3) -> Mat34 {
    let i_t_w = w_t_i.inverse();
    let r = i_t_w.rotation.to_rotation_matrix();
    let t = i_t_w.translation.vector;
    let mut p = Mat34::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(r.matrix());
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    p
}

/// Relative pose `i2Ti1` between two camera-to-world poses.
pub fn relative_pose(w_t_i1: &Iso3, w_t_i2: &Iso3) -> Iso3 {
    w_t_i2.inverse() * w_t_i1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_to_so3_recovers_rotation() {
        let r = Rot3::from_euler_angles(0.1, -0.4, 0.7);
        let noisy = r.matrix() + Mat3::from_element(1e-3);
        let projected = project_to_so3(&noisy).unwrap();
        assert!(projected.angle_to(&r) < 5e-3);
        assert!((projected.matrix().determinant() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn skew_matches_cross_product() {
        let a = Vec3::new(1.0, -2.0, 0.5);
        let b = Vec3::new(0.3, 0.2, -1.0);
        assert!((skew(&a) * b - a.cross(&b)).norm() < 1e-12);
    }

    #[test]
    fn extrinsic_matrix_maps_world_to_camera() {
        let w_t_i = Iso3::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.1, 0.2, -0.3));
        let pw = Pt3::new(0.5, -1.0, 4.0);
        let pc = w_t_i.inverse_transform_point(&pw);
        let p = extrinsic_matrix(&w_t_i) * pw.to_homogeneous();
        assert!((p - pc.coords).norm() < 1e-12);
    }
}
