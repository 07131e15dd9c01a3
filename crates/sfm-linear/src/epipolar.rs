//! Epipolar geometry: fundamental and essential matrices.
//!
//! Conventions: `x2ᵀ F x1 = 0` for pixel points and `x2ᵀ E x1 = 0` for
//! normalized image points, with `E = [t]_x R` and `X2 = R X1 + t`.

use crate::math::{epipolar_row, mat3_from_vec, normalize_points_2d, null_vector};
use crate::triangulation::triangulate_dlt;
use nalgebra::{DMatrix, Unit, Vector3};
use sfm_core::{to_homogeneous, Mat3, Mat34, Pt2, Real, Rot3, Vec2, Vec3};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EpipolarError {
    #[error("need at least 8 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("point sets differ in length ({0} vs {1})")]
    LengthMismatch(usize, usize),
    #[error("point configuration is degenerate")]
    Degenerate,
    #[error("svd failed in epipolar estimation")]
    SvdFailed,
    #[error("no pose candidate places points in front of both cameras")]
    CheiralityFailed,
}

fn check_inputs(pts1: &[Pt2], pts2: &[Pt2]) -> Result<(), EpipolarError> {
    if pts1.len() != pts2.len() {
        return Err(EpipolarError::LengthMismatch(pts1.len(), pts2.len()));
    }
    if pts1.len() < 8 {
        return Err(EpipolarError::NotEnoughPoints(pts1.len()));
    }
    Ok(())
}

/// Linear 8-point estimate on Hartley-normalized points, denormalized, without
/// any rank constraint applied.
fn eight_point_raw(pts1: &[Pt2], pts2: &[Pt2]) -> Result<Mat3, EpipolarError> {
    check_inputs(pts1, pts2)?;
    let (n1, t1) = normalize_points_2d(pts1).ok_or(EpipolarError::Degenerate)?;
    let (n2, t2) = normalize_points_2d(pts2).ok_or(EpipolarError::Degenerate)?;

    let mut a = DMatrix::<Real>::zeros(n1.len(), 9);
    for (i, (p1, p2)) in n1.iter().zip(&n2).enumerate() {
        for (c, v) in epipolar_row(p1, p2).into_iter().enumerate() {
            a[(i, c)] = v;
        }
    }
    let (f_vec, _) = null_vector(&a).ok_or(EpipolarError::SvdFailed)?;
    let f = mat3_from_vec(&f_vec);
    Ok(t2.transpose() * f * t1)
}

fn with_singular_values(m: &Mat3, s: Vector3<Real>) -> Result<Mat3, EpipolarError> {
    let svd = m.svd(true, true);
    let u = svd.u.ok_or(EpipolarError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(EpipolarError::SvdFailed)?;
    Ok(u * Mat3::from_diagonal(&s) * v_t)
}

/// Normalized 8-point fundamental matrix with the rank-2 constraint enforced.
pub fn fundamental_8point(pts1: &[Pt2], pts2: &[Pt2]) -> Result<Mat3, EpipolarError> {
    let f = eight_point_raw(pts1, pts2)?;
    let sv = f.singular_values();
    let f = with_singular_values(&f, Vector3::new(sv[0], sv[1], 0.0))?;
    let norm = f.norm();
    if norm <= Real::EPSILON {
        return Err(EpipolarError::Degenerate);
    }
    Ok(f / norm)
}

/// Project a matrix onto the essential manifold (`σ1 = σ2`, `σ3 = 0`).
pub fn enforce_essential_constraints(e: &Mat3) -> Result<Mat3, EpipolarError> {
    let sv = e.singular_values();
    let s = 0.5 * (sv[0] + sv[1]);
    if s <= Real::EPSILON {
        return Err(EpipolarError::Degenerate);
    }
    with_singular_values(e, Vector3::new(1.0, 1.0, 0.0))
}

/// Linear 8-point essential matrix from normalized image coordinates.
pub fn essential_8point(n1: &[Pt2], n2: &[Pt2]) -> Result<Mat3, EpipolarError> {
    let e = eight_point_raw(n1, n2)?;
    enforce_essential_constraints(&e)
}

/// `E = K2ᵀ F K1`, projected onto the essential manifold.
pub fn essential_from_fundamental(f: &Mat3, k1: &Mat3, k2: &Mat3) -> Result<Mat3, EpipolarError> {
    enforce_essential_constraints(&(k2.transpose() * f * k1))
}

/// Four `(R, t)` candidates for an essential matrix; `t` has unit length.
pub fn decompose_essential(e: &Mat3) -> Result<[(Mat3, Vec3); 4], EpipolarError> {
    let svd = e.svd(true, true);
    let mut u = svd.u.ok_or(EpipolarError::SvdFailed)?;
    let mut v_t = svd.v_t.ok_or(EpipolarError::SvdFailed)?;
    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v_t.determinant() < 0.0 {
        v_t.row_mut(2).neg_mut();
    }

    let w = Mat3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t: Vec3 = u.column(2).normalize();

    Ok([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Sampson approximation of the geometric epipolar error for `x2ᵀ M x1`.
///
/// Returned in the units of the input coordinates.
pub fn sampson_distance(m: &Mat3, x1: &Pt2, x2: &Pt2) -> Real {
    let h1 = to_homogeneous(x1);
    let h2 = to_homogeneous(x2);
    let mx1 = m * h1;
    let mtx2 = m.transpose() * h2;
    let denom = (mx1.x * mx1.x + mx1.y * mx1.y + mtx2.x * mtx2.x + mtx2.y * mtx2.y).max(1e-300);
    (h2.dot(&mx1).powi(2) / denom).sqrt()
}

/// Relative pose selected from an essential matrix by cheirality voting.
#[derive(Debug, Clone)]
pub struct RecoveredPose {
    /// `i2Ri1`.
    pub rotation: Rot3,
    /// Unit direction of `i2ti1`.
    pub translation_dir: Unit<Vec3>,
    /// Correspondences triangulated in front of both cameras.
    pub num_in_front: usize,
}

/// Depth of a point seen by `[R | t]`.
fn depth(p: &Mat34, x: &nalgebra::Point3<Real>) -> Real {
    (p.row(2) * x.to_homogeneous())[0]
}

/// Choose the essential decomposition that places the most points in front of
/// both cameras. `n1`/`n2` are normalized image coordinates.
pub fn recover_pose(e: &Mat3, n1: &[Vec2], n2: &[Vec2]) -> Result<RecoveredPose, EpipolarError> {
    if n1.len() != n2.len() {
        return Err(EpipolarError::LengthMismatch(n1.len(), n2.len()));
    }
    let p1 = Mat34::identity();
    let mut best: Option<RecoveredPose> = None;
    for (r, t) in decompose_essential(e)? {
        let mut p2 = Mat34::zeros();
        p2.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        p2.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);

        let num_in_front = n1
            .iter()
            .zip(n2)
            .filter(|(a, b)| {
                triangulate_dlt(&[p1, p2], &[**a, **b])
                    .map(|x| depth(&p1, &x) > 0.0 && depth(&p2, &x) > 0.0)
                    .unwrap_or(false)
            })
            .count();

        if best.as_ref().map_or(true, |b| num_in_front > b.num_in_front) {
            best = Some(RecoveredPose {
                rotation: Rot3::from_matrix_unchecked(r),
                translation_dir: Unit::new_normalize(t),
                num_in_front,
            });
        }
    }
    match best {
        Some(b) if b.num_in_front > 0 => Ok(b),
        _ => Err(EpipolarError::CheiralityFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::{skew, Iso3, PinholeIntrinsics, Pt3};

    fn scene() -> (Vec<Pt3>, Iso3) {
        let mut pts = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                let x = -1.0 + i as f64 * 0.5;
                let y = -0.8 + j as f64 * 0.5;
                let z = 4.0 + 0.3 * ((i * 3 + j) % 5) as f64;
                pts.push(Pt3::new(x, y, z));
            }
        }
        // i2Ti1
        let rel = Iso3::new(Vec3::new(0.6, -0.1, 0.15), Vec3::new(0.05, -0.12, 0.03));
        (pts, rel)
    }

    fn project(k: &PinholeIntrinsics, p: &Pt3) -> Pt2 {
        k.to_pixel(&Vec2::new(p.x / p.z, p.y / p.z))
    }

    #[test]
    fn fundamental_satisfies_epipolar_constraint() {
        let (pts, rel) = scene();
        let k = PinholeIntrinsics::new(700.0, 710.0, 320.0, 240.0);
        let x1: Vec<Pt2> = pts.iter().map(|p| project(&k, p)).collect();
        let x2: Vec<Pt2> = pts.iter().map(|p| project(&k, &(rel * p))).collect();

        let f = fundamental_8point(&x1, &x2).unwrap();
        for (a, b) in x1.iter().zip(&x2) {
            assert!(sampson_distance(&f, a, b) < 1e-6);
        }
        assert!(f.determinant().abs() < 1e-12);
    }

    #[test]
    fn essential_recovers_relative_pose() {
        let (pts, rel) = scene();
        let n1: Vec<Vec2> = pts.iter().map(|p| Vec2::new(p.x / p.z, p.y / p.z)).collect();
        let n2: Vec<Vec2> = pts
            .iter()
            .map(|p| {
                let q = rel * p;
                Vec2::new(q.x / q.z, q.y / q.z)
            })
            .collect();
        let p1: Vec<Pt2> = n1.iter().map(|v| Pt2::from(*v)).collect();
        let p2: Vec<Pt2> = n2.iter().map(|v| Pt2::from(*v)).collect();

        let e = essential_8point(&p1, &p2).unwrap();
        let pose = recover_pose(&e, &n1, &n2).unwrap();
        assert_eq!(pose.num_in_front, pts.len());

        let r_gt = rel.rotation.to_rotation_matrix();
        assert!(pose.rotation.angle_to(&r_gt) < 1e-7);
        let t_gt = rel.translation.vector.normalize();
        assert!((pose.translation_dir.into_inner() - t_gt).norm() < 1e-7);
    }

    #[test]
    fn decomposition_contains_ground_truth() {
        let r = Rot3::from_euler_angles(0.1, -0.2, 0.3);
        let t = Vec3::new(0.5, 0.2, -0.1).normalize();
        let e = skew(&t) * r.matrix();
        let found = decompose_essential(&e)
            .unwrap()
            .iter()
            .any(|(rc, tc)| (rc - r.matrix()).norm() < 1e-9 && (tc - t).norm() < 1e-9);
        assert!(found);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let p = vec![Pt2::new(0.0, 0.0); 7];
        assert_eq!(
            fundamental_8point(&p, &p),
            Err(EpipolarError::NotEnoughPoints(7))
        );
    }
}
