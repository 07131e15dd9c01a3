//! Planar homographies: normalized DLT and motion decomposition.

use crate::math::{mat3_from_vec, normalize_points_2d, null_vector};
use crate::triangulation::triangulate_dlt;
use nalgebra::{DMatrix, Unit};
use sfm_core::{
    from_homogeneous, project_to_so3, to_homogeneous, Mat3, Mat34, Pt2, Real, Rot3, Vec2, Vec3,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum HomographyError {
    #[error("need at least 4 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("point configuration is degenerate")]
    Degenerate,
    #[error("svd failed")]
    SvdFailed,
}

/// Estimate `H` such that `x2 ~ H x1` using the normalized DLT.
///
/// The result is scaled so that `H[2,2] = 1` when that entry is not ~0.
pub fn dlt_homography(x1: &[Pt2], x2: &[Pt2]) -> Result<Mat3, HomographyError> {
    let n = x1.len();
    if n < 4 || x2.len() != n {
        return Err(HomographyError::NotEnoughPoints(n.min(x2.len())));
    }
    let (n1, t1) = normalize_points_2d(x1).ok_or(HomographyError::Degenerate)?;
    let (n2, t2) = normalize_points_2d(x2).ok_or(HomographyError::Degenerate)?;

    let mut a = DMatrix::<Real>::zeros(2 * n, 9);
    for (i, (p, q)) in n1.iter().zip(&n2).enumerate() {
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let (h_vec, sv) = null_vector(&a).ok_or(HomographyError::SvdFailed)?;
    // Rank < 8 means the sample does not pin down a unique homography.
    if sv.len() >= 2 && sv[sv.len() - 2] <= 1e-10 * sv[0] {
        return Err(HomographyError::Degenerate);
    }
    let t2_inv = t2.try_inverse().ok_or(HomographyError::Degenerate)?;
    let mut h = t2_inv * mat3_from_vec(&h_vec) * t1;
    let scale = h[(2, 2)];
    if scale.abs() > Real::EPSILON {
        h /= scale;
    }
    Ok(h)
}

/// Pixel distance between `x2` and `H x1`; infinite when `H x1` is at infinity.
pub fn transfer_error(h: &Mat3, x1: &Pt2, x2: &Pt2) -> Real {
    let p = h * to_homogeneous(x1);
    if p.z.abs() < 1e-12 {
        return Real::INFINITY;
    }
    (from_homogeneous(&p) - x2).norm()
}

/// One physically possible motion explaining a calibrated homography
/// `H = R + t nᵀ` (translation scaled by the inverse plane distance).
#[derive(Debug, Clone)]
pub struct HomographyMotion {
    pub rotation: Rot3,
    /// `t / d`; zero for a pure rotation.
    pub translation: Vec3,
    /// Plane normal in the first camera frame.
    pub normal: Unit<Vec3>,
}

/// Decompose a calibrated homography (`x2 ~ H x1` in normalized coordinates)
/// into up to four motions.
///
/// `n1`/`n2` fix the overall sign of `H` (points must lie in front of both
/// cameras). Candidates whose plane lies behind the first camera for the
/// majority of points are dropped. A pure rotation yields one candidate with
/// zero translation.
pub fn decompose_homography(
    h: &Mat3,
    n1: &[Vec2],
    n2: &[Vec2],
) -> Result<Vec<HomographyMotion>, HomographyError> {
    let sv = h.singular_values();
    let s2 = sv[1];
    if s2 <= Real::EPSILON {
        return Err(HomographyError::Degenerate);
    }
    let mut h = h / s2;

    // x2 and H x1 must point the same way for positive depths.
    let positive = n1
        .iter()
        .zip(n2)
        .filter(|(a, b)| {
            let x1 = Vec3::new(a.x, a.y, 1.0);
            let x2 = Vec3::new(b.x, b.y, 1.0);
            x2.dot(&(h * x1)) > 0.0
        })
        .count();
    if 2 * positive < n1.len() {
        h = -h;
    }

    let svd = h.svd(false, true);
    let v_t = svd.v_t.ok_or(HomographyError::SvdFailed)?;
    let s = svd.singular_values;
    let (s1_sq, s3_sq) = (s[0] * s[0], s[2] * s[2]);

    if s1_sq - s3_sq < 1e-9 {
        let rotation = project_to_so3(&h).ok_or(HomographyError::SvdFailed)?;
        return Ok(vec![HomographyMotion {
            rotation,
            translation: Vec3::zeros(),
            normal: Vec3::z_axis(),
        }]);
    }

    let v1: Vec3 = v_t.row(0).transpose();
    let v2: Vec3 = v_t.row(1).transpose();
    let v3: Vec3 = v_t.row(2).transpose();
    let a = (1.0 - s3_sq).max(0.0).sqrt();
    let b = (s1_sq - 1.0).max(0.0).sqrt();
    let norm = (s1_sq - s3_sq).sqrt();
    let u1 = (a * v1 + b * v3) / norm;
    let u2 = (a * v1 - b * v3) / norm;

    let hv2 = h * v2;
    let mut candidates = Vec::with_capacity(4);
    for u in [u1, u2] {
        let hu = h * u;
        let u_mat = Mat3::from_columns(&[v2, u, v2.cross(&u)]);
        let w_mat = Mat3::from_columns(&[hv2, hu, hv2.cross(&hu)]);
        let r = w_mat * u_mat.transpose();
        let rotation = project_to_so3(&r).ok_or(HomographyError::SvdFailed)?;
        let normal = v2.cross(&u);
        let t = (h - rotation.matrix()) * normal;
        candidates.push((rotation, t, normal));
        candidates.push((rotation, -t, -normal));
    }

    let out: Vec<HomographyMotion> = candidates
        .into_iter()
        .filter(|(_, _, nrm)| {
            let in_front = n1
                .iter()
                .filter(|x| nrm.dot(&Vec3::new(x.x, x.y, 1.0)) > 0.0)
                .count();
            2 * in_front > n1.len()
        })
        .map(|(rotation, translation, normal)| HomographyMotion {
            rotation,
            translation,
            normal: Unit::new_normalize(normal),
        })
        .collect();

    if out.is_empty() {
        return Err(HomographyError::Degenerate);
    }
    Ok(out)
}

/// Pick the decomposition candidate that triangulates the most
/// correspondences in front of both cameras.
///
/// Ties go to the smaller mean reprojection error in normalized coordinates.
/// Returns the chosen motion and its number of points in front, or `None`
/// when no candidate puts any point in front of both cameras.
pub fn select_homography_motion<'a>(
    motions: &'a [HomographyMotion],
    n1: &[Vec2],
    n2: &[Vec2],
) -> Option<(&'a HomographyMotion, usize)> {
    let p1 = Mat34::identity();
    let mut best: Option<(usize, usize, Real)> = None;
    for (k, motion) in motions.iter().enumerate() {
        let mut p2 = Mat34::zeros();
        p2.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(motion.rotation.matrix());
        p2.fixed_view_mut::<3, 1>(0, 3).copy_from(&motion.translation);

        let mut in_front = 0usize;
        let mut error_sum = 0.0;
        for (a, b) in n1.iter().zip(n2) {
            let Ok(x1) = triangulate_dlt(&[p1, p2], &[*a, *b]) else {
                continue;
            };
            let x2 = motion.rotation * x1.coords + motion.translation;
            if x1.z <= 0.0 || x2.z <= 0.0 {
                continue;
            }
            in_front += 1;
            error_sum += (Vec2::new(x1.x / x1.z, x1.y / x1.z) - a).norm()
                + (Vec2::new(x2.x / x2.z, x2.y / x2.z) - b).norm();
        }
        if in_front == 0 {
            continue;
        }
        let mean_error = error_sum / in_front as Real;
        let better = match best {
            None => true,
            Some((_, n, e)) => in_front > n || (in_front == n && mean_error < e),
        };
        if better {
            best = Some((k, in_front, mean_error));
        }
    }
    best.map(|(k, n, _)| (&motions[k], n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::{Iso3, Pt3};

    #[test]
    fn dlt_maps_square_to_scaled_square() {
        let w = vec![
            Pt2::new(0.0, 0.0),
            Pt2::new(1.0, 0.0),
            Pt2::new(1.0, 1.0),
            Pt2::new(0.0, 1.0),
        ];
        let img: Vec<Pt2> = w.iter().map(|p| Pt2::new(2.0 * p.x + 3.0, 2.0 * p.y)).collect();
        let h = dlt_homography(&w, &img).unwrap();
        assert!((h[(0, 0)] - 2.0).abs() < 1e-9);
        assert!((h[(0, 2)] - 3.0).abs() < 1e-9);
        for (a, b) in w.iter().zip(&img) {
            assert!(transfer_error(&h, a, b) < 1e-9);
        }
    }

    #[test]
    fn collinear_points_are_degenerate() {
        let pts: Vec<Pt2> = (0..5).map(|i| Pt2::new(i as f64, 2.0 * i as f64)).collect();
        assert!(dlt_homography(&pts, &pts).is_err());
    }

    #[test]
    fn decomposition_recovers_planar_motion() {
        // Plane z = 5 in camera 1, seen from a translated, rotated camera 2.
        let rel = Iso3::new(Vec3::new(0.4, 0.1, -0.2), Vec3::new(0.02, 0.15, -0.05));
        let mut n1 = Vec::new();
        let mut n2 = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                let p = Pt3::new(-1.0 + 0.4 * i as f64, -0.8 + 0.4 * j as f64, 5.0);
                let q = rel * p;
                n1.push(Vec2::new(p.x / p.z, p.y / p.z));
                n2.push(Vec2::new(q.x / q.z, q.y / q.z));
            }
        }
        let p1: Vec<Pt2> = n1.iter().map(|v| Pt2::from(*v)).collect();
        let p2: Vec<Pt2> = n2.iter().map(|v| Pt2::from(*v)).collect();
        let h = dlt_homography(&p1, &p2).unwrap();
        let motions = decompose_homography(&h, &n1, &n2).unwrap();

        let r_gt = rel.rotation.to_rotation_matrix();
        let t_gt = rel.translation.vector / 5.0;
        let matched = motions.iter().any(|m| {
            m.rotation.angle_to(&r_gt) < 1e-6
                && (m.translation - t_gt).norm() < 1e-6
                && (m.normal.into_inner() - Vec3::z()).norm() < 1e-6
        });
        assert!(matched, "no candidate matched: {motions:?}");
    }

    #[test]
    fn selection_keeps_motion_with_points_in_front() {
        // Sideways motion: the mirrored solution puts its plane normal close to
        // the baseline, so part of the wide field of view falls behind it.
        let rel = Iso3::new(Vec3::new(-0.8, 0.05, 0.0), Vec3::new(0.01, 0.05, -0.02));
        let mut n1 = Vec::new();
        let mut n2 = Vec::new();
        for i in 0..9 {
            for j in 0..6 {
                let p = Pt3::new(-2.0 + 0.5 * i as f64, -1.5 + 0.6 * j as f64, 5.0);
                let q = rel * p;
                n1.push(Vec2::new(p.x / p.z, p.y / p.z));
                n2.push(Vec2::new(q.x / q.z, q.y / q.z));
            }
        }
        let p1: Vec<Pt2> = n1.iter().map(|v| Pt2::from(*v)).collect();
        let p2: Vec<Pt2> = n2.iter().map(|v| Pt2::from(*v)).collect();
        let h = dlt_homography(&p1, &p2).unwrap();
        let motions = decompose_homography(&h, &n1, &n2).unwrap();
        let (motion, in_front) = select_homography_motion(&motions, &n1, &n2).unwrap();

        assert_eq!(in_front, n1.len());
        let r_gt = rel.rotation.to_rotation_matrix();
        let t_gt = rel.translation.vector / 5.0;
        assert!(motion.rotation.angle_to(&r_gt) < 1e-6, "{motion:?}");
        assert!((motion.translation - t_gt).norm() < 1e-6, "{motion:?}");
    }

    #[test]
    fn pure_rotation_has_no_translation() {
        let r = Rot3::from_euler_angles(0.05, -0.1, 0.2);
        let n1: Vec<Vec2> = (0..6)
            .map(|i| Vec2::new(-0.3 + 0.1 * i as f64, 0.05 * i as f64))
            .collect();
        let n2: Vec<Vec2> = n1
            .iter()
            .map(|x| {
                let y = r * Vec3::new(x.x, x.y, 1.0);
                Vec2::new(y.x / y.z, y.y / y.z)
            })
            .collect();
        let motions = decompose_homography(r.matrix(), &n1, &n2).unwrap();
        assert_eq!(motions.len(), 1);
        assert!(motions[0].translation.norm() < 1e-12);
        assert!(motions[0].rotation.angle_to(&r) < 1e-9);
    }
}
