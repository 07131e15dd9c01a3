//! Comparisons between estimated and reference camera geometry.
//!
//! Absolute rotations and poses are only defined up to a global gauge
//! (rotation for rotation averaging, similarity for a full reconstruction),
//! so every comparison first aligns the estimate onto the reference.

use super::{project_to_so3, Iso3, Mat3, Real, Rot3, Vec3};
use nalgebra::{Translation3, Unit, UnitQuaternion};

/// Angle (radians) of the rotation taking `a` to `b`.
pub fn relative_rotation_angle(a: &Rot3, b: &Rot3) -> Real {
    a.angle_to(b)
}

/// Angle (radians) between two unit translation directions.
pub fn relative_unit_translation_angle(a: &Unit<Vec3>, b: &Unit<Vec3>) -> Real {
    a.dot(b).clamp(-1.0, 1.0).acos()
}

/// Chordal-mean rotation `G` that best maps `estimated[i]` onto `reference[i]`
/// in the sense `reference[i] ≈ G * estimated[i]`.
fn gauge_rotation(estimated: &[Rot3], reference: &[Rot3]) -> Rot3 {
    let mut acc = Mat3::zeros();
    for (e, r) in estimated.iter().zip(reference) {
        acc += r.matrix() * e.matrix().transpose();
    }
    project_to_so3(&acc).unwrap_or_else(Rot3::identity)
}

/// Align a set of absolute rotations to a reference set with one global rotation.
pub fn align_rotations(estimated: &[Rot3], reference: &[Rot3]) -> Vec<Rot3> {
    let g = gauge_rotation(estimated, reference);
    estimated.iter().map(|r| g * r).collect()
}

/// Align camera-to-world poses to a reference set with a similarity transform.
///
/// Rotation comes from the camera orientations, scale and translation from a
/// least-squares fit of the camera centres.
pub fn align_poses(estimated: &[Iso3], reference: &[Iso3]) -> Vec<Iso3> {
    if estimated.is_empty() {
        return Vec::new();
    }
    let est_rot: Vec<Rot3> = estimated
        .iter()
        .map(|p| p.rotation.to_rotation_matrix())
        .collect();
    let ref_rot: Vec<Rot3> = reference
        .iter()
        .map(|p| p.rotation.to_rotation_matrix())
        .collect();
    let g = gauge_rotation(&est_rot, &ref_rot);

    let n = estimated.len() as Real;
    let c_est: Vec<Vec3> = estimated
        .iter()
        .map(|p| g * p.translation.vector)
        .collect();
    let c_ref: Vec<Vec3> = reference.iter().map(|p| p.translation.vector).collect();
    let mean_est = c_est.iter().sum::<Vec3>() / n;
    let mean_ref = c_ref.iter().sum::<Vec3>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (e, r) in c_est.iter().zip(&c_ref) {
        num += (e - mean_est).dot(&(r - mean_ref));
        den += (e - mean_est).norm_squared();
    }
    let scale = if den > Real::EPSILON { num / den } else { 1.0 };

    let g_quat = UnitQuaternion::from_rotation_matrix(&g);
    estimated
        .iter()
        .zip(&c_est)
        .map(|(p, c)| {
            let centre = mean_ref + scale * (c - mean_est);
            Iso3::from_parts(Translation3::from(centre), g_quat * p.rotation)
        })
        .collect()
}

/// Compare two lists of absolute rotations (with missing entries) up to a global rotation.
///
/// Both lists must have the same length and the same missing entries, and at
/// least two rotations must be present.
pub fn compare_rotations(a: &[Option<Rot3>], b: &[Option<Rot3>], thresh_rad: Real) -> bool {
    let Some((ea, eb)) = paired_entries(a, b) else {
        return false;
    };
    align_rotations(&ea, &eb)
        .iter()
        .zip(&eb)
        .all(|(x, y)| x.angle_to(y) <= thresh_rad)
}

/// Compare two lists of camera-to-world poses up to a similarity transform.
///
/// Translations are compared relative to the reference camera spread.
pub fn compare_global_poses(
    a: &[Option<Iso3>],
    b: &[Option<Iso3>],
    rot_thresh_rad: Real,
    trans_rel_thresh: Real,
) -> bool {
    let Some((ea, eb)) = paired_entries(a, b) else {
        return false;
    };
    let aligned = align_poses(&ea, &eb);
    let spread = eb
        .iter()
        .map(|p| (p.translation.vector - eb[0].translation.vector).norm())
        .fold(0.0, Real::max)
        .max(Real::EPSILON);
    aligned.iter().zip(&eb).all(|(x, y)| {
        x.rotation.angle_to(&y.rotation) <= rot_thresh_rad
            && (x.translation.vector - y.translation.vector).norm() <= trans_rel_thresh * spread
    })
}

fn paired_entries<T: Clone>(a: &[Option<T>], b: &[Option<T>]) -> Option<(Vec<T>, Vec<T>)> {
    if a.len() != b.len() {
        return None;
    }
    let mut ea = Vec::new();
    let mut eb = Vec::new();
    for (x, y) in a.iter().zip(b) {
        match (x, y) {
            (Some(x), Some(y)) => {
                ea.push(x.clone());
                eb.push(y.clone());
            }
            (None, None) => {}
            _ => return None,
        }
    }
    (ea.len() >= 2).then_some((ea, eb))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poses() -> Vec<Iso3> {
        (0..4)
            .map(|i| {
                let a = i as Real * 0.4;
                Iso3::new(
                    Vec3::new(a.cos() * 3.0, 0.2 * a, a.sin() * 3.0),
                    Vec3::new(0.05 * a, -a, 0.1),
                )
            })
            .collect()
    }

    #[test]
    fn align_poses_removes_similarity_gauge() {
        let reference = poses();
        let sim_rot = UnitQuaternion::from_euler_angles(0.3, -0.2, 1.1);
        let sim_t = Vec3::new(4.0, -1.0, 2.0);
        let scale = 0.37;
        let estimated: Vec<Iso3> = reference
            .iter()
            .map(|p| {
                let c = sim_rot * p.translation.vector * scale + sim_t;
                Iso3::from_parts(Translation3::from(c), sim_rot * p.rotation)
            })
            .collect();

        let aligned = align_poses(&estimated, &reference);
        for (a, r) in aligned.iter().zip(&reference) {
            assert!(a.rotation.angle_to(&r.rotation) < 1e-9);
            assert!((a.translation.vector - r.translation.vector).norm() < 1e-9);
        }
    }

    #[test]
    fn compare_rotations_requires_matching_gaps() {
        let r = Rot3::from_euler_angles(0.1, 0.2, 0.3);
        let a = vec![Some(r), None, Some(Rot3::identity())];
        let b = vec![Some(r), Some(r), Some(Rot3::identity())];
        assert!(!compare_rotations(&a, &b, 1e-3));
        let b = vec![Some(r), None, Some(Rot3::identity())];
        assert!(compare_rotations(&a, &b, 1e-6));
    }

    #[test]
    fn unit_translation_angle_is_clamped() {
        let u = Unit::new_normalize(Vec3::new(1.0, 1.0, 0.0));
        assert!(relative_unit_translation_angle(&u, &u).abs() < 1e-7);
        let v = Unit::new_normalize(Vec3::new(-1.0, -1.0, 0.0));
        assert!((relative_unit_translation_angle(&u, &v) - std::f64::consts::PI).abs() < 1e-7);
    }
}
