//! Numerical helpers shared by the linear solvers.

use sfm_core::{Mat3, Pt2, Real};
use nalgebra::{DMatrix, DVector};

/// Hartley normalization for 2D points.
///
/// Centers the points at the origin and scales them so the mean distance to
/// the origin is `√2`. Returns the normalized points and `T` with
/// `p_norm = T * p_homogeneous`, or `None` if the input is empty or all points
/// coincide.
pub fn normalize_points_2d(points: &[Pt2]) -> Option<(Vec<Pt2>, Mat3)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as Real;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<Real>()
        / n;
    if mean_dist <= Real::EPSILON {
        return None;
    }

    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let t = Mat3::new(
        scale,
        0.0,
        -scale * cx,
        0.0,
        scale,
        -scale * cy,
        0.0,
        0.0,
        1.0,
    );
    let norm = points
        .iter()
        .map(|p| Pt2::new((p.x - cx) * scale, (p.y - cy) * scale))
        .collect();
    Some((norm, t))
}

/// Right singular vector of the smallest singular value of `a`, plus the
/// singular values in descending order.
///
/// Under-determined systems are zero-padded to square so the SVD exposes the
/// full null space.
pub fn null_vector(a: &DMatrix<Real>) -> Option<(DVector<Real>, DVector<Real>)> {
    let cols = a.ncols();
    let work = if a.nrows() < cols {
        let mut padded = DMatrix::<Real>::zeros(cols, cols);
        padded.view_mut((0, 0), (a.nrows(), cols)).copy_from(a);
        padded
    } else {
        a.clone()
    };
    let svd = work.svd(false, true);
    let v_t = svd.v_t?;
    let last = v_t.nrows().checked_sub(1)?;
    Some((v_t.row(last).transpose(), svd.singular_values))
}

/// Reshape a row-major 9-vector into a 3×3 matrix.
pub fn mat3_from_vec(v: &DVector<Real>) -> Mat3 {
    Mat3::from_fn(|r, c| v[3 * r + c])
}

/// Epipolar design row for `x2ᵀ M x1 = 0` with row-major `M`.
pub(crate) fn epipolar_row(x1: &Pt2, x2: &Pt2) -> [Real; 9] {
    [
        x2.x * x1.x,
        x2.x * x1.y,
        x2.x,
        x2.y * x1.x,
        x2.y * x1.y,
        x2.y,
        x1.x,
        x1.y,
        1.0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_centres_and_scales() {
        let pts = vec![
            Pt2::new(100.0, 200.0),
            Pt2::new(150.0, 250.0),
            Pt2::new(120.0, 220.0),
            Pt2::new(90.0, 260.0),
        ];
        let (norm, t) = normalize_points_2d(&pts).unwrap();
        let mean = norm.iter().fold(Pt2::origin().coords, |acc, p| acc + p.coords) / 4.0;
        assert!(mean.norm() < 1e-12);
        let md: f64 = norm.iter().map(|p| p.coords.norm()).sum::<f64>() / 4.0;
        assert!((md - 2f64.sqrt()).abs() < 1e-12);
        let mapped = t * sfm_core::to_homogeneous(&pts[1]);
        assert!((mapped.x - norm[1].x).abs() < 1e-12);
        assert!(normalize_points_2d(&[Pt2::new(1.0, 1.0); 3]).is_none());
    }

    #[test]
    fn null_vector_of_rank_deficient_system() {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, -1.0, 0.0, 1.0, -1.0]);
        let (v, _) = null_vector(&a).unwrap();
        let r = &a * &v;
        assert!(r.norm() < 1e-12);
        assert!((v.norm() - 1.0).abs() < 1e-12);
    }
}
