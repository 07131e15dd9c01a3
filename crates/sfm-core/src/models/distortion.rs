use crate::math::{Real, Vec2};
use serde::{Deserialize, Serialize};

/// Two-term radial distortion `x_d = x * (1 + k1 r² + k2 r⁴)` on normalized coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RadialDistortion {
    pub k1: Real,
    pub k2: Real,
}

impl RadialDistortion {
    const UNDISTORT_ITERS: usize = 10;

    pub fn is_identity(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0
    }

    fn factor(&self, r2: Real) -> Real {
        1.0 + self.k1 * r2 + self.k2 * r2 * r2
    }

    pub fn distort(&self, n: &Vec2) -> Vec2 {
        n * self.factor(n.norm_squared())
    }

    /// Fixed-point inversion of [`distort`](Self::distort).
    pub fn undistort(&self, n_dist: &Vec2) -> Vec2 {
        if self.is_identity() {
            return *n_dist;
        }
        let mut n = *n_dist;
        for _ in 0..Self::UNDISTORT_ITERS {
            let f = self.factor(n.norm_squared());
            if f.abs() < 1e-12 {
                break;
            }
            n = n_dist / f;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undistort_inverts_distort() {
        let d = RadialDistortion { k1: -0.12, k2: 0.03 };
        let n = Vec2::new(0.21, -0.17);
        let back = d.undistort(&d.distort(&n));
        assert!((back - n).norm() < 1e-9, "residual {}", (back - n).norm());
    }
}
