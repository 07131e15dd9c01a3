use crate::math::{Mat3, Pt2, Real, Vec2};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics `fx, fy, cx, cy` (zero skew).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeIntrinsics {
    pub fx: Real,
    pub fy: Real,
    pub cx: Real,
    pub cy: Real,
}

impl PinholeIntrinsics {
    pub fn new(fx: Real, fy: Real, cx: Real, cy: Real) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Calibration matrix `K`.
    pub fn k_matrix(&self) -> Mat3 {
        Mat3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Map normalized image coordinates into pixels.
    pub fn to_pixel(&self, n: &Vec2) -> Pt2 {
        Pt2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy)
    }

    /// Map pixels into normalized image coordinates.
    pub fn to_normalized(&self, px: &Pt2) -> Vec2 {
        Vec2::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy)
    }

    /// Mean focal length, used to convert pixel thresholds into normalized units.
    pub fn mean_focal(&self) -> Real {
        0.5 * (self.fx + self.fy)
    }

    pub fn is_valid(&self) -> bool {
        self.fx.is_finite()
            && self.fy.is_finite()
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.fx > 0.0
            && self.fy > 0.0
    }
}
