use super::{PinholeIntrinsics, RadialDistortion};
use crate::math::{Iso3, Pt2, Pt3, Real, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Focal length used for images without known intrinsics, relative to the larger image side.
pub const DEFAULT_FOCAL_SCALE: Real = 1.2;

/// Minimum depth for a point to count as in front of a camera.
const MIN_DEPTH: Real = 1e-8;

/// Full per-camera calibration: pinhole intrinsics plus radial distortion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub intrinsics: PinholeIntrinsics,
    #[serde(default)]
    pub distortion: RadialDistortion,
}

impl CameraCalibration {
    pub fn pinhole(intrinsics: PinholeIntrinsics) -> Self {
        Self {
            intrinsics,
            distortion: RadialDistortion::default(),
        }
    }

    /// Prior calibration for an image of the given size without metadata.
    pub fn default_for_image(width: u32, height: u32) -> Self {
        let f = DEFAULT_FOCAL_SCALE * width.max(height) as Real;
        Self::pinhole(PinholeIntrinsics::new(
            f,
            f,
            0.5 * width as Real,
            0.5 * height as Real,
        ))
    }

    /// Project a camera-frame point into pixels. `None` when behind the camera.
    pub fn project_camera_point(&self, pc: &Pt3) -> Option<Pt2> {
        if pc.z <= MIN_DEPTH {
            return None;
        }
        let n = Vec2::new(pc.x / pc.z, pc.y / pc.z);
        Some(self.intrinsics.to_pixel(&self.distortion.distort(&n)))
    }

    /// Project a world point through a camera-to-world pose.
    pub fn project(&self, w_t_i: &Iso3, pw: &Pt3) -> Option<Pt2> {
        self.project_camera_point(&w_t_i.inverse_transform_point(pw))
    }

    /// Undistorted normalized coordinates of a pixel.
    pub fn normalize(&self, px: &Pt2) -> Vec2 {
        self.distortion
            .undistort(&self.intrinsics.to_normalized(px))
    }

    /// Unit bearing vector in the camera frame.
    pub fn bearing(&self, px: &Pt2) -> Vec3 {
        let n = self.normalize(px);
        Vec3::new(n.x, n.y, 1.0).normalize()
    }

    /// Pixel distance between an observation and the projection of `pw`.
    ///
    /// Points behind the camera yield `Real::INFINITY`.
    pub fn reprojection_error(&self, w_t_i: &Iso3, pw: &Pt3, observed: &Pt2) -> Real {
        self.project(w_t_i, pw)
            .map_or(Real::INFINITY, |p| (p - observed).norm())
    }
}
