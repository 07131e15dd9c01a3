//! Synthetic multi-view scenes.
//!
//! Cameras sit on a horizontal circle looking at a common target; points are
//! drawn uniformly inside a cube around the target. Every point gets a random
//! binary descriptor shared by all of its projections, so descriptor matching
//! reproduces the true correspondences.

use crate::{
    CameraCalibration, Descriptor, Image, Iso3, Keypoint, KeypointSet, PinholeIntrinsics, Pt2,
    Pt3, Real, Rot3, Vec3, DESCRIPTOR_BYTES,
};
use nalgebra::{Matrix3, Translation3, UnitQuaternion};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Parameters of a generated scene.
#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub num_cameras: usize,
    /// Radius of the camera circle.
    pub radius: Real,
    /// Camera height above the target.
    pub height: Real,
    /// Angular extent of the rig in radians (`2π` for a full circle).
    pub arc: Real,
    pub num_points: usize,
    /// Half side of the cube holding the points.
    pub point_extent: Real,
    pub width: u32,
    pub height_px: u32,
    pub focal: Real,
    /// Uniform pixel noise amplitude.
    pub noise_px: Real,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            num_cameras: 5,
            radius: 6.0,
            height: 1.0,
            arc: std::f64::consts::FRAC_PI_2,
            num_points: 120,
            point_extent: 1.2,
            width: 640,
            height_px: 480,
            focal: 500.0,
            noise_px: 0.0,
            seed: 42,
        }
    }
}

/// Ground truth plus per-image measurements.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    /// Camera-to-world poses.
    pub poses: Vec<Iso3>,
    pub calibration: CameraCalibration,
    pub width: u32,
    pub height: u32,
    pub points: Vec<Pt3>,
    /// Per camera: `(point index, measured pixel)` for every visible point.
    pub observations: Vec<Vec<(usize, Pt2)>>,
    descriptors: Vec<Descriptor>,
}

/// Camera-to-world pose at `eye` looking at `target` with image `y` pointing away from `up`.
pub fn look_at(eye: &Pt3, target: &Pt3, up: &Vec3) -> Iso3 {
    let z = (target - eye).normalize();
    let x = z.cross(up).normalize();
    let y = z.cross(&x);
    let r = Rot3::from_matrix_unchecked(Matrix3::from_columns(&[x, y, z]));
    Iso3::from_parts(
        Translation3::from(eye.coords),
        UnitQuaternion::from_rotation_matrix(&r),
    )
}

/// `n` camera-to-world poses evenly spread over `arc` radians of a circle.
pub fn circular_rig(n: usize, radius: Real, height: Real, arc: Real) -> Vec<Iso3> {
    let up = Vec3::new(0.0, 1.0, 0.0);
    let step = if n > 1 { arc / (n - 1) as Real } else { 0.0 };
    (0..n)
        .map(|i| {
            let a = i as Real * step;
            let eye = Pt3::new(radius * a.sin(), height, -radius * a.cos());
            look_at(&eye, &Pt3::origin(), &up)
        })
        .collect()
}

/// Points uniformly distributed in the cube `[-extent, extent]^3`.
pub fn random_points(n: usize, extent: Real, rng: &mut StdRng) -> Vec<Pt3> {
    (0..n)
        .map(|_| {
            Pt3::new(
                rng.random_range(-extent..=extent),
                rng.random_range(-extent..=extent),
                rng.random_range(-extent..=extent),
            )
        })
        .collect()
}

impl SyntheticScene {
    pub fn generate(cfg: &SceneConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let poses = circular_rig(cfg.num_cameras, cfg.radius, cfg.height, cfg.arc);
        let points = random_points(cfg.num_points, cfg.point_extent, &mut rng);
        let calibration = CameraCalibration::pinhole(PinholeIntrinsics::new(
            cfg.focal,
            cfg.focal,
            0.5 * cfg.width as Real,
            0.5 * cfg.height_px as Real,
        ));
        let descriptors = (0..points.len())
            .map(|_| {
                let mut d = [0u8; DESCRIPTOR_BYTES];
                rng.fill(&mut d[..]);
                d
            })
            .collect();

        let observations = poses
            .iter()
            .map(|pose| {
                points
                    .iter()
                    .enumerate()
                    .filter_map(|(j, p)| {
                        let px = calibration.project(pose, p)?;
                        let noisy = if cfg.noise_px > 0.0 {
                            Pt2::new(
                                px.x + rng.random_range(-cfg.noise_px..=cfg.noise_px),
                                px.y + rng.random_range(-cfg.noise_px..=cfg.noise_px),
                            )
                        } else {
                            px
                        };
                        let inside = noisy.x >= 0.0
                            && noisy.y >= 0.0
                            && noisy.x < cfg.width as Real
                            && noisy.y < cfg.height_px as Real;
                        inside.then_some((j, noisy))
                    })
                    .collect()
            })
            .collect();

        Self {
            poses,
            calibration,
            width: cfg.width,
            height: cfg.height_px,
            points,
            observations,
            descriptors,
        }
    }

    pub fn num_cameras(&self) -> usize {
        self.poses.len()
    }

    /// Images with the true calibration attached.
    pub fn images(&self) -> Vec<Image> {
        (0..self.num_cameras())
            .map(|i| {
                Image::with_size(format!("cam{i}"), self.width, self.height)
                    .with_calibration(self.calibration)
            })
            .collect()
    }

    /// Keypoints and descriptors of every camera, ordered by point index.
    pub fn keypoint_sets(&self) -> Vec<KeypointSet> {
        self.observations
            .iter()
            .map(|obs| {
                let keypoints = obs
                    .iter()
                    .map(|(_, px)| Keypoint::at(px.x, px.y))
                    .collect();
                let descriptors = obs.iter().map(|(j, _)| self.descriptors[*j]).collect();
                KeypointSet::new(keypoints, descriptors)
            })
            .collect()
    }

    /// Index of the keypoint observing point `point` in camera `cam`.
    pub fn keypoint_of(&self, cam: usize, point: usize) -> Option<usize> {
        self.observations[cam].iter().position(|(j, _)| *j == point)
    }

    /// Ground-truth relative pose `i2Ti1`.
    pub fn relative_pose(&self, i1: usize, i2: usize) -> Iso3 {
        crate::math::relative_pose(&self.poses[i1], &self.poses[i2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rig_cameras_look_at_target() {
        let poses = circular_rig(4, 5.0, 1.0, 1.2);
        for pose in &poses {
            let pc = pose.inverse_transform_point(&Pt3::origin());
            assert!(pc.x.abs() < 1e-9 && pc.y.abs() < 1e-9 && pc.z > 0.0);
            let up_in_cam = pose.inverse_transform_vector(&Vec3::new(0.0, 1.0, 0.0));
            assert!(up_in_cam.y < 0.0);
        }
    }

    #[test]
    fn generated_scene_is_deterministic_and_visible() {
        let cfg = SceneConfig::default();
        let a = SyntheticScene::generate(&cfg);
        let b = SyntheticScene::generate(&cfg);
        assert_eq!(a.points, b.points);
        assert_eq!(a.keypoint_sets(), b.keypoint_sets());
        for obs in &a.observations {
            assert!(obs.len() > cfg.num_points / 2);
        }
    }
}
