//! Oriented BRIEF descriptors on a smoothed image.

use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use sfm_core::{Descriptor, Keypoint, Real, DESCRIPTOR_BYTES};

const PATTERN_SEED: u64 = 0x5eed_b1ef;

/// Fixed sampling pattern of 256 point pairs, steered by keypoint orientation.
#[derive(Debug, Clone)]
pub struct Brief {
    patch_size: u32,
    pattern: Vec<[(Real, Real); 2]>,
}

impl Brief {
    pub fn new(patch_size: u32) -> Self {
        let half = patch_size.max(4) as Real / 2.0;
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut sample = || (rng.random_range(-half..half), rng.random_range(-half..half));
        let pattern = (0..DESCRIPTOR_BYTES * 8)
            .map(|_| [sample(), sample()])
            .collect();
        Self {
            patch_size,
            pattern,
        }
    }

    pub fn patch_size(&self) -> u32 {
        self.patch_size
    }

    /// Orientation from the intensity centroid of a disc around `kp`.
    pub fn orientation(&self, image: &GrayImage, kp: &Keypoint) -> Real {
        let r = (self.patch_size / 2) as i64;
        let (cx, cy) = (kp.pt.x.round() as i64, kp.pt.y.round() as i64);
        let (mut m10, mut m01) = (0.0, 0.0);
        for dy in -r..=r {
            for dx in -r..=r {
                if dx * dx + dy * dy > r * r {
                    continue;
                }
                let v = pixel_clamped(image, cx + dx, cy + dy) as Real;
                m10 += dx as Real * v;
                m01 += dy as Real * v;
            }
        }
        m01.atan2(m10)
    }

    pub fn describe(&self, smoothed: &GrayImage, kp: &Keypoint) -> Descriptor {
        let (s, c) = kp.orientation.sin_cos();
        let (x0, y0) = (kp.pt.x, kp.pt.y);
        let at = |(dx, dy): (Real, Real)| {
            let x = x0 + c * dx - s * dy;
            let y = y0 + s * dx + c * dy;
            pixel_clamped(smoothed, x.round() as i64, y.round() as i64)
        };
        let mut desc = [0u8; DESCRIPTOR_BYTES];
        for (i, pair) in self.pattern.iter().enumerate() {
            if at(pair[0]) < at(pair[1]) {
                desc[i / 8] |= 1 << (i % 8);
            }
        }
        desc
    }

    pub fn describe_all(&self, smoothed: &GrayImage, keypoints: &[Keypoint]) -> Vec<Descriptor> {
        keypoints
            .par_iter()
            .map(|kp| self.describe(smoothed, kp))
            .collect()
    }
}

fn pixel_clamped(image: &GrayImage, x: i64, y: i64) -> u8 {
    let (w, h) = image.dimensions();
    let x = x.clamp(0, w as i64 - 1) as u32;
    let y = y.clamp(0, h as i64 - 1) as u32;
    image.get_pixel(x, y)[0]
}
