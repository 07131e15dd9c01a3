//! Feature extraction strategies.

use crate::brief::Brief;
use crate::harris::{detect_harris, HarrisOptions};
use image::imageops;
use log::debug;
use sfm_core::{Image, KeypointSet};

/// Per-image keypoint detection and description.
///
/// Implementations must be deterministic and may return an empty set.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, image: &Image) -> KeypointSet;
}

/// Harris corners described with oriented BRIEF.
#[derive(Debug, Clone)]
pub struct HarrisBriefExtractor {
    harris: HarrisOptions,
    brief: Brief,
    blur_sigma: f32,
}

impl HarrisBriefExtractor {
    pub fn new(harris: HarrisOptions, patch_size: u32) -> Self {
        let mut harris = harris;
        // Steered patches reach half a diagonal away from the keypoint.
        harris.border = harris.border.max((patch_size as f64 * 0.75).ceil() as u32);
        Self {
            harris,
            brief: Brief::new(patch_size),
            blur_sigma: 2.0,
        }
    }
}

impl Default for HarrisBriefExtractor {
    fn default() -> Self {
        Self::new(HarrisOptions::default(), 31)
    }
}

impl FeatureExtractor for HarrisBriefExtractor {
    fn name(&self) -> &'static str {
        "harris_brief"
    }

    fn extract(&self, image: &Image) -> KeypointSet {
        let Some(pixels) = &image.pixels else {
            debug!("{}: no pixels, zero keypoints", image.name);
            return KeypointSet::default();
        };
        let mut keypoints: Vec<_> = detect_harris(pixels, &self.harris)
            .into_iter()
            .map(|(kp, _)| kp)
            .collect();
        for kp in keypoints.iter_mut() {
            kp.orientation = self.brief.orientation(pixels, kp);
        }
        let smoothed = imageops::blur(pixels, self.blur_sigma);
        let descriptors = self.brief.describe_all(&smoothed, &keypoints);
        debug!("{}: {} keypoints", image.name, keypoints.len());
        KeypointSet::new(keypoints, descriptors)
    }
}
