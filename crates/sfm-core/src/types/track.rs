use crate::math::{Pt2, Pt3};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One 2D measurement of a track: keypoint `keypoint` of image `image` at `uv`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub image: usize,
    pub keypoint: usize,
    pub uv: Pt2,
}

/// Observations linked by data association, not yet triangulated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track2d {
    pub observations: Vec<Observation>,
}

impl Track2d {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// `true` when no image contributes more than one observation.
    pub fn has_unique_images(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.observations.len());
        self.observations.iter().all(|o| seen.insert(o.image))
    }
}

/// A triangulated 3D point with its supporting observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub point: Pt3,
    pub observations: Vec<Observation>,
}

impl Track {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_image_breaks_uniqueness() {
        let obs = |image, keypoint| Observation {
            image,
            keypoint,
            uv: Pt2::origin(),
        };
        let mut t = Track2d {
            observations: vec![obs(0, 1), obs(1, 4), obs(2, 0)],
        };
        assert!(t.has_unique_images());
        t.observations.push(obs(1, 5));
        assert!(!t.has_unique_images());
    }
}
