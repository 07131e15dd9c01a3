use crate::math::{Pt2, Real};
use serde::{Deserialize, Serialize};

/// Length of a binary descriptor in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Binary descriptor compared with Hamming distance.
pub type Descriptor = [u8; DESCRIPTOR_BYTES];

pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// A detected image feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Pixel location.
    pub pt: Pt2,
    #[serde(default = "unit_scale")]
    pub scale: Real,
    /// Dominant orientation in radians.
    #[serde(default)]
    pub orientation: Real,
}

fn unit_scale() -> Real {
    1.0
}

impl Keypoint {
    pub fn at(x: Real, y: Real) -> Self {
        Self {
            pt: Pt2::new(x, y),
            scale: 1.0,
            orientation: 0.0,
        }
    }
}

/// Ordered keypoints of one image with one descriptor each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeypointSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl KeypointSet {
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Vec<Descriptor>) -> Self {
        debug_assert_eq!(keypoints.len(), descriptors.len());
        Self {
            keypoints,
            descriptors,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn point(&self, idx: usize) -> Pt2 {
        self.keypoints[idx].pt
    }
}

/// Keypoint index in image A paired with keypoint index in image B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Correspondence {
    pub a: usize,
    pub b: usize,
}

impl Correspondence {
    pub fn new(a: usize, b: usize) -> Self {
        Self { a, b }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_counts_differing_bits() {
        let a = [0u8; DESCRIPTOR_BYTES];
        let mut b = a;
        b[0] = 0b1011;
        b[31] = 0xff;
        assert_eq!(hamming_distance(&a, &b), 11);
        assert_eq!(hamming_distance(&b, &b), 0);
    }
}
