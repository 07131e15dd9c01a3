//! Brute-force Hamming matching.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sfm_core::{hamming_distance, Correspondence, Descriptor, KeypointSet};

/// Strategy for turning two keypoint sets into putative correspondences.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn match_keypoints(&self, a: &KeypointSet, b: &KeypointSet) -> Vec<Correspondence>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchFilter {
    /// Lowe ratio: best distance must be below `ratio * second best`.
    pub ratio_test: Option<f32>,
    /// Largest accepted Hamming distance.
    pub max_descriptor_distance: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Nearest {
    idx: usize,
    dist: u32,
    second: Option<u32>,
}

/// Nearest neighbour of `q` in `train`; ties go to the lower index.
fn nearest(q: &Descriptor, train: &[Descriptor]) -> Option<Nearest> {
    let mut best: Option<Nearest> = None;
    for (idx, t) in train.iter().enumerate() {
        let dist = hamming_distance(q, t);
        best = Some(match best {
            None => Nearest {
                idx,
                dist,
                second: None,
            },
            Some(b) if dist < b.dist => Nearest {
                idx,
                dist,
                second: Some(b.dist),
            },
            Some(b) => Nearest {
                second: Some(b.second.map_or(dist, |s| s.min(dist))),
                ..b
            },
        });
    }
    best
}

impl MatchFilter {
    fn accepts(&self, n: &Nearest) -> bool {
        if let Some(max) = self.max_descriptor_distance {
            if n.dist > max {
                return false;
            }
        }
        if let (Some(ratio), Some(second)) = (self.ratio_test, n.second) {
            if n.dist as f32 >= ratio * second as f32 {
                return false;
            }
        }
        true
    }
}

fn forward(a: &[Descriptor], b: &[Descriptor], filter: &MatchFilter) -> Vec<Option<usize>> {
    a.par_iter()
        .map(|q| nearest(q, b).filter(|n| filter.accepts(n)).map(|n| n.idx))
        .collect()
}

/// Keeps the nearest neighbour of every keypoint in A.
#[derive(Debug, Clone, Default)]
pub struct OneWayMatcher {
    pub filter: MatchFilter,
}

impl Matcher for OneWayMatcher {
    fn name(&self) -> &'static str {
        "one_way"
    }

    fn match_keypoints(&self, a: &KeypointSet, b: &KeypointSet) -> Vec<Correspondence> {
        if a.is_empty() || b.is_empty() {
            return Vec::new();
        }
        forward(&a.descriptors, &b.descriptors, &self.filter)
            .into_iter()
            .enumerate()
            .filter_map(|(i, j)| j.map(|j| Correspondence::new(i, j)))
            .collect()
    }
}

/// Mutual nearest neighbours: `j` is nearest to `i` and `i` is nearest to `j`.
#[derive(Debug, Clone, Default)]
pub struct TwoWayMatcher {
    pub filter: MatchFilter,
}

impl Matcher for TwoWayMatcher {
    fn name(&self) -> &'static str {
        "two_way"
    }

    fn match_keypoints(&self, a: &KeypointSet, b: &KeypointSet) -> Vec<Correspondence> {
        if a.is_empty() || b.is_empty() {
            return Vec::new();
        }
        let ab = forward(&a.descriptors, &b.descriptors, &self.filter);
        let ba = forward(&b.descriptors, &a.descriptors, &self.filter);
        ab.into_iter()
            .enumerate()
            .filter_map(|(i, j)| {
                let j = j?;
                (ba[j] == Some(i)).then(|| Correspondence::new(i, j))
            })
            .collect()
    }
}
