//! Data model shared by the pipeline stages.

mod features;
mod input;
mod track;
mod view_graph;

pub use features::{hamming_distance, Correspondence, Descriptor, Keypoint, KeypointSet, DESCRIPTOR_BYTES};
pub use input::{Image, ImageError};
pub use track::{Observation, Track, Track2d};
pub use view_graph::{RelativePose, ViewGraph};
