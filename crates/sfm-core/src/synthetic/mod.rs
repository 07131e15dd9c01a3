//! Synthetic scenes with known ground truth for tests and demos.

mod scene;

pub use scene::{circular_rig, look_at, random_points, SceneConfig, SyntheticScene};
