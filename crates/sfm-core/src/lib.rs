//! Core math and geometry primitives for the `sfm` workspace.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`, `Pt3`, `Rot3`, ...),
//! - the pinhole + radial camera model and per-image calibration,
//! - the data model shared by every pipeline stage (images, keypoints,
//!   correspondences, relative poses, tracks),
//! - a generic RANSAC engine (`ransac_fit`, [`Estimator`]),
//! - geometry comparison helpers and a synthetic scene generator used in tests.
//!
//! Pose convention: an absolute pose `wTi` maps camera `i` coordinates into the
//! world frame (camera-to-world). A relative pose `i2Ti1` maps camera `i1`
//! coordinates into camera `i2`.

/// Linear algebra type aliases and helpers.
pub mod math;
/// Camera models and calibration.
pub mod models;
/// Generic RANSAC engine and traits.
pub mod ransac;
/// Synthetic scenes with known ground truth.
pub mod synthetic;
/// Data model shared by the pipeline stages.
pub mod types;

pub use math::*;
pub use models::*;
pub use ransac::*;
pub use types::*;
