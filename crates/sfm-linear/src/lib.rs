//! Closed-form geometry solvers used by the structure-from-motion pipeline.
//!
//! - Hartley normalization and null-space helpers ([`math`]),
//! - normalized 8-point fundamental / essential estimation and essential
//!   decomposition with cheirality selection ([`epipolar`]),
//! - normalized DLT homography and its decomposition into motion candidates
//!   ([`homography`]),
//! - multi-view DLT triangulation and a RANSAC triangulator ([`triangulation`]),
//! - RANSAC estimators for two-view verification ([`two_view`]).
//!
//! All solvers are deterministic and return typed errors instead of panicking.

pub mod epipolar;
pub mod homography;
pub mod math;
pub mod triangulation;
pub mod two_view;

pub use epipolar::*;
pub use homography::*;
pub use triangulation::*;
pub use two_view::*;
