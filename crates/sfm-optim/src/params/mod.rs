//! Conversions between domain types and solver parameter vectors.

pub mod calibration;
pub mod pose_se3;
