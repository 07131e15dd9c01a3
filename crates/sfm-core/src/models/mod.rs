//! Camera models.
//!
//! `pixel = K ∘ radial ∘ pinhole(R * (X - C))`

mod calibration;
mod distortion;
mod intrinsics;

pub use calibration::{CameraCalibration, DEFAULT_FOCAL_SCALE};
pub use distortion::RadialDistortion;
pub use intrinsics::PinholeIntrinsics;
