//! Global motion averaging over a view-graph.
//!
//! Rotation averaging turns relative rotations `i2Ri1` into absolute
//! rotations `wRi`; translation averaging turns relative translation
//! directions plus absolute rotations into camera centres. Rotations are
//! solved per connected component, centres per parallel-rigid component,
//! and each component is anchored independently.

pub mod rotation;
pub mod translation;

pub use rotation::{
    RotationAveraging, RotationAveragingResult, RotationMeasurement, ShonanOptions,
    ShonanRotationAveraging, SpanningTreeRotationAveraging,
};
pub use translation::{
    LinearTranslationAveraging, OneDSfmOptions, OneDSfmTranslationAveraging, TranslationAveraging,
    TranslationAveragingResult,
};
