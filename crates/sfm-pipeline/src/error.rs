use sfm_core::ImageError;
use thiserror::Error;

/// Fatal pipeline failures.
///
/// Only malformed input and inconsistent configuration are fatal; every
/// recoverable condition (rejected pairs, failed tracks, disconnected
/// view-graphs, solver non-convergence) is reported in the result instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("image {index} is invalid: {reason}")]
    InvalidImage {
        index: usize,
        #[source]
        reason: ImageError,
    },
    #[error("keypoints of image {index} are invalid: {reason}")]
    InvalidKeypoints { index: usize, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}
