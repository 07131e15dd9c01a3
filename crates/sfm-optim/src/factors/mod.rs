//! Backend-independent residual models, generic over the scalar for autodiff.

pub mod prior;
pub mod reprojection;
pub mod rotation;
