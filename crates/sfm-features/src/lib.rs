//! Keypoint detection, description and matching.
//!
//! The default pipeline front-end detects Harris corners, describes them with
//! 256-bit oriented BRIEF descriptors and matches descriptors by Hamming
//! distance, optionally requiring mutual nearest neighbours.

pub mod brief;
pub mod extractor;
pub mod harris;
pub mod matcher;

pub use brief::Brief;
pub use extractor::{FeatureExtractor, HarrisBriefExtractor};
pub use harris::{detect_harris, harris_response, HarrisOptions};
pub use matcher::{MatchFilter, Matcher, OneWayMatcher, TwoWayMatcher};
