//! Problem builders that turn domain data into IR and back.

pub mod bundle_adjustment;
