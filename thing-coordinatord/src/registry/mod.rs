pub mod hash;
pub mod staleness;
