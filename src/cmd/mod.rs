//! CLI command implementations for rtcshare.

pub mod query;
pub mod start;
