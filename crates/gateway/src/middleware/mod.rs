//! Request middleware and extractors

pub mod identity;
pub mod metrics;
pub mod rate_limit;
