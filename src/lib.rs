#![cfg_attr(docsrs, feature(doc_cfg))]
//! Fixed window rate limiting for the CMS backend.
//!
//! See [backend::memory] for a server wired with several named limiters.

pub mod backend;
pub mod error;
mod middleware;
pub mod policy;

pub use error::RateLimitError;
pub use middleware::builder::{RateLimitHeaders, RateLimiterBuilder};
pub use middleware::RateLimiter;
