//! Configuration Management
//!
//! All protocol timings and limits live in [`StreamConfig`]; the defaults are
//! the values the feed was tuned against, and each one can be overridden from
//! the environment at startup.

pub mod stream;

// Re-export
pub use stream::StreamConfig;
