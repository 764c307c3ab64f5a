//! Historical candle retrieval
//!
//! Batched snapshots over the live stream (`batch`) guarded by a short-TTL
//! result cache (`cache`).

pub mod batch;
pub mod cache;

pub use batch::{CandleBatchCoordinator, CandleFeed};
pub use cache::ResultCache;
