// Library exports for dxlink-provider

pub mod config; // Configuration management
pub mod error;
pub mod ports; // External collaborator interfaces

pub mod dxlink; // Streaming protocol client
pub mod history; // Batched historical candle retrieval

pub mod provider; // Operational facade

pub use error::{DxLinkError, Result};
pub use provider::MarketDataProvider;
