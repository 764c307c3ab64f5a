//! Short-TTL cache for batch candle results
//!
//! Keyed by (symbol, timeframe, bar count). Expiry is checked lazily on
//! read; there is no eviction task, so the map grows with the distinct key
//! set (fine at this scale, a caveat if the symbol universe gets large).
//! Empty results are cached too, which suppresses repeated live-stream
//! round trips for illiquid or invalid symbols.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::dxlink::types::{Candle, Timeframe};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: String,
    timeframe: Timeframe,
    bars: usize,
}

struct CacheEntry {
    candles: Vec<Candle>,
    inserted_at: Instant,
}

/// TTL cache of batch fetch results.
pub struct ResultCache {
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached candle list if present and younger than the TTL.
    pub async fn get(&self, symbol: &str, timeframe: Timeframe, bars: usize) -> Option<Vec<Candle>> {
        let key = CacheKey {
            symbol: symbol.to_string(),
            timeframe,
            bars,
        };
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            debug!(symbol = %symbol, timeframe = %timeframe, bars, "Cache entry expired");
            return None;
        }
        Some(entry.candles.clone())
    }

    /// Unconditional overwrite, stamped with the current time.
    pub async fn put(&self, symbol: &str, timeframe: Timeframe, bars: usize, candles: Vec<Candle>) {
        let key = CacheKey {
            symbol: symbol.to_string(),
            timeframe,
            bars,
        };
        self.entries.write().await.insert(
            key,
            CacheEntry {
                candles,
                inserted_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(symbol: &str, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M5,
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hit_within_ttl_returns_identical_result() {
        let cache = ResultCache::new(Duration::from_secs(55));
        let candles = vec![candle("AAPL", 185.0)];
        cache.put("AAPL", Timeframe::M5, 100, candles.clone()).await;
        assert_eq!(cache.get("AAPL", Timeframe::M5, 100).await, Some(candles));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_ttl() {
        let cache = ResultCache::new(Duration::from_secs(55));
        cache.put("AAPL", Timeframe::M5, 100, vec![]).await;
        tokio::time::advance(Duration::from_secs(54)).await;
        assert!(cache.get("AAPL", Timeframe::M5, 100).await.is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("AAPL", Timeframe::M5, 100).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_results_are_cached() {
        let cache = ResultCache::new(Duration::from_secs(55));
        cache.put("NOSUCH", Timeframe::M5, 50, vec![]).await;
        assert_eq!(cache.get("NOSUCH", Timeframe::M5, 50).await, Some(vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn key_includes_bars_and_timeframe() {
        let cache = ResultCache::new(Duration::from_secs(55));
        cache.put("AAPL", Timeframe::M5, 100, vec![candle("AAPL", 1.0)]).await;
        assert!(cache.get("AAPL", Timeframe::M5, 50).await.is_none());
        assert!(cache.get("AAPL", Timeframe::M1, 100).await.is_none());
    }
}
