//! Streaming client configuration
//!
//! Timings and limits for the DXLink session: handshake bounds, keepalive and
//! health-check cadence, reconnect backoff, and the batch-fetch completion
//! heuristic. Defaults match the values the protocol client was tuned
//! against; the session-level timings can be overridden via `DXLINK_*`
//! environment variables (see [`StreamConfig::from_env`]), while the
//! batch-heuristic constants are compiled defaults.

use std::time::Duration;

/// Configuration for the streaming session and the batch candle fetch.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Bounded wait for the connect handshake to reach ready state.
    pub connect_timeout: Duration,

    /// Interval between client KEEPALIVE messages on the control channel.
    pub keepalive_interval: Duration,

    /// Keepalive timeout advertised in the SETUP message, in seconds.
    pub keepalive_timeout_secs: u64,

    /// Interval between connection health checks.
    pub health_check_interval: Duration,

    /// First reconnect delay; doubles per attempt.
    pub reconnect_base: Duration,

    /// Upper bound on the reconnect delay.
    pub reconnect_cap: Duration,

    /// Attempts before the reconnection machine gives up permanently.
    pub max_reconnect_attempts: u32,

    /// Time-to-live for cached batch results.
    pub cache_ttl: Duration,

    /// Cadence at which the batch fetch evaluates its completion conditions.
    pub batch_poll_interval: Duration,

    /// Quiet poll ticks (after at least one event) that end the batch wait.
    pub batch_stability_ticks: u32,

    /// Base of the absolute batch-wait ceiling.
    pub batch_base_timeout: Duration,

    /// Ceiling increment per requested symbol.
    pub batch_per_symbol_timeout: Duration,

    /// Hard cap on the batch-wait ceiling.
    pub batch_max_timeout: Duration,

    /// Extra bars of lookback added to the subscription fromTime, as slack
    /// for incomplete trailing bars.
    pub lookback_margin_bars: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout_secs: 60,
            health_check_interval: Duration::from_secs(60),
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(300),
            max_reconnect_attempts: 10,
            cache_ttl: Duration::from_secs(55),
            batch_poll_interval: Duration::from_secs(1),
            batch_stability_ticks: 3,
            batch_base_timeout: Duration::from_secs(10),
            batch_per_symbol_timeout: Duration::from_secs(2),
            batch_max_timeout: Duration::from_secs(60),
            lookback_margin_bars: 10,
        }
    }
}

impl StreamConfig {
    /// Loads configuration from the environment on top of the defaults.
    ///
    /// Recognized variables (all optional, all plain integers):
    /// `DXLINK_CONNECT_TIMEOUT_SECS`, `DXLINK_KEEPALIVE_SECS`,
    /// `DXLINK_HEALTH_CHECK_SECS`, `DXLINK_RECONNECT_BASE_SECS`,
    /// `DXLINK_RECONNECT_CAP_SECS`, `DXLINK_MAX_RECONNECT_ATTEMPTS`,
    /// `DXLINK_CACHE_TTL_SECS`.
    ///
    /// Returns `Err` with a descriptive message when a variable is present
    /// but not a valid positive integer; bring-up should treat that as fatal.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(secs) = read_secs("DXLINK_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_secs("DXLINK_KEEPALIVE_SECS")? {
            config.keepalive_interval = Duration::from_secs(secs);
            config.keepalive_timeout_secs = secs * 2;
        }
        if let Some(secs) = read_secs("DXLINK_HEALTH_CHECK_SECS")? {
            config.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = read_secs("DXLINK_RECONNECT_BASE_SECS")? {
            config.reconnect_base = Duration::from_secs(secs);
        }
        if let Some(secs) = read_secs("DXLINK_RECONNECT_CAP_SECS")? {
            config.reconnect_cap = Duration::from_secs(secs);
        }
        if let Some(n) = read_secs("DXLINK_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = n as u32;
        }
        if let Some(secs) = read_secs("DXLINK_CACHE_TTL_SECS")? {
            config.cache_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Absolute ceiling for one batch wait, scaled by symbol count.
    pub fn batch_ceiling(&self, symbol_count: usize) -> Duration {
        let scaled =
            self.batch_base_timeout + self.batch_per_symbol_timeout * symbol_count as u32;
        scaled.min(self.batch_max_timeout)
    }
}

fn read_secs(name: &str) -> Result<Option<u64>, String> {
    match std::env::var(name) {
        Ok(raw) => {
            let value: u64 = raw
                .trim()
                .parse()
                .map_err(|_| format!("{} must be a positive integer, got {:?}", name, raw))?;
            if value == 0 {
                return Err(format!("{} must be greater than zero", name));
            }
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_tuning() {
        let config = StreamConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.health_check_interval, Duration::from_secs(60));
        assert_eq!(config.reconnect_base, Duration::from_secs(5));
        assert_eq!(config.reconnect_cap, Duration::from_secs(300));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.cache_ttl, Duration::from_secs(55));
    }

    // One test owns all env manipulation; the other tests in this module
    // never read the environment, so parallel execution is safe.
    #[test]
    fn env_overrides_apply_and_garbage_is_rejected() {
        std::env::set_var("DXLINK_CACHE_TTL_SECS", "120");
        std::env::set_var("DXLINK_RECONNECT_BASE_SECS", "2");
        let config = StreamConfig::from_env().unwrap();
        assert_eq!(config.cache_ttl, Duration::from_secs(120));
        assert_eq!(config.reconnect_base, Duration::from_secs(2));
        // Untouched fields keep their defaults.
        assert_eq!(config.batch_poll_interval, Duration::from_secs(1));

        std::env::set_var("DXLINK_CACHE_TTL_SECS", "soon");
        assert!(StreamConfig::from_env().is_err());
        std::env::set_var("DXLINK_CACHE_TTL_SECS", "0");
        assert!(StreamConfig::from_env().is_err());

        std::env::remove_var("DXLINK_CACHE_TTL_SECS");
        std::env::remove_var("DXLINK_RECONNECT_BASE_SECS");
    }

    #[test]
    fn batch_ceiling_scales_and_caps() {
        let config = StreamConfig::default();
        assert_eq!(config.batch_ceiling(1), Duration::from_secs(12));
        assert_eq!(config.batch_ceiling(5), Duration::from_secs(20));
        // 10 + 2*100 would be 210s; capped at 60s.
        assert_eq!(config.batch_ceiling(100), Duration::from_secs(60));
    }
}
