//! Runtime configuration (spec §6). Every field has a default matching the
//! spec's configuration table; `Config::from_env` overlays `STREAMER_`-prefixed
//! environment variables for production wiring, mirroring how the ambient
//! stack layers env config over defaults.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub async_threshold_ms: u64,

    pub send_retry_attempts: u32,
    pub send_retry_base_ms: u64,
    pub send_retry_cap_ms: u64,

    pub broadcast_workers: usize,

    pub circuit_threshold: u32,
    pub circuit_window_ms: u64,
    pub circuit_cooldown_ms: u64,

    pub batcher_interval_ms: u64,
    pub batcher_max_batch: usize,
    pub batcher_flush_threshold_pct: f64,
    pub batcher_queue_capacity: usize,

    pub processor_max_duration_ms: u64,
    pub processor_parallelism: usize,

    pub connection_ttl_hours: u64,
    pub request_ttl_days: u64,
    pub max_channels_per_user: usize,

    /// TTL of the Delivery Manager's in-memory endpoint cache (spec §4.1).
    pub endpoint_cache_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            async_threshold_ms: 5_000,

            send_retry_attempts: 3,
            send_retry_base_ms: 100,
            send_retry_cap_ms: 5_000,

            broadcast_workers: 10,

            circuit_threshold: 5,
            circuit_window_ms: 30_000,
            circuit_cooldown_ms: 15_000,

            batcher_interval_ms: 100,
            batcher_max_batch: 10,
            batcher_flush_threshold_pct: 95.0,
            batcher_queue_capacity: 100,

            processor_max_duration_ms: 900_000,
            processor_parallelism: 10,

            connection_ttl_hours: 24,
            request_ttl_days: 7,
            max_channels_per_user: 10,

            endpoint_cache_ttl_secs: 60,
        }
    }
}

impl Config {
    pub fn async_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.async_threshold_ms)
    }

    pub fn processor_max_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.processor_max_duration_ms)
    }

    /// Overlay `STREAMER_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("STREAMER_").from_env::<Config>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.async_threshold_ms, 5_000);
        assert_eq!(cfg.circuit_threshold, 5);
        assert_eq!(cfg.batcher_flush_threshold_pct, 95.0);
        assert_eq!(cfg.max_channels_per_user, 10);
    }
}
