use std::time::Duration;

use anyhow::bail;

use crate::datacenter::address::ProxyConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// number of most recently received message ids remembered for duplicate detection
    pub duplicate_window: usize,
    /// received message ids older than this (relative to corrected local time) reset the session
    pub max_past_skew: Duration,
    /// received message ids further in the future than this reset the session
    pub max_future_skew: Duration,

    pub ack_debounce_delay: Duration,
    /// acks are flushed immediately once this many are owed to the peer
    pub ack_flush_threshold: usize,
    /// unacknowledged outgoing messages beyond this reset the session
    pub max_pending_messages: usize,

    pub compression_threshold: usize,
    pub max_message_size: usize,
    /// this many undecodable frames in a row replace the connection
    pub max_consecutive_decode_errors: u32,

    pub ping_interval: Duration,
    pub ping_timeout: Duration,

    /// after the first successful connection attempt, further successes within this window
    ///  compete on address order rather than speed
    pub race_grace_period: Duration,
    pub connect_timeout: Duration,
    pub probe_candidates: bool,
    pub probe_timeout: Duration,
    pub max_discovery_rounds: u32,
    pub proxies: Vec<ProxyConfig>,

    pub max_migrations: u32,
    /// flood waits longer than this are surfaced to the caller instead of waited out
    pub max_flood_wait: Duration,
    pub internal_error_retry_delay: Duration,
    pub max_internal_retries: u32,

    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_factor_eighths: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::new()
    }
}

impl EngineConfig {
    pub fn new() -> EngineConfig {
        EngineConfig {
            duplicate_window: 256,
            max_past_skew: Duration::from_secs(300),
            max_future_skew: Duration::from_secs(30),
            ack_debounce_delay: Duration::from_millis(150),
            ack_flush_threshold: 16,
            max_pending_messages: 1024,
            compression_threshold: 512,
            max_message_size: 1024 * 1024,
            max_consecutive_decode_errors: 3,
            ping_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(10),
            race_grace_period: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            probe_candidates: false,
            probe_timeout: Duration::from_secs(2),
            max_discovery_rounds: 2,
            proxies: Vec::new(),
            max_migrations: 5,
            max_flood_wait: Duration::from_secs(300),
            internal_error_retry_delay: Duration::from_secs(1),
            max_internal_retries: 3,
            reconnect_initial_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_factor_eighths: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.duplicate_window == 0 {
            bail!("duplicate window must not be empty");
        }
        if self.ack_flush_threshold == 0 {
            bail!("ack flush threshold must be at least 1");
        }
        if self.max_pending_messages == 0 {
            bail!("max pending messages must be at least 1");
        }
        if self.max_message_size < 1024 || self.max_message_size > 0x00FF_FFFF {
            bail!("max message size must be between 1 KiB and 16 MiB");
        }
        if self.max_consecutive_decode_errors == 0 {
            bail!("max consecutive decode errors must be at least 1");
        }
        if self.ping_interval.is_zero() || self.ping_timeout.is_zero() {
            bail!("ping interval and timeout must be positive");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        if self.reconnect_factor_eighths < 8 {
            bail!("reconnect backoff factor must be at least 1 (8 eighths)");
        }
        if self.reconnect_initial_delay > self.reconnect_max_delay {
            bail!("reconnect initial delay exceeds max delay");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::new().validate().unwrap();
    }

    #[rstest]
    #[case::duplicate_window(|c: &mut EngineConfig| c.duplicate_window = 0)]
    #[case::ack_threshold(|c: &mut EngineConfig| c.ack_flush_threshold = 0)]
    #[case::pending(|c: &mut EngineConfig| c.max_pending_messages = 0)]
    #[case::message_size_small(|c: &mut EngineConfig| c.max_message_size = 100)]
    #[case::message_size_large(|c: &mut EngineConfig| c.max_message_size = 32 * 1024 * 1024)]
    #[case::decode_errors(|c: &mut EngineConfig| c.max_consecutive_decode_errors = 0)]
    #[case::ping(|c: &mut EngineConfig| c.ping_timeout = Duration::ZERO)]
    #[case::connect_timeout(|c: &mut EngineConfig| c.connect_timeout = Duration::ZERO)]
    #[case::factor(|c: &mut EngineConfig| c.reconnect_factor_eighths = 7)]
    #[case::backoff_range(|c: &mut EngineConfig| c.reconnect_initial_delay = Duration::from_secs(60))]
    fn test_validate_rejects(#[case] tweak: fn(&mut EngineConfig)) {
        let mut config = EngineConfig::new();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }
}
