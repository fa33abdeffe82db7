//! Configuration for the supply engine.

use std::time::Duration;

use crate::constants::{
    DEFAULT_BATCHES_PER_TURN, DEFAULT_BATCH_SIZE_BYTES, DEFAULT_THROTTLE_MS, DEFAULT_WORKER_SLOTS,
};
use crate::types::{CacheId, IoPolicy};

/// Tunables for one supplier instance.
///
/// Construct with [`Default`] and adjust with the `with_*` builders, or load
/// from the environment with [`SupplyConfig::from_env`].
#[derive(Debug, Clone)]
pub struct SupplyConfig {
    /// Identifier of the keyspace this supplier serves; echoed on every
    /// supply message.
    pub cache_id: CacheId,

    /// Cut-off for an outbound batch, in bytes. The entry that crosses the
    /// limit is still admitted, so a batch is never closed strictly below it.
    pub batch_size_bytes: usize,

    /// How many batches a fresh demand may stream in one turn. A resumed
    /// demand always gets exactly one.
    pub batches_per_turn: u64,

    /// Sleep between rotated batches. Not applied after the final batch of a
    /// turn. `Duration::ZERO` disables throttling.
    pub throttle: Duration,

    /// Number of demander-side worker slots. Topology cleanup evicts one
    /// context per slot for a departed node.
    pub worker_slots: usize,

    /// Delivery class for outbound batches.
    pub io_policy: IoPolicy,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            cache_id: 0,
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            batches_per_turn: DEFAULT_BATCHES_PER_TURN,
            throttle: Duration::from_millis(DEFAULT_THROTTLE_MS),
            worker_slots: DEFAULT_WORKER_SLOTS,
            io_policy: IoPolicy::Rebalance,
        }
    }
}

impl SupplyConfig {
    /// Config for the given keyspace with all defaults.
    pub fn for_cache(cache_id: CacheId) -> Self {
        Self {
            cache_id,
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, bytes: usize) -> Self {
        self.batch_size_bytes = bytes;
        self
    }

    pub fn with_batches_per_turn(mut self, batches: u64) -> Self {
        self.batches_per_turn = batches;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_worker_slots(mut self, slots: usize) -> Self {
        self.worker_slots = slots;
        self
    }

    /// Load overrides from the environment on top of defaults.
    ///
    /// Recognized variables, all optional:
    /// - `SUPPLY_CACHE_ID`
    /// - `SUPPLY_BATCH_SIZE_BYTES`
    /// - `SUPPLY_BATCHES_PER_TURN`
    /// - `SUPPLY_THROTTLE_MS`
    /// - `SUPPLY_WORKER_SLOTS`
    ///
    /// Unparsable values fall back to the default for that knob.
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok().and_then(|v| v.parse().ok())
        }

        let defaults = Self::default();
        Self {
            cache_id: parse("SUPPLY_CACHE_ID").unwrap_or(defaults.cache_id),
            batch_size_bytes: parse("SUPPLY_BATCH_SIZE_BYTES")
                .unwrap_or(defaults.batch_size_bytes),
            batches_per_turn: parse("SUPPLY_BATCHES_PER_TURN")
                .unwrap_or(defaults.batches_per_turn),
            throttle: parse("SUPPLY_THROTTLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.throttle),
            worker_slots: parse("SUPPLY_WORKER_SLOTS").unwrap_or(defaults.worker_slots),
            io_policy: defaults.io_policy,
        }
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        // A batch that can never dip below the cut-off would suspend without
        // making progress.
        if self.batch_size_bytes <= crate::constants::MESSAGE_HEADER_BYTES {
            return Err(format!(
                "batch_size_bytes must exceed the {}-byte message header",
                crate::constants::MESSAGE_HEADER_BYTES
            ));
        }
        if self.batches_per_turn == 0 {
            return Err("batches_per_turn must be greater than zero".into());
        }
        if self.worker_slots == 0 {
            return Err("worker_slots must be greater than zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SupplyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size_bytes, DEFAULT_BATCH_SIZE_BYTES);
        assert_eq!(config.batches_per_turn, DEFAULT_BATCHES_PER_TURN);
        assert_eq!(config.throttle, Duration::ZERO);
    }

    #[test]
    fn test_builder_methods() {
        let config = SupplyConfig::for_cache(42)
            .with_batch_size(1024)
            .with_batches_per_turn(5)
            .with_throttle(Duration::from_millis(10))
            .with_worker_slots(4);

        assert_eq!(config.cache_id, 42);
        assert_eq!(config.batch_size_bytes, 1024);
        assert_eq!(config.batches_per_turn, 5);
        assert_eq!(config.throttle, Duration::from_millis(10));
        assert_eq!(config.worker_slots, 4);
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config = SupplyConfig::default().with_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_batch_smaller_than_header() {
        let config = SupplyConfig::default()
            .with_batch_size(crate::constants::MESSAGE_HEADER_BYTES);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batches() {
        let config = SupplyConfig::default().with_batches_per_turn(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_slots() {
        let config = SupplyConfig::default().with_worker_slots(0);
        assert!(config.validate().is_err());
    }
}
