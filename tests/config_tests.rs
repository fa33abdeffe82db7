//! Configuration loading and validation tests.

use std::sync::Mutex;
use std::time::Duration;

use supplyline::supply::SupplyConfig;

// Environment variables are process-global; serialize the tests that touch
// them.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_supply_env() {
    for var in [
        "SUPPLY_CACHE_ID",
        "SUPPLY_BATCH_SIZE_BYTES",
        "SUPPLY_BATCHES_PER_TURN",
        "SUPPLY_THROTTLE_MS",
        "SUPPLY_WORKER_SLOTS",
    ] {
        std::env::remove_var(var);
    }
}

#[test]
fn test_from_env_defaults_when_unset() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_supply_env();

    let config = SupplyConfig::from_env();
    let defaults = SupplyConfig::default();

    assert_eq!(config.cache_id, defaults.cache_id);
    assert_eq!(config.batch_size_bytes, defaults.batch_size_bytes);
    assert_eq!(config.batches_per_turn, defaults.batches_per_turn);
    assert_eq!(config.throttle, defaults.throttle);
    assert_eq!(config.worker_slots, defaults.worker_slots);
}

#[test]
fn test_from_env_reads_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_supply_env();

    std::env::set_var("SUPPLY_CACHE_ID", "17");
    std::env::set_var("SUPPLY_BATCH_SIZE_BYTES", "2048");
    std::env::set_var("SUPPLY_BATCHES_PER_TURN", "4");
    std::env::set_var("SUPPLY_THROTTLE_MS", "25");
    std::env::set_var("SUPPLY_WORKER_SLOTS", "8");

    let config = SupplyConfig::from_env();
    clear_supply_env();

    assert_eq!(config.cache_id, 17);
    assert_eq!(config.batch_size_bytes, 2048);
    assert_eq!(config.batches_per_turn, 4);
    assert_eq!(config.throttle, Duration::from_millis(25));
    assert_eq!(config.worker_slots, 8);
}

#[test]
fn test_from_env_ignores_unparsable_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_supply_env();

    std::env::set_var("SUPPLY_BATCH_SIZE_BYTES", "not-a-number");

    let config = SupplyConfig::from_env();
    clear_supply_env();

    assert_eq!(
        config.batch_size_bytes,
        SupplyConfig::default().batch_size_bytes
    );
}

#[test]
fn test_validation_catches_zero_knobs() {
    assert!(SupplyConfig::default().validate().is_ok());
    assert!(SupplyConfig::default().with_batch_size(0).validate().is_err());
    assert!(
        SupplyConfig::default()
            .with_batches_per_turn(0)
            .validate()
            .is_err()
    );
    assert!(SupplyConfig::default().with_worker_slots(0).validate().is_err());
}

#[test]
fn test_builder_chain_preserves_unrelated_fields() {
    let config = SupplyConfig::for_cache(9)
        .with_throttle(Duration::from_millis(100))
        .with_batches_per_turn(7);

    assert_eq!(config.cache_id, 9);
    assert_eq!(config.throttle, Duration::from_millis(100));
    assert_eq!(config.batches_per_turn, 7);
    assert_eq!(
        config.batch_size_bytes,
        SupplyConfig::default().batch_size_bytes
    );
}
