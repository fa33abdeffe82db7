//! Centralized configuration constants.
//!
//! This module consolidates the default values for every supply knob so they
//! can be understood and updated in one place.
//!
//! # Categories
//!
//! - **Batch Constants**: outbound batch sizing and turn budgets
//! - **Sizing Estimates**: conservative per-entry and per-message overheads
//! - **Worker Constants**: demander-side worker slot accounting

// =============================================================================
// Batch Constants
// =============================================================================

/// Default cut-off for an outbound supply batch, in bytes.
///
/// A batch is closed once its estimated size reaches this limit. The entry
/// that crosses the limit is still admitted, so the wire message may exceed
/// this value by at most one entry.
pub const DEFAULT_BATCH_SIZE_BYTES: usize = 512 * 1024;

/// Default number of batches a *fresh* demand may stream in one turn.
///
/// A resumed demand always gets exactly one batch per turn regardless of this
/// value, so a single demander cannot monopolise the supplier.
pub const DEFAULT_BATCHES_PER_TURN: u64 = 2;

/// Default inter-batch throttle in milliseconds. Zero disables throttling.
pub const DEFAULT_THROTTLE_MS: u64 = 0;

// =============================================================================
// Sizing Estimates
// =============================================================================
//
// The builder never serializes entries to measure them; it keeps a running
// upper bound. These overheads cover the envelope around raw key/value bytes.

/// Estimated fixed envelope per entry: partition tag, version, ttl,
/// expire time, and the two length prefixes.
pub const ENTRY_OVERHEAD_BYTES: usize = 40;

/// Estimated fixed header of a supply message: worker slot, update sequence,
/// keyspace id, topology version, and the missed/last marker sets.
pub const MESSAGE_HEADER_BYTES: usize = 64;

// =============================================================================
// Worker Constants
// =============================================================================

/// Default number of demander-side worker slots.
///
/// Each demander runs this many rebalance workers; one `(demander, slot)`
/// pair has at most one outstanding demand. Topology cleanup iterates all
/// slots for a departed node.
pub const DEFAULT_WORKER_SLOTS: usize = 2;
