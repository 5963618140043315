#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! Core data structures and error types for the tillsync kernel.
//!
//! Everything that is persisted locally, queued for the remote, or exchanged
//! between engine components is defined here: the shop entities, the
//! operation and bundle model, the vector clock, the outbox records, the
//! storage key map, and the error taxonomy.

pub mod app;
pub mod clock;
pub mod error;
pub mod keys;
pub mod time;

pub use app::*;
pub use clock::{ClockOrdering, VectorClock};

/// Monetary amount in minor units (e.g. pence). Signed: negative amounts on
/// a charge reduce a player's outstanding debt.
pub type Money = i64;

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Stable per-install device identifier (a UUIDv4 string, minted once).
pub type DeviceId = String;

/// Logical entity identifier. Equal to the remote document key, end-to-end.
pub type EntityId = String;

/// Globally unique operation identifier, the basis of remote idempotency.
/// Free-standing operations carry a UUIDv4; bundle steps carry a stable hash
/// of `(bundle_id, step_name)` so a retried bundle never mints fresh ids.
pub type OpId = String;
