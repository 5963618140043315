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

//! Offline-first synchronization engine for a small-shop point-of-sale.
//!
//! The engine accepts mutations while disconnected, folds the uncommitted
//! ones over the base cache for reads, reconciles them atomically against a
//! remote document store when connectivity returns, and keeps devices
//! sharing one organization causally consistent through vector clocks and
//! additive merges.
//!
//! Construction wires the three external seams — a durable [`KvStore`]
//! (blobs), a [`RemoteStore`] (the black-box document service), and a
//! [`NetworkMonitor`] — and spawns the background cadences. All writes
//! funnel through one internal path, so cache, overlays, and outbox never
//! drift apart.
//!
//! [`KvStore`]: tillsync_api::KvStore
//! [`RemoteStore`]: tillsync_api::RemoteStore
//! [`NetworkMonitor`]: tillsync_api::NetworkMonitor

mod applier;
mod bundle;
mod cache;
mod clock;
pub mod config;
mod drain;
mod engine;
mod hydrator;
mod outbox;
mod provisional;
mod resolver;
mod scheduler;

pub use config::EngineConfig;
pub use drain::DrainOutcome;
pub use engine::{
    ChargeRequest, NewPlayer, NewProduct, NewReport, NewStaffUser, SaleRequest, SyncEngine,
};
pub use provisional::WithOverlay;
