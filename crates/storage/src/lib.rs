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

//! Pure-Rust persistent key-value storage (redb) for the tillsync kernel.
//!
//! One blob table, one write transaction per save. redb gives the per-key
//! atomicity the cache layer requires: a crash mid-write leaves the previous
//! blob intact, never a torn one.

pub mod redb_kv;

pub use redb_kv::RedbKv;
