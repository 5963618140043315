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

//! Core traits and APIs for the tillsync kernel.
//!
//! The engine never talks to a concrete storage backend, remote service, or
//! platform network API. It talks to the three seams defined here:
//! [`kv::KvStore`] for durable local blobs, [`remote::RemoteStore`] for the
//! black-box document store, and [`network::NetworkMonitor`] for
//! connectivity.

pub mod kv;
pub mod network;
pub mod remote;
pub mod status;

pub use kv::KvStore;
pub use network::{NetworkMonitor, NetworkState};
pub use remote::{
    FailureClass, RemoteBatch, RemoteDoc, RemoteError, RemoteStore, RemoteWrite,
};
pub use status::SyncStatus;
