//! Observability and structured logging for the tillsync kernel.

pub mod init;

pub use init::{init_tracing, LogFormat};
