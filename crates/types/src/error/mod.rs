//! Core error types for the tillsync kernel.

use crate::Collection;
use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors from the durable local key-value store. Fatal to the operation in
/// flight: a caller that sees one of these must not assume local durability.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An error originating from the underlying key-value backend.
    #[error("backend error: {0}")]
    Backend(String),
    /// An error occurred while serialising a blob for storage.
    #[error("encode error: {0}")]
    Encode(String),
    /// An error occurred while deserialising a blob from storage.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "STORE_BACKEND_ERROR",
            Self::Encode(_) => "STORE_ENCODE_ERROR",
            Self::Decode(_) => "STORE_DECODE_ERROR",
        }
    }
}

/// Errors surfaced by the engine's public API and write path.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The durable store failed underneath an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A malformed operation or bundle was rejected at construction.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Writes to this collection only travel inside bundles; single
    /// operations on it would silently never reach the remote.
    #[error("collection '{0}' requires a bundle")]
    BundleRequired(Collection),
    /// The operation needs an entity id and none was supplied.
    #[error("operation is missing an entity id")]
    MissingEntityId,
    /// The referenced entity is not in the local cache.
    #[error("unknown entity {id} in '{collection}'")]
    UnknownEntity { collection: Collection, id: String },
    /// A payment bundle was requested with no assignments to settle.
    #[error("payment contains no assignments")]
    EmptyPayment,
    /// No organization context has been set on the engine.
    #[error("organization is not set")]
    NoOrganization,
    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ErrorCode for EngineError {
    fn code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.code(),
            Self::Validation(_) => "ENGINE_VALIDATION_FAILED",
            Self::BundleRequired(_) => "ENGINE_BUNDLE_REQUIRED",
            Self::MissingEntityId => "ENGINE_MISSING_ENTITY_ID",
            Self::UnknownEntity { .. } => "ENGINE_UNKNOWN_ENTITY",
            Self::EmptyPayment => "ENGINE_EMPTY_PAYMENT",
            Self::NoOrganization => "ENGINE_NO_ORGANIZATION",
            Self::Serialization(_) => "ENGINE_SERIALIZATION_ERROR",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
