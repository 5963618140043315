//! API for the remote document store.
//!
//! The remote is a black box to the engine: a per-organization namespaced
//! collection service with batched atomic writes, server-assigned
//! timestamps, atomic field increments, and an `appliedOps` ledger keyed by
//! operation id. Everything the sync layer needs is expressed here; nothing
//! about a concrete vendor SDK leaks in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tillsync_types::error::ErrorCode;
use tillsync_types::{Collection, EntityId, OpId};

/// How a remote failure counts against retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 4xx-semantic: retrying the same payload will keep failing. Counts
    /// against the small retry budget; exhaustion dead-letters the item.
    Real,
    /// Transport-level or transient: timeouts, 5xx, throttling. Counts
    /// against the generous budget with a gentler backoff.
    Network,
}

/// Errors surfaced by a remote store implementation.
///
/// `Clone` so test harnesses can script failure sequences.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Classifies the failure for retry accounting. Unknown errors are
    /// treated conservatively as network failures.
    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::NotFound(_)
            | RemoteError::Unauthorized(_)
            | RemoteError::Invalid(_)
            | RemoteError::Conflict(_)
            | RemoteError::QuotaExceeded(_) => FailureClass::Real,
            RemoteError::Timeout(_)
            | RemoteError::Unavailable(_)
            | RemoteError::RateLimited(_)
            | RemoteError::Connection(_)
            | RemoteError::Other(_) => FailureClass::Network,
        }
    }
}

impl ErrorCode for RemoteError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "REMOTE_NOT_FOUND",
            Self::Unauthorized(_) => "REMOTE_UNAUTHORIZED",
            Self::Invalid(_) => "REMOTE_INVALID",
            Self::Conflict(_) => "REMOTE_CONFLICT",
            Self::QuotaExceeded(_) => "REMOTE_QUOTA_EXCEEDED",
            Self::Timeout(_) => "REMOTE_TIMEOUT",
            Self::Unavailable(_) => "REMOTE_UNAVAILABLE",
            Self::RateLimited(_) => "REMOTE_RATE_LIMITED",
            Self::Connection(_) => "REMOTE_CONNECTION",
            Self::Other(_) => "REMOTE_OTHER",
        }
    }
}

/// One document from a collection snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDoc {
    /// The document key — equal to the entity's logical id.
    pub id: EntityId,
    pub data: serde_json::Value,
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum RemoteWrite {
    /// Create or replace a document at the engine's logical key. The store
    /// stamps `updatedAt` with its own clock on commit.
    Set {
        collection: Collection,
        id: EntityId,
        data: serde_json::Value,
    },
    /// Shallow field merge into an existing (or new) document.
    Merge {
        collection: Collection,
        id: EntityId,
        data: serde_json::Value,
    },
    /// Atomic numeric field increment (stock, balance, totals).
    Increment {
        collection: Collection,
        id: EntityId,
        field: String,
        delta: i64,
    },
    Delete {
        collection: Collection,
        id: EntityId,
    },
    /// Append to a per-document delta subcollection (`stockDeltas`,
    /// `balanceDeltas`).
    AppendDelta {
        collection: Collection,
        parent_id: EntityId,
        subcollection: String,
        id: String,
        data: serde_json::Value,
    },
    /// Record an operation id in the `appliedOps` ledger.
    MarkApplied { op_id: OpId },
}

/// A group of writes committed atomically: all land or none do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub writes: Vec<RemoteWrite>,
}

impl RemoteBatch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn push(&mut self, write: RemoteWrite) {
        self.writes.push(write);
    }
}

/// The remote document store seam.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Full snapshot of one collection for the organization.
    async fn snapshot(
        &self,
        org_id: &str,
        collection: Collection,
    ) -> Result<Vec<RemoteDoc>, RemoteError>;

    /// Existence check by key, for upsert-dependency decisions.
    async fn exists(
        &self,
        org_id: &str,
        collection: Collection,
        id: &str,
    ) -> Result<bool, RemoteError>;

    /// Which of the given operation ids are already recorded in the
    /// `appliedOps` ledger.
    async fn applied_ops(
        &self,
        org_id: &str,
        op_ids: &[OpId],
    ) -> Result<HashSet<OpId>, RemoteError>;

    /// Atomically commits a batch of writes.
    async fn commit(&self, org_id: &str, batch: RemoteBatch) -> Result<(), RemoteError>;
}
