//! Typed precondition and integrity errors.
//!
//! Callers that need to match on a specific failure use [`GlError`]; glue
//! code that just propagates failures uses `anyhow::Result` as usual.

use thiserror::Error;

use crate::id::{ChunkId, VaultId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GlError {
    #[error("orchestrator is already running")]
    AlreadyRunning,

    #[error("orchestrator is not running")]
    NotRunning,

    #[error("vault '{0}' not found")]
    VaultNotFound(VaultId),

    #[error("ingester '{0}' not found")]
    IngesterNotFound(String),

    #[error("chunk '{0}' not found")]
    ChunkNotFound(ChunkId),

    #[error("chunk '{0}' is not sealed")]
    ChunkNotSealed(ChunkId),

    #[error("no index has been built yet for chunk '{0}'")]
    IndexNotBuilt(ChunkId),

    #[error("compression can only be set on file vaults")]
    CompressionNotSupported,

    #[error("index signature mismatch")]
    SignatureMismatch,

    #[error("index version mismatch")]
    VersionMismatch,

    #[error("index entry count does not match remaining bytes")]
    EntrySizeMismatch,

    #[error("index file is too small to contain a header")]
    IndexTooSmall,

    #[error("no more records")]
    NoMoreRecords,

    #[error("record is corrupt: {0}")]
    RecordCorrupt(String),
}
