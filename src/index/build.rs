//! The build helper: iterate a sealed chunk's cursor once, feed every
//! record to every indexer, and commit each indexer's output atomically.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::chunk::ChunkManager;
use crate::error::GlError;
use crate::id::ChunkId;
use crate::index::format::{self, IndexType};
use crate::record::{Record, RecordRef};

/// One indexer: produces one index type for one sealed chunk.
pub trait Indexer: Send + Sync {
    fn name(&self) -> &'static str;
    fn index_type(&self) -> IndexType;
    /// Builds `(flags, entry_count, encoded_entries)` from every record in
    /// a sealed chunk, in append order.
    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>);
}

/// Cancellation flag threaded through a build; checked before each record,
/// matching "hot loops check cancellation before each record".
pub type CancelFlag = AtomicBool;

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Gl(#[from] GlError),
    #[error("index build cancelled")]
    Cancelled,
}

/// Runs every indexer in `indexers` over `chunk_id`'s sealed records and
/// atomically publishes each index file under `index_dir`.
///
/// Refuses to build an unsealed chunk (`ErrChunkNotSealed`, surfaced via
/// `ChunkManager::open_cursor`). Idempotent: a second call overwrites the
/// existing file(s) atomically.
pub fn build_indexes(
    index_dir: &Path,
    chunk_manager: &dyn ChunkManager,
    chunk_id: ChunkId,
    indexers: &[Box<dyn Indexer>],
    cancelled: &CancelFlag,
) -> Result<(), BuildError> {
    let mut cursor = chunk_manager.open_cursor(chunk_id)?;

    let mut records = Vec::new();
    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Err(BuildError::Cancelled);
        }
        match cursor.next()? {
            Some(pair) => records.push(pair),
            None => break,
        }
    }

    for indexer in indexers {
        if cancelled.load(Ordering::Relaxed) {
            format::clean_orphan_temp_files(index_dir, indexer.index_type());
            return Err(BuildError::Cancelled);
        }
        let (flags, entry_count, entries) = indexer.build(&records);
        format::publish(index_dir, indexer.index_type(), flags, entry_count, &entries)?;
    }

    Ok(())
}
