//! Owns the ordered indexer set and the on-disk index root for one vault.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use crate::chunk::ChunkManager;
use crate::error::GlError;
use crate::id::ChunkId;
use crate::index::attr_index::{AttrKeyIndexer, AttrKvIndexer, AttrValueIndexer};
use crate::index::build::{self, BuildError, Indexer};
use crate::index::format::{self, IndexType};
use crate::index::inverted::{decode_composite, decode_simple};
use crate::index::kv_index::{KvKeyIndexer, KvKvIndexer, KvValueIndexer};
use crate::index::time_index::{self, TimeIndexer};
use crate::index::token_index::TokenIndexer;

/// Builds and opens the eight index types for every sealed chunk of one
/// vault, rooted at `<vault index dir>/<chunk id>/<type>.idx`.
pub struct IndexManager {
    root: PathBuf,
    indexers: Vec<Box<dyn Indexer>>,
}

impl IndexManager {
    pub fn new(root: PathBuf, time_sparsity: u64, kv_budget: usize) -> Self {
        let indexers: Vec<Box<dyn Indexer>> = vec![
            Box::new(TimeIndexer { sparsity: time_sparsity }),
            Box::new(TokenIndexer),
            Box::new(AttrKeyIndexer),
            Box::new(AttrValueIndexer),
            Box::new(AttrKvIndexer),
            Box::new(KvKeyIndexer { budget: kv_budget }),
            Box::new(KvValueIndexer { budget: kv_budget }),
            Box::new(KvKvIndexer { budget: kv_budget }),
        ];
        Self { root, indexers }
    }

    fn chunk_dir(&self, chunk_id: ChunkId) -> PathBuf {
        self.root.join(chunk_id.to_string())
    }

    /// Builds every index type for `chunk_id` and publishes them atomically.
    /// Refuses unsealed chunks; idempotent on re-invocation.
    pub fn build_indexes(
        &self,
        chunk_manager: &dyn ChunkManager,
        chunk_id: ChunkId,
        cancelled: &AtomicBool,
    ) -> Result<(), BuildError> {
        let dir = self.chunk_dir(chunk_id);
        build::build_indexes(&dir, chunk_manager, chunk_id, &self.indexers, cancelled)
    }

    /// True once every index type has a published file for `chunk_id`.
    /// Also sweeps orphan temp files left by a crashed or cancelled build.
    pub fn indexes_complete(&self, chunk_id: ChunkId) -> bool {
        let dir = self.chunk_dir(chunk_id);
        let mut complete = true;
        for indexer in &self.indexers {
            format::clean_orphan_temp_files(&dir, indexer.index_type());
            if !dir.join(indexer.index_type().file_name()).exists() {
                complete = false;
            }
        }
        complete
    }

    fn load(&self, chunk_id: ChunkId, index_type: IndexType) -> Result<(u8, u64, Vec<u8>), GlError> {
        let path = self.chunk_dir(chunk_id).join(index_type.file_name());
        if !path.exists() {
            return Err(GlError::IndexNotBuilt(chunk_id));
        }
        let (header, entries) = format::load(&path, index_type)?;
        Ok((header.flags, header.entry_count, entries))
    }

    pub fn open_time_index(&self, chunk_id: ChunkId) -> Result<Vec<(i64, u64)>, GlError> {
        let (_, count, entries) = self.load(chunk_id, IndexType::Time)?;
        time_index::decode_entries(count, &entries)
    }

    pub fn open_token_index(&self, chunk_id: ChunkId) -> Result<BTreeMap<String, Vec<u64>>, GlError> {
        let (_, _, entries) = self.load(chunk_id, IndexType::Token)?;
        decode_simple(&entries)
    }

    pub fn open_attr_key_index(&self, chunk_id: ChunkId) -> Result<BTreeMap<String, Vec<u64>>, GlError> {
        let (_, _, entries) = self.load(chunk_id, IndexType::AttrKey)?;
        decode_simple(&entries)
    }

    pub fn open_attr_value_index(&self, chunk_id: ChunkId) -> Result<BTreeMap<String, Vec<u64>>, GlError> {
        let (_, _, entries) = self.load(chunk_id, IndexType::AttrValue)?;
        decode_simple(&entries)
    }

    pub fn open_attr_kv_index(&self, chunk_id: ChunkId) -> Result<BTreeMap<(String, String), Vec<u64>>, GlError> {
        let (_, _, entries) = self.load(chunk_id, IndexType::AttrKv)?;
        decode_composite(&entries)
    }

    /// `(index, truncated)` — truncated mirrors the `FLAG_TRUNCATED` bit set
    /// by the kv indexers when a record's `Raw` exceeded the scan budget.
    pub fn open_kv_key_index(&self, chunk_id: ChunkId) -> Result<(BTreeMap<String, Vec<u64>>, bool), GlError> {
        let (flags, _, entries) = self.load(chunk_id, IndexType::KvKey)?;
        Ok((decode_simple(&entries)?, flags & crate::index::kv_index::FLAG_TRUNCATED != 0))
    }

    pub fn open_kv_value_index(&self, chunk_id: ChunkId) -> Result<(BTreeMap<String, Vec<u64>>, bool), GlError> {
        let (flags, _, entries) = self.load(chunk_id, IndexType::KvValue)?;
        Ok((decode_simple(&entries)?, flags & crate::index::kv_index::FLAG_TRUNCATED != 0))
    }

    pub fn open_kv_kv_index(&self, chunk_id: ChunkId) -> Result<(BTreeMap<(String, String), Vec<u64>>, bool), GlError> {
        let (flags, _, entries) = self.load(chunk_id, IndexType::KvKv)?;
        Ok((decode_composite(&entries)?, flags & crate::index::kv_index::FLAG_TRUNCATED != 0))
    }
}
