//! A vault couples one chunk manager with its index manager and the
//! policies that govern rotation and retention.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use chrono::Utc;

use crate::chunk::{ChunkManager, FileChunkManager, InlineRotation, MemoryChunkManager};
use crate::error::GlError;
use crate::id::{ChunkId, VaultId};
use crate::index::{BuildError, IndexManager};
use crate::policy::{self, RetentionPolicy, RotationPolicy};
use crate::record::{ChunkMeta, Record, RecordRef};

/// Backing store. `Memory` never compresses and loses all data on restart;
/// `File` persists chunks under `dir` and may zstd-compress on seal.
pub enum Backing {
    Memory,
    File { dir: PathBuf },
}

pub struct Vault {
    pub id: VaultId,
    pub name: String,
    enabled: bool,
    compression: bool,
    chunk_manager: Box<dyn ChunkManager>,
    index_manager: IndexManager,
    pub rotation_policies: Vec<RotationPolicy>,
    pub retention_policies: Vec<RetentionPolicy>,
}

impl Vault {
    pub fn new(
        id: VaultId,
        name: String,
        backing: Backing,
        inline_rotation: InlineRotation,
        index_root: PathBuf,
        time_sparsity: u64,
        kv_budget: usize,
        rotation_policies: Vec<RotationPolicy>,
        retention_policies: Vec<RetentionPolicy>,
    ) -> Result<Self, GlError> {
        let chunk_manager: Box<dyn ChunkManager> = match backing {
            Backing::Memory => Box::new(MemoryChunkManager::new(inline_rotation)),
            Backing::File { dir } => Box::new(FileChunkManager::open(dir, false, inline_rotation)?),
        };
        Ok(Self {
            id,
            name,
            enabled: true,
            compression: false,
            chunk_manager,
            index_manager: IndexManager::new(index_root, time_sparsity, kv_budget),
            rotation_policies,
            retention_policies,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Only file-backed vaults can turn on whole-chunk compression; a
    /// memory vault has nothing durable to compress and refuses.
    pub fn set_compression(&mut self, enabled: bool) -> Result<(), GlError> {
        self.chunk_manager.set_compression(enabled)?;
        self.compression = enabled;
        Ok(())
    }

    pub fn append(&self, record: &Record) -> Result<(ChunkId, RecordRef), GlError> {
        self.chunk_manager.append(record)
    }

    pub fn active_chunk_id(&self) -> ChunkId {
        self.chunk_manager.active_chunk_id()
    }

    pub fn seal_active(&self) -> Result<(), GlError> {
        self.chunk_manager.seal()
    }

    pub fn list_chunks(&self) -> Vec<ChunkMeta> {
        self.chunk_manager.list()
    }

    pub fn chunk_meta(&self, id: ChunkId) -> Result<ChunkMeta, GlError> {
        self.chunk_manager.meta(id)
    }

    pub fn chunk_manager(&self) -> &dyn ChunkManager {
        self.chunk_manager.as_ref()
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    /// `true` if any age/record/cron `RotationPolicy` is due. `MaxBytes` is
    /// checked inline by `ChunkManager::append` instead, since waiting for
    /// this method's scheduler-driven polling interval would let a chunk
    /// overshoot its byte budget between ticks.
    pub fn rotation_due(&self) -> Result<bool, GlError> {
        let active_id = self.chunk_manager.active_chunk_id();
        let meta = self.chunk_manager.meta(active_id)?;
        let now = Utc::now();
        Ok(self.rotation_policies.iter().any(|p| p.due(&meta, now)))
    }

    pub fn build_indexes(&self, chunk_id: ChunkId, cancelled: &AtomicBool) -> Result<(), BuildError> {
        self.index_manager.build_indexes(self.chunk_manager.as_ref(), chunk_id, cancelled)
    }

    /// Sealed chunks that the retention policies say should be dropped,
    /// oldest first.
    pub fn chunks_to_prune(&self) -> Vec<ChunkId> {
        let sealed: Vec<_> = self.chunk_manager.list().into_iter().filter(|m| m.sealed).collect();
        policy::chunks_to_prune(&sealed, &self.retention_policies, Utc::now())
    }

    pub fn delete_chunk(&self, id: ChunkId) -> Result<(), GlError> {
        self.chunk_manager.delete(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_vault_rejects_compression() {
        let mut vault = Vault::new(
            VaultId::new(),
            "test".to_string(),
            Backing::Memory,
            InlineRotation::default(),
            std::env::temp_dir().join("gastrolog-vault-test"),
            1,
            4096,
            vec![],
            vec![],
        )
        .unwrap();
        assert_eq!(vault.set_compression(true), Err(GlError::CompressionNotSupported));
        assert!(vault.set_compression(false).is_ok());
    }

    #[test]
    fn disabling_and_enabling_toggles_flag() {
        let mut vault = Vault::new(
            VaultId::new(),
            "test".to_string(),
            Backing::Memory,
            InlineRotation::default(),
            std::env::temp_dir().join("gastrolog-vault-test2"),
            1,
            4096,
            vec![],
            vec![],
        )
        .unwrap();
        assert!(vault.enabled());
        vault.set_enabled(false);
        assert!(!vault.enabled());
    }
}
