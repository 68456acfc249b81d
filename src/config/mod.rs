//! Config DTOs and the collaborator-owned config store interface.
//!
//! The orchestrator never reads configuration off disk itself; it asks a
//! [`ConfigStore`] for a snapshot and reacts to [`Notification`]s pushed by
//! whatever owns the store. [`FileConfigStore`] is the reference
//! implementation: a single `config.json` under the home dir, guarded by an
//! `RwLock` so concurrent readers never block on a writer mid-save.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::id::{IngesterId, NodeId, VaultId};
use crate::policy::{RetentionPolicy, RotationPolicy};

/// Serializable form of `vault::Backing`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackingConfig {
    Memory,
    File { dir: PathBuf },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatcherConfig {
    Equals { key: String, value: String },
    Prefix { key: String, prefix: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterRuleConfig {
    pub matchers: Vec<MatcherConfig>,
    pub targets: Vec<VaultId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultConfig {
    pub id: VaultId,
    pub name: String,
    pub backing: BackingConfig,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub max_records: Option<u64>,
    #[serde(default)]
    pub rotation_policies: Vec<RotationPolicy>,
    #[serde(default)]
    pub retention_policies: Vec<RetentionPolicy>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngesterConfig {
    pub id: IngesterId,
    pub type_name: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { listen: None, settings: HashMap::new() }
    }
}

/// A full configuration snapshot, as returned by `ConfigStore::load`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: Option<NodeConfig>,
    #[serde(default = "default_ingest_buffer")]
    pub ingest_channel_buffer: usize,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_time_sparsity")]
    pub time_index_sparsity: u64,
    #[serde(default = "default_kv_budget")]
    pub kv_index_budget: usize,
    #[serde(default)]
    pub index_root: PathBuf,
    #[serde(default)]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub vaults: Vec<VaultConfig>,
    #[serde(default)]
    pub ingesters: Vec<IngesterConfig>,
    #[serde(default)]
    pub filter_rules: Vec<FilterRuleConfig>,
}

fn default_ingest_buffer() -> usize {
    1024
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_time_sparsity() -> u64 {
    64
}

fn default_kv_budget() -> usize {
    4096
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: None,
            ingest_channel_buffer: default_ingest_buffer(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            time_index_sparsity: default_time_sparsity(),
            kv_index_budget: default_kv_budget(),
            index_root: PathBuf::new(),
            state_dir: PathBuf::new(),
            vaults: Vec::new(),
            ingesters: Vec::new(),
            filter_rules: Vec::new(),
        }
    }
}

/// A change pushed by whatever owns the store, so the orchestrator can react
/// idempotently instead of polling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    VaultPut,
    VaultDeleted,
    FilterPut,
    FilterDeleted,
    RotationPolicyPut,
    RotationPolicyDeleted,
    RetentionPolicyPut,
    RetentionPolicyDeleted,
    IngesterPut,
    IngesterDeleted,
    SettingPut,
    ClusterTlsPut,
}

/// Collaborator-owned configuration source. The orchestrator only ever
/// calls `load` (at `ApplyConfig` time) plus the narrow getters; everything
/// else about how configuration is authored, validated, or distributed
/// across a cluster is this trait's implementer's business.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Config>;
    fn get_vault(&self, id: VaultId) -> anyhow::Result<Option<VaultConfig>>;
    fn get_ingester(&self, id: &str) -> anyhow::Result<Option<IngesterConfig>>;
    fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn load_server_settings(&self) -> anyhow::Result<ServerSettings>;
    fn list_certificates(&self) -> anyhow::Result<Vec<CertificateMeta>>;
    fn get_node(&self) -> anyhow::Result<Option<NodeConfig>>;
    fn put_node(&self, node: NodeConfig) -> anyhow::Result<()>;
}

/// Reference `ConfigStore`: one `config.json` file, read into memory on
/// `load` and cached for the narrow getters. Writers go through
/// `put_node`/tests only; day-to-day config editing is expected to happen
/// by replacing `config.json` out of band and calling `load` again.
pub struct FileConfigStore {
    path: PathBuf,
    cached: RwLock<Config>,
}

impl FileConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let cached = Self::read(&path)?;
        Ok(Self { path, cached: RwLock::new(cached) })
    }

    fn read(path: &Path) -> anyhow::Result<Config> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_locked(&self, cfg: &Config) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(cfg)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> anyhow::Result<Config> {
        let fresh = Self::read(&self.path)?;
        *self.cached.write() = fresh.clone();
        Ok(fresh)
    }

    fn get_vault(&self, id: VaultId) -> anyhow::Result<Option<VaultConfig>> {
        Ok(self.cached.read().vaults.iter().find(|v| v.id == id).cloned())
    }

    fn get_ingester(&self, id: &str) -> anyhow::Result<Option<IngesterConfig>> {
        Ok(self.cached.read().ingesters.iter().find(|i| i.id == id).cloned())
    }

    fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.load_server_settings()?.settings.get(key).cloned())
    }

    fn load_server_settings(&self) -> anyhow::Result<ServerSettings> {
        let settings_path = self.path.with_file_name("settings.json");
        match fs::read(&settings_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerSettings::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_certificates(&self) -> anyhow::Result<Vec<CertificateMeta>> {
        Ok(Vec::new())
    }

    fn get_node(&self) -> anyhow::Result<Option<NodeConfig>> {
        Ok(self.cached.read().node.clone())
    }

    fn put_node(&self, node: NodeConfig) -> anyhow::Result<()> {
        let mut cfg = self.cached.read().clone();
        cfg.node = Some(node);
        self.write_locked(&cfg)?;
        *self.cached.write() = cfg;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::open(dir.path().join("config.json")).unwrap();
        let cfg = store.load().unwrap();
        assert_eq!(cfg.max_concurrent_jobs, 4);
        assert!(cfg.vaults.is_empty());
    }

    #[test]
    fn put_node_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::open(dir.path().join("config.json")).unwrap();
        let node = NodeConfig { id: NodeId::new(), name: "node-a".to_string() };
        store.put_node(node.clone()).unwrap();

        let reopened = FileConfigStore::open(dir.path().join("config.json")).unwrap();
        assert_eq!(reopened.get_node().unwrap().unwrap().name, "node-a");
    }

    #[test]
    fn get_vault_looks_up_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let vault_id = VaultId::new();
        let cfg = Config {
            vaults: vec![VaultConfig {
                id: vault_id,
                name: "primary".to_string(),
                backing: BackingConfig::Memory,
                compression: false,
                max_bytes: None,
                max_records: None,
                rotation_policies: vec![],
                retention_policies: vec![],
            }],
            ..Config::default()
        };
        fs::write(dir.path().join("config.json"), serde_json::to_vec(&cfg).unwrap()).unwrap();

        let store = FileConfigStore::open(dir.path().join("config.json")).unwrap();
        store.load().unwrap();
        assert_eq!(store.get_vault(vault_id).unwrap().unwrap().name, "primary");
        assert!(store.get_vault(VaultId::new()).unwrap().is_none());
    }
}
