//! Wires vaults, ingesters, digesters and the filter set into a running
//! pipeline, and owns the staged start/stop lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chunk::InlineRotation;
use crate::config::{BackingConfig, Config, IngesterConfig, VaultConfig};
use crate::digest::Digester;
use crate::error::GlError;
use crate::filter::{FilterRule, FilterSet, Matcher};
use crate::id::{IngesterId, NodeId, VaultId};
use crate::ingest::{Ingester, IngesterRegistry};
use crate::policy::{RetentionPolicy, RotationPolicy};
use crate::record::{ChunkMeta, DigestedRecord, IngestMessage, Record};
use crate::scheduler::{CancelFlag, Scheduler};
use crate::vault::{Backing, Vault};

/// Running totals kept per ingester, surfaced for observability.
#[derive(Default, Clone, Copy, Debug)]
pub struct IngesterStats {
    pub messages_ingested: u64,
    pub bytes_ingested: u64,
    pub errors: u64,
}

struct IngesterSlot {
    type_name: String,
    ingester: Arc<dyn Ingester>,
    cancel: CancelFlag,
    handle: Option<JoinHandle<()>>,
    stats: Arc<AtomicIngesterStats>,
}

#[derive(Default)]
struct AtomicIngesterStats {
    messages_ingested: AtomicU64,
    bytes_ingested: AtomicU64,
    errors: AtomicU64,
}

impl AtomicIngesterStats {
    fn snapshot(&self) -> IngesterStats {
        IngesterStats {
            messages_ingested: self.messages_ingested.load(Ordering::Relaxed),
            bytes_ingested: self.bytes_ingested.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct RunState {
    ingest_tx: mpsc::Sender<IngestMessage>,
    digest_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

/// All mutable configuration and runtime state the pipeline needs. Guarded
/// by a single `RwLock`: reads (routing, stats) are far more frequent than
/// writes (config changes), and no operation needs to hold it across an
/// await point.
struct State {
    vaults: HashMap<VaultId, Vault>,
    ingesters: HashMap<IngesterId, IngesterSlot>,
    digesters: Vec<Box<dyn Digester>>,
    filters: FilterSet,
    index_root: std::path::PathBuf,
    time_index_sparsity: u64,
    kv_index_budget: usize,
    ingest_channel_buffer: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            vaults: HashMap::new(),
            ingesters: HashMap::new(),
            digesters: Vec::new(),
            filters: FilterSet::new(vec![]),
            index_root: std::path::PathBuf::new(),
            time_index_sparsity: 64,
            kv_index_budget: 4096,
            ingest_channel_buffer: 1024,
        }
    }
}

/// The pipeline. `Start`/`Stop` toggle between not-running and running;
/// every other operation may be called in either state (an ingester added
/// while stopped simply doesn't run until the next `Start`).
pub struct Orchestrator {
    state: RwLock<State>,
    registry: RwLock<IngesterRegistry>,
    scheduler: Arc<Scheduler>,
    local_node_id: RwLock<Option<NodeId>>,
    run: RwLock<Option<RunState>>,
}

impl Orchestrator {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            registry: RwLock::new(IngesterRegistry::new()),
            scheduler: Arc::new(Scheduler::new(max_concurrent_jobs)),
            local_node_id: RwLock::new(None),
            run: RwLock::new(None),
        }
    }

    pub fn register_ingester_factory(&self, type_name: &str, factory: crate::ingest::IngesterFactory) {
        self.registry.write().register(type_name, factory);
    }

    pub fn register_digester(&self, digester: Box<dyn Digester>) {
        self.state.write().digesters.push(digester);
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Seeds vaults, policies, filters and ingesters from a snapshot.
    /// Failures in one vault or ingester don't prevent the rest from being
    /// installed; each failure is logged and folded into the returned
    /// error list.
    pub fn apply_config(&self, cfg: &Config) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();

        {
            let mut state = self.state.write();
            state.index_root = cfg.index_root.clone();
            state.time_index_sparsity = cfg.time_index_sparsity;
            state.kv_index_budget = cfg.kv_index_budget;
            state.ingest_channel_buffer = cfg.ingest_channel_buffer;
        }
        if let Some(node) = &cfg.node {
            *self.local_node_id.write() = Some(node.id);
        }

        for vcfg in &cfg.vaults {
            if let Err(e) = self.install_vault(vcfg) {
                error!("failed to install vault '{}': {}", vcfg.name, e);
                errors.push(e);
            }
        }

        self.set_filter_rules(cfg.filter_rules.iter().map(to_filter_rule).collect());

        for icfg in &cfg.ingesters {
            if let Err(e) = self.add_ingester_from_config(icfg) {
                error!("failed to install ingester '{}': {}", icfg.id, e);
                errors.push(e);
            }
        }

        errors
    }

    fn install_vault(&self, vcfg: &VaultConfig) -> anyhow::Result<()> {
        let (index_root, time_sparsity, kv_budget) = {
            let state = self.state.read();
            (state.index_root.clone(), state.time_index_sparsity, state.kv_index_budget)
        };
        let backing = match &vcfg.backing {
            BackingConfig::Memory => Backing::Memory,
            BackingConfig::File { dir } => Backing::File { dir: dir.clone() },
        };
        let inline = InlineRotation { max_bytes: vcfg.max_bytes, max_records: vcfg.max_records };
        let mut vault = Vault::new(
            vcfg.id,
            vcfg.name.clone(),
            backing,
            inline,
            index_root.join(vcfg.id.to_string()),
            time_sparsity,
            kv_budget,
            vcfg.rotation_policies.clone(),
            vcfg.retention_policies.clone(),
        )?;
        if vcfg.compression {
            vault.set_compression(true)?;
        }
        self.state.write().vaults.insert(vcfg.id, vault);
        Ok(())
    }

    pub fn add_vault(&self, vcfg: &VaultConfig) -> anyhow::Result<()> {
        self.install_vault(vcfg)
    }

    pub fn disable_vault(&self, id: VaultId) -> Result<(), GlError> {
        let mut state = self.state.write();
        let vault = state.vaults.get_mut(&id).ok_or(GlError::VaultNotFound(id))?;
        vault.set_enabled(false);
        Ok(())
    }

    pub fn enable_vault(&self, id: VaultId) -> Result<(), GlError> {
        let mut state = self.state.write();
        let vault = state.vaults.get_mut(&id).ok_or(GlError::VaultNotFound(id))?;
        vault.set_enabled(true);
        Ok(())
    }

    pub fn set_vault_compression(&self, id: VaultId, on: bool) -> Result<(), GlError> {
        let mut state = self.state.write();
        let vault = state.vaults.get_mut(&id).ok_or(GlError::VaultNotFound(id))?;
        vault.set_compression(on)
    }

    /// Unconditionally drops a vault from the routing table, even if it
    /// still has unflushed in-flight records; the write loop will then
    /// silently fail to find it as a filter target (the existing
    /// "disabled or nonexistent vault is a silent no-op" rule covers it).
    pub fn force_remove_vault(&self, id: VaultId) -> Result<(), GlError> {
        let mut state = self.state.write();
        state.vaults.remove(&id).ok_or(GlError::VaultNotFound(id))?;
        Ok(())
    }

    pub fn reload_filters(&self, rules: Vec<FilterRuleConfigLike>) {
        self.set_filter_rules(rules.into_iter().map(|r| r.into_rule()).collect());
    }

    fn set_filter_rules(&self, rules: Vec<FilterRule>) {
        self.state.write().filters = FilterSet::new(rules);
    }

    pub fn reload_rotation_policies(&self, id: VaultId, policies: Vec<RotationPolicy>) -> Result<(), GlError> {
        let mut state = self.state.write();
        let vault = state.vaults.get_mut(&id).ok_or(GlError::VaultNotFound(id))?;
        vault.rotation_policies = policies;
        Ok(())
    }

    pub fn reload_retention_policies(&self, id: VaultId, policies: Vec<RetentionPolicy>) -> Result<(), GlError> {
        let mut state = self.state.write();
        let vault = state.vaults.get_mut(&id).ok_or(GlError::VaultNotFound(id))?;
        vault.retention_policies = policies;
        Ok(())
    }

    fn add_ingester_from_config(&self, icfg: &IngesterConfig) -> anyhow::Result<()> {
        let ingester = self.registry.read().create(&icfg.type_name, &icfg.id, &icfg.params)?;
        self.add_ingester(icfg.id.clone(), icfg.type_name.clone(), Arc::from(ingester));
        Ok(())
    }

    /// Installs an already-constructed ingester. If the pipeline is
    /// currently running, also launches it immediately on its own
    /// sub-cancellation so it can be removed individually later.
    pub fn add_ingester(&self, id: IngesterId, type_name: String, ingester: Arc<dyn Ingester>) {
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(AtomicIngesterStats::default());

        let handle = {
            let run = self.run.read();
            run.as_ref().map(|r| spawn_ingester(id.clone(), ingester.clone(), cancel.clone(), r.ingest_tx.clone()))
        };

        let mut state = self.state.write();
        if let Some(old) = state.ingesters.insert(id, IngesterSlot { type_name, ingester, cancel, handle, stats }) {
            old.cancel.store(true, Ordering::Relaxed);
            if let Some(h) = old.handle {
                h.abort();
            }
        }
    }

    /// Cancels and forgets one ingester without touching the rest of the
    /// pipeline.
    pub fn remove_ingester(&self, id: &str) -> Result<(), GlError> {
        let mut state = self.state.write();
        let slot = state.ingesters.remove(id).ok_or_else(|| GlError::IngesterNotFound(id.to_string()))?;
        slot.cancel.store(true, Ordering::Relaxed);
        if let Some(h) = slot.handle {
            h.abort();
        }
        Ok(())
    }

    pub fn update_max_concurrent_jobs(&self, n: usize) {
        self.scheduler.update_max_concurrent_jobs(n);
    }

    pub fn ingester_stats(&self, id: &str) -> Option<IngesterStats> {
        self.state.read().ingesters.get(id).map(|s| s.stats.snapshot())
    }

    pub fn list_vaults(&self) -> Vec<VaultId> {
        self.state.read().vaults.keys().copied().collect()
    }

    /// Starts the scheduler, every ingester, and the digest/write loop
    /// pair. Errors with `AlreadyRunning` if already started.
    pub fn start(self: &Arc<Self>) -> Result<(), GlError> {
        if self.run.read().is_some() {
            return Err(GlError::AlreadyRunning);
        }

        let buffer = self.state.read().ingest_channel_buffer.max(1);
        let (ingest_tx, ingest_rx) = mpsc::channel::<IngestMessage>(buffer);
        let (digest_tx, digest_rx) = mpsc::channel::<DigestedRecord>(buffer);

        {
            let mut state = self.state.write();
            for (id, slot) in state.ingesters.iter_mut() {
                slot.cancel.store(false, Ordering::Relaxed);
                slot.handle = Some(spawn_ingester(id.clone(), slot.ingester.clone(), slot.cancel.clone(), ingest_tx.clone()));
            }
        }

        self.schedule_vault_jobs();

        let orchestrator = self.clone();
        let digest_handle = tokio::spawn(async move { orchestrator.digest_loop(ingest_rx, digest_tx).await });

        let orchestrator = self.clone();
        let write_handle = tokio::spawn(async move { Orchestrator::write_loop(orchestrator, digest_rx).await });

        *self.run.write() = Some(RunState { ingest_tx, digest_handle, write_handle });
        info!("orchestrator started");
        Ok(())
    }

    fn schedule_vault_jobs(self: &Arc<Self>) {
        let vault_ids: Vec<VaultId> = self.state.read().vaults.keys().copied().collect();
        for vault_id in vault_ids {
            let orchestrator = self.clone();
            self.scheduler.run(&format!("rotate:{}", vault_id), std::time::Duration::from_secs(30), move |_cancel| {
                let orchestrator = orchestrator.clone();
                Box::pin(async move { orchestrator.rotate_if_due(vault_id) })
            });

            let orchestrator = self.clone();
            self.scheduler.run(&format!("retain:{}", vault_id), std::time::Duration::from_secs(60), move |_cancel| {
                let orchestrator = orchestrator.clone();
                Box::pin(async move { orchestrator.prune_vault(vault_id) })
            });
        }
    }

    fn rotate_if_due(self: &Arc<Self>, vault_id: VaultId) {
        let due = {
            let state = self.state.read();
            match state.vaults.get(&vault_id) {
                Some(v) => v.rotation_due(),
                None => return,
            }
        };
        match due {
            Ok(true) => {
                let state = self.state.read();
                if let Some(vault) = state.vaults.get(&vault_id) {
                    let sealed_id = vault.active_chunk_id();
                    if let Err(e) = vault.seal_active() {
                        warn!("scheduled rotation of vault {} failed: {}", vault_id, e);
                    } else {
                        self.enqueue_index_build(vault_id, sealed_id);
                    }
                }
            }
            Ok(false) => {}
            Err(e) => warn!("rotation check for vault {} failed: {}", vault_id, e),
        }
    }

    fn prune_vault(&self, vault_id: VaultId) {
        let state = self.state.read();
        let vault = match state.vaults.get(&vault_id) {
            Some(v) => v,
            None => return,
        };
        for chunk_id in vault.chunks_to_prune() {
            if let Err(e) = vault.delete_chunk(chunk_id) {
                warn!("pruning chunk {} of vault {} failed: {}", chunk_id, vault_id, e);
            }
        }
    }

    /// Enqueues `index-build:<vault>:<chunk>` on the scheduler, subject to
    /// `MaxConcurrentJobs`.
    fn enqueue_index_build(self: &Arc<Self>, vault_id: VaultId, chunk_id: crate::id::ChunkId) {
        let orchestrator = self.clone();
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            let name = format!("index-build:{}:{}", vault_id, chunk_id);
            scheduler
                .run_once(&name, move |cancel| {
                    Box::pin(async move {
                        let state = orchestrator.state.read();
                        if let Some(vault) = state.vaults.get(&vault_id) {
                            if let Err(e) = vault.build_indexes(chunk_id, &cancel) {
                                warn!("index build for {}:{} failed: {}", vault_id, chunk_id, e);
                            }
                        }
                    })
                })
                .await;
        });
    }

    /// For every sealed chunk across every vault whose indexes are
    /// incomplete, enqueues a rebuild job.
    pub fn rebuild_missing_indexes(self: &Arc<Self>) {
        let targets: Vec<(VaultId, crate::id::ChunkId)> = {
            let state = self.state.read();
            state
                .vaults
                .iter()
                .flat_map(|(vault_id, vault)| {
                    vault
                        .list_chunks()
                        .into_iter()
                        .filter(move |m: &ChunkMeta| m.sealed && !vault.index_manager().indexes_complete(m.id))
                        .map(move |m| (*vault_id, m.id))
                })
                .collect()
        };
        for (vault_id, chunk_id) in targets {
            self.enqueue_index_build(vault_id, chunk_id);
        }
    }

    async fn digest_loop(&self, mut ingest_rx: mpsc::Receiver<IngestMessage>, digest_tx: mpsc::Sender<DigestedRecord>) {
        let local_node_id = *self.local_node_id.read();
        while let Some(mut msg) = ingest_rx.recv().await {
            if let Some(node_id) = local_node_id {
                msg.attrs.insert("node_id".to_string(), node_id.to_string());
            }
            if !msg.ingester_id.is_empty() {
                msg.attrs.insert("ingester_id".to_string(), msg.ingester_id.clone());
            }

            {
                let state = self.state.read();
                for digester in &state.digesters {
                    digester.digest(&mut msg);
                }
            }

            let raw_len = msg.raw.len();
            let record = Record {
                source_ts: msg.source_ts,
                ingest_ts: msg.ingest_ts,
                write_ts: msg.ingest_ts,
                attrs: msg.attrs,
                raw: msg.raw,
            };
            let digested = DigestedRecord { record, ack: msg.ack, ingester_id: msg.ingester_id, raw_len };
            if digest_tx.send(digested).await.is_err() {
                break; // write loop gone; nothing left to drain into
            }
        }
        // `ingest_rx.recv()` already drains everything buffered in the
        // channel before returning `None` on close, satisfying "drains the
        // remaining channel contents before returning".
    }

    async fn write_loop(self: Arc<Self>, mut digest_rx: mpsc::Receiver<DigestedRecord>) {
        while let Some(digested) = digest_rx.recv().await {
            let outcome = self.write_one(&digested.record, &digested.ingester_id);

            {
                let state = self.state.read();
                if let Some(slot) = state.ingesters.get(&digested.ingester_id) {
                    slot.stats.messages_ingested.fetch_add(1, Ordering::Relaxed);
                    slot.stats.bytes_ingested.fetch_add(digested.raw_len as u64, Ordering::Relaxed);
                    if outcome.is_some() {
                        slot.stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            if let Some(ack) = digested.ack {
                let _ = ack.send(outcome);
            }
        }
    }

    /// Routes and appends one record, returning `Some(message)` on the
    /// first target-vault failure encountered (subsequent targets are
    /// still attempted).
    fn write_one(self: &Arc<Self>, record: &Record, _ingester_id: &str) -> Option<String> {
        let mut sealed: Vec<(VaultId, crate::id::ChunkId)> = Vec::new();
        let mut first_error = None;

        {
            let state = self.state.read();
            let enabled_vaults: Vec<VaultId> =
                state.vaults.iter().filter(|(_, v)| v.enabled()).map(|(id, _)| *id).collect();
            let targets = state.filters.route(&record.attrs, &enabled_vaults);

            for vault_id in targets {
                let vault = match state.vaults.get(&vault_id) {
                    Some(v) if v.enabled() => v,
                    _ => continue, // disabled or nonexistent target: silent no-op
                };
                match vault.append(record) {
                    Ok((chunk_id, _record_ref)) => {
                        // Inline (byte/record-count) rotation may have sealed
                        // `chunk_id` as a side effect of this very append.
                        if let Ok(meta) = vault.chunk_meta(chunk_id) {
                            if meta.sealed {
                                sealed.push((vault_id, chunk_id));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("append to vault {} failed: {}", vault_id, e);
                        if first_error.is_none() {
                            first_error = Some(e.to_string());
                        }
                    }
                }
            }
        }

        for (vault_id, chunk_id) in sealed {
            self.enqueue_index_build(vault_id, chunk_id);
        }
        first_error
    }

    /// Ordered shutdown: cancel every ingester, let the digest loop drain
    /// `ingestCh`, let the write loop drain `digestedCh`, then stop the
    /// scheduler. Returns `NotRunning` if already stopped.
    pub async fn stop(&self) -> Result<(), GlError> {
        let run = self.run.write().take().ok_or(GlError::NotRunning)?;

        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.write();
            state
                .ingesters
                .values_mut()
                .filter_map(|slot| {
                    slot.cancel.store(true, Ordering::Relaxed);
                    slot.handle.take()
                })
                .collect()
        };
        for h in handles {
            let _ = h.await;
        }

        drop(run.ingest_tx); // closes ingestCh; digest loop drains and exits
        let _ = run.digest_handle.await;
        // dropping digest_tx happened inside digest_loop's own scope on return,
        // which closes digestedCh and lets the write loop drain and exit.
        let _ = run.write_handle.await;

        self.scheduler.stop().await;
        info!("orchestrator stopped");
        Ok(())
    }
}

fn spawn_ingester(id: IngesterId, ingester: Arc<dyn Ingester>, cancel: CancelFlag, out: mpsc::Sender<IngestMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = ingester.run(cancel, out).await {
            error!("ingester '{}' exited with error: {}", id, e);
        }
    })
}

/// Plain-data filter rule, decoupled from `config::FilterRuleConfig` so
/// callers that build rules programmatically (tests, `ReloadFilters`
/// call sites without a full `Config`) don't need to round-trip through
/// serde.
pub struct FilterRuleConfigLike {
    pub matchers: Vec<Matcher>,
    pub targets: Vec<VaultId>,
}

impl FilterRuleConfigLike {
    fn into_rule(self) -> FilterRule {
        FilterRule { matchers: self.matchers, targets: self.targets }
    }
}

fn to_filter_rule(cfg: &crate::config::FilterRuleConfig) -> FilterRule {
    let matchers = cfg
        .matchers
        .iter()
        .map(|m| match m {
            crate::config::MatcherConfig::Equals { key, value } => Matcher::Equals { key: key.clone(), value: value.clone() },
            crate::config::MatcherConfig::Prefix { key, prefix } => Matcher::Prefix { key: key.clone(), prefix: prefix.clone() },
        })
        .collect();
    FilterRule { matchers, targets: cfg.targets.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackingConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Emits a handful of fixed messages, then waits for cancellation.
    struct StubIngester {
        id: String,
        count: u32,
    }

    #[async_trait]
    impl Ingester for StubIngester {
        async fn run(&self, cancel: CancelFlag, out: mpsc::Sender<IngestMessage>) -> anyhow::Result<()> {
            for i in 0..self.count {
                let msg = IngestMessage::new(format!("line-{}", i).into_bytes(), self.id.clone());
                if out.send(msg).await.is_err() {
                    return Ok(());
                }
            }
            while !cancel.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        }
    }

    fn memory_vault_config(id: VaultId) -> VaultConfig {
        VaultConfig {
            id,
            name: "test".to_string(),
            backing: BackingConfig::Memory,
            compression: false,
            max_bytes: None,
            max_records: None,
            rotation_policies: vec![],
            retention_policies: vec![],
        }
    }

    #[tokio::test]
    async fn messages_flow_from_ingester_to_vault() {
        let orchestrator = Arc::new(Orchestrator::new(2));
        let vault_id = VaultId::new();
        orchestrator.add_vault(&memory_vault_config(vault_id)).unwrap();
        orchestrator.add_ingester(
            "stub".to_string(),
            "stub".to_string(),
            Arc::new(StubIngester { id: "stub".to_string(), count: 5 }),
        );

        orchestrator.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.stop().await.unwrap();

        let count = orchestrator.state.read().vaults.get(&vault_id).unwrap().list_chunks()[0].record_count;
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn start_twice_errors_already_running() {
        let orchestrator = Arc::new(Orchestrator::new(2));
        orchestrator.start().unwrap();
        assert_eq!(orchestrator.start(), Err(GlError::AlreadyRunning));
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_errors_not_running() {
        let orchestrator = Orchestrator::new(2);
        assert_eq!(orchestrator.stop().await, Err(GlError::NotRunning));
    }

    #[tokio::test]
    async fn disabled_vault_silently_drops_records() {
        let orchestrator = Arc::new(Orchestrator::new(2));
        let vault_id = VaultId::new();
        orchestrator.add_vault(&memory_vault_config(vault_id)).unwrap();
        orchestrator.disable_vault(vault_id).unwrap();
        orchestrator.add_ingester(
            "stub".to_string(),
            "stub".to_string(),
            Arc::new(StubIngester { id: "stub".to_string(), count: 3 }),
        );

        orchestrator.start().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        orchestrator.stop().await.unwrap();

        let count = orchestrator.state.read().vaults.get(&vault_id).unwrap().list_chunks()[0].record_count;
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn remove_ingester_stops_only_that_one() {
        let orchestrator = Arc::new(Orchestrator::new(2));
        let vault_id = VaultId::new();
        orchestrator.add_vault(&memory_vault_config(vault_id)).unwrap();
        let ticks = Arc::new(AtomicU32::new(0));

        struct Looping {
            ticks: Arc<AtomicU32>,
        }
        #[async_trait]
        impl Ingester for Looping {
            async fn run(&self, cancel: CancelFlag, _out: mpsc::Sender<IngestMessage>) -> anyhow::Result<()> {
                while !cancel.load(Ordering::Relaxed) {
                    self.ticks.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            }
        }

        orchestrator.add_ingester("loop".to_string(), "loop".to_string(), Arc::new(Looping { ticks: ticks.clone() }));
        orchestrator.start().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        orchestrator.remove_ingester("loop").unwrap();
        let after_remove = ticks.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::Relaxed), after_remove);
        orchestrator.stop().await.unwrap();
    }
}
