//! The ingester contract and the two reference ingesters.

pub mod fluent;
pub mod tail;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::record::IngestMessage;
use crate::scheduler::CancelFlag;

/// `run` blocks until `cancel` is set, emitting messages into `out`.
/// Returning `Ok(())` on graceful cancellation is required; ingesters
/// never propagate per-record errors here (those are surfaced through the
/// write loop's ack channel instead).
#[async_trait]
pub trait Ingester: Send + Sync {
    async fn run(&self, cancel: CancelFlag, out: mpsc::Sender<IngestMessage>) -> anyhow::Result<()>;
}

/// `(id, params, logger) → Ingester`. Parameters are strings; unknown keys
/// are ignored by each factory.
pub type IngesterFactory = Arc<dyn Fn(&str, &HashMap<String, String>) -> anyhow::Result<Box<dyn Ingester>> + Send + Sync>;

/// Type-name keyed registry of ingester factories, populated once at
/// startup with `"fluent"` and `"tail"` and extensible by embedders.
#[derive(Clone, Default)]
pub struct IngesterRegistry {
    factories: HashMap<String, IngesterFactory>,
}

impl IngesterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: &str, factory: IngesterFactory) {
        self.factories.insert(type_name.to_string(), factory);
    }

    pub fn create(&self, type_name: &str, id: &str, params: &HashMap<String, String>) -> anyhow::Result<Box<dyn Ingester>> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| anyhow::anyhow!("unknown ingester type '{}'", type_name))?;
        factory(id, params)
    }
}
