//! The immutable record shape and the structures that travel with it
//! through the pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::id::{ChunkId, IngesterId};

/// Attribute map. Order is never significant (spec §3); `BTreeMap` gives
/// deterministic iteration, which keeps index-build output byte-for-byte
/// reproducible without any extra sorting code.
pub type Attrs = BTreeMap<String, String>;

/// An immutable log record, once appended to a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Time the log line was produced. `None` means "unknown" (the
    /// Go source's zero-value `SourceTS`).
    pub source_ts: Option<DateTime<Utc>>,
    /// Time the ingester received the line.
    pub ingest_ts: DateTime<Utc>,
    /// Time the chunk manager appended it. Set on append, not before.
    pub write_ts: DateTime<Utc>,
    pub attrs: Attrs,
    pub raw: Vec<u8>,
}

/// The stable on-chunk coordinate of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordRef {
    pub chunk_id: ChunkId,
    pub pos: u64,
}

/// Metadata about one chunk (sealed or active).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkMeta {
    pub id: ChunkId,
    pub created: DateTime<Utc>,
    pub sealed: bool,
    pub record_count: u64,
    pub byte_size: u64,
    /// Covers `IngestTS`. `None` only when the chunk has zero records.
    pub min_ts: Option<DateTime<Utc>>,
    pub max_ts: Option<DateTime<Utc>>,
}

impl ChunkMeta {
    pub fn new(id: ChunkId, created: DateTime<Utc>) -> Self {
        Self {
            id,
            created,
            sealed: false,
            record_count: 0,
            byte_size: 0,
            min_ts: None,
            max_ts: None,
        }
    }

    pub fn observe_append(&mut self, ingest_ts: DateTime<Utc>, written_bytes: u64) {
        self.record_count += 1;
        self.byte_size += written_bytes;
        self.min_ts = Some(self.min_ts.map_or(ingest_ts, |t| t.min(ingest_ts)));
        self.max_ts = Some(self.max_ts.map_or(ingest_ts, |t| t.max(ingest_ts)));
    }
}

/// One-shot completion handle by which the pipeline reports a per-message
/// write outcome back to the originating ingester. `None` means every
/// routed vault accepted the record.
pub type AckSender = oneshot::Sender<Option<String>>;
pub type AckReceiver = oneshot::Receiver<Option<String>>;

/// A message in flight between an ingester and the digest loop. Never
/// persisted.
pub struct IngestMessage {
    pub attrs: Attrs,
    pub raw: Vec<u8>,
    pub source_ts: Option<DateTime<Utc>>,
    pub ingest_ts: DateTime<Utc>,
    pub ingester_id: IngesterId,
    pub ack: Option<AckSender>,
}

impl IngestMessage {
    pub fn new(raw: Vec<u8>, ingester_id: IngesterId) -> Self {
        Self {
            attrs: Attrs::new(),
            raw,
            source_ts: None,
            ingest_ts: Utc::now(),
            ingester_id,
            ack: None,
        }
    }
}

/// A fully-digested record on its way to the write loop.
pub struct DigestedRecord {
    pub record: Record,
    pub ack: Option<AckSender>,
    pub ingester_id: IngesterId,
    pub raw_len: usize,
}
