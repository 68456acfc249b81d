//! Sparse time index: `(IngestTS, RecordPos)` for record #0 and every
//! record whose zero-based index is a multiple of the configured
//! sparsity.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::error::GlError;
use crate::index::build::Indexer;
use crate::index::format::IndexType;
use crate::record::{Record, RecordRef};

const ENTRY_LEN: usize = 16; // i64 ts_us + u64 pos

pub struct TimeIndexer {
    /// Stride between consecutively sampled records. Must be >= 1.
    pub sparsity: u64,
}

impl Indexer for TimeIndexer {
    fn name(&self) -> &'static str {
        "time"
    }

    fn index_type(&self) -> IndexType {
        IndexType::Time
    }

    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>) {
        let sparsity = self.sparsity.max(1);
        let mut out = Vec::new();
        let mut count = 0u64;

        for (idx, (record, record_ref)) in records.iter().enumerate() {
            if idx as u64 % sparsity == 0 {
                out.write_i64::<LE>(record.ingest_ts.timestamp_micros()).unwrap();
                out.write_u64::<LE>(record_ref.pos).unwrap();
                count += 1;
            }
        }

        (0, count, out)
    }
}

/// Decodes a loaded time index's entries into `(ts_us, pos)` pairs.
pub fn decode_entries(entry_count: u64, bytes: &[u8]) -> Result<Vec<(i64, u64)>, GlError> {
    if bytes.len() as u64 != entry_count * ENTRY_LEN as u64 {
        return Err(GlError::EntrySizeMismatch);
    }
    let mut out = Vec::with_capacity(entry_count as usize);
    let mut buf = bytes;
    for _ in 0..entry_count {
        let ts = buf.read_i64::<LE>().map_err(|_| GlError::EntrySizeMismatch)?;
        let pos = buf.read_u64::<LE>().map_err(|_| GlError::EntrySizeMismatch)?;
        out.push((ts, pos));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ChunkId;
    use crate::record::Attrs;
    use chrono::{TimeZone, Utc};

    fn rec_at(us: i64, pos: u64, chunk_id: ChunkId) -> (Record, RecordRef) {
        (
            Record {
                source_ts: None,
                ingest_ts: Utc.timestamp_micros(us).unwrap(),
                write_ts: Utc.timestamp_micros(us).unwrap(),
                attrs: Attrs::new(),
                raw: vec![],
            },
            RecordRef { chunk_id, pos },
        )
    }

    #[test]
    fn sparsity_two_over_five_records() {
        let chunk_id = ChunkId::new();
        let records: Vec<_> = [1000, 2000, 3000, 4000, 5000]
            .iter()
            .enumerate()
            .map(|(i, us)| rec_at(*us, i as u64 * 10, chunk_id))
            .collect();

        let indexer = TimeIndexer { sparsity: 2 };
        let (flags, count, bytes) = indexer.build(&records);
        assert_eq!(flags, 0);
        assert_eq!(count, 3);

        let entries = decode_entries(count, &bytes).unwrap();
        assert_eq!(entries, vec![(1000, 0), (3000, 20), (5000, 40)]);
    }

    #[test]
    fn single_record_yields_one_entry() {
        let chunk_id = ChunkId::new();
        let records = vec![rec_at(1234, 0, chunk_id)];
        let indexer = TimeIndexer { sparsity: 5 };
        let (_, count, _) = indexer.build(&records);
        assert_eq!(count, 1);
    }
}
