//! Inverted indexes over `key=value` tokens parsed out of `Raw`, under a
//! fixed per-record byte budget: only the leading `budget` bytes of `Raw`
//! are scanned, so a pathologically long line costs bounded work. When a
//! record's `Raw` is longer than the budget the index is marked truncated
//! via the index file's flags byte (bit 0x01) rather than failing the
//! build.

use std::collections::BTreeMap;

use crate::index::build::Indexer;
use crate::index::format::IndexType;
use crate::index::inverted::{encode_composite, encode_simple};
use crate::record::{Record, RecordRef};

/// Bytes of `Raw` scanned per record when looking for `key=value` tokens.
pub const DEFAULT_KV_BUDGET: usize = 4096;

pub const FLAG_TRUNCATED: u8 = 0x01;

/// Splits `raw[..budget]` on ASCII whitespace and keeps tokens containing
/// exactly one `=` with non-empty key and value. Returns the parsed pairs
/// plus whether `raw` was longer than `budget` (and therefore some trailing
/// bytes went unscanned).
pub fn parse_kv_pairs(raw: &[u8], budget: usize) -> (Vec<(String, String)>, bool) {
    let truncated = raw.len() > budget;
    let window = &raw[..raw.len().min(budget)];
    let text = String::from_utf8_lossy(window);

    let mut pairs = Vec::new();
    for token in text.split_ascii_whitespace() {
        if let Some(eq) = token.find('=') {
            let key = &token[..eq];
            let value = &token[eq + 1..];
            if !key.is_empty() && !value.is_empty() {
                pairs.push((key.to_string(), value.to_string()));
            }
        }
    }
    (pairs, truncated)
}

fn any_truncated(records: &[(Record, RecordRef)], budget: usize) -> bool {
    records.iter().any(|(r, _)| r.raw.len() > budget)
}

pub struct KvKeyIndexer {
    pub budget: usize,
}

impl Default for KvKeyIndexer {
    fn default() -> Self {
        Self { budget: DEFAULT_KV_BUDGET }
    }
}

impl Indexer for KvKeyIndexer {
    fn name(&self) -> &'static str {
        "kv_key"
    }

    fn index_type(&self) -> IndexType {
        IndexType::KvKey
    }

    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>) {
        let mut map: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (record, record_ref) in records {
            let (pairs, _) = parse_kv_pairs(&record.raw, self.budget);
            let mut keys: Vec<_> = pairs.into_iter().map(|(k, _)| k).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                map.entry(key).or_default().push(record_ref.pos);
            }
        }
        let flags = if any_truncated(records, self.budget) { FLAG_TRUNCATED } else { 0 };
        let (count, bytes) = encode_simple(&map);
        (flags, count, bytes)
    }
}

pub struct KvValueIndexer {
    pub budget: usize,
}

impl Default for KvValueIndexer {
    fn default() -> Self {
        Self { budget: DEFAULT_KV_BUDGET }
    }
}

impl Indexer for KvValueIndexer {
    fn name(&self) -> &'static str {
        "kv_value"
    }

    fn index_type(&self) -> IndexType {
        IndexType::KvValue
    }

    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>) {
        let mut map: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (record, record_ref) in records {
            let (pairs, _) = parse_kv_pairs(&record.raw, self.budget);
            let mut values: Vec<_> = pairs.into_iter().map(|(_, v)| v).collect();
            values.sort();
            values.dedup();
            for value in values {
                map.entry(value).or_default().push(record_ref.pos);
            }
        }
        let flags = if any_truncated(records, self.budget) { FLAG_TRUNCATED } else { 0 };
        let (count, bytes) = encode_simple(&map);
        (flags, count, bytes)
    }
}

pub struct KvKvIndexer {
    pub budget: usize,
}

impl Default for KvKvIndexer {
    fn default() -> Self {
        Self { budget: DEFAULT_KV_BUDGET }
    }
}

impl Indexer for KvKvIndexer {
    fn name(&self) -> &'static str {
        "kv_kv"
    }

    fn index_type(&self) -> IndexType {
        IndexType::KvKv
    }

    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>) {
        let mut map: BTreeMap<(String, String), Vec<u64>> = BTreeMap::new();
        for (record, record_ref) in records {
            let (mut pairs, _) = parse_kv_pairs(&record.raw, self.budget);
            pairs.sort();
            pairs.dedup();
            for pair in pairs {
                map.entry(pair).or_default().push(record_ref.pos);
            }
        }
        let flags = if any_truncated(records, self.budget) { FLAG_TRUNCATED } else { 0 };
        let (count, bytes) = encode_composite(&map);
        (flags, count, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ChunkId;
    use crate::index::inverted::decode_simple;
    use crate::record::Attrs;
    use chrono::Utc;

    fn rec(raw: &str, pos: u64, chunk_id: ChunkId) -> (Record, RecordRef) {
        (
            Record {
                source_ts: None,
                ingest_ts: Utc::now(),
                write_ts: Utc::now(),
                attrs: Attrs::new(),
                raw: raw.as_bytes().to_vec(),
            },
            RecordRef { chunk_id, pos },
        )
    }

    #[test]
    fn parses_space_separated_kv_tokens() {
        let (pairs, truncated) = parse_kv_pairs(b"status=500 method=GET path=/api", 4096);
        assert!(!truncated);
        assert_eq!(
            pairs,
            vec![
                ("status".to_string(), "500".to_string()),
                ("method".to_string(), "GET".to_string()),
                ("path".to_string(), "/api".to_string()),
            ]
        );
    }

    #[test]
    fn ignores_tokens_without_equals_or_empty_sides() {
        let (pairs, _) = parse_kv_pairs(b"plain =novalue nokey= a=b", 4096);
        assert_eq!(pairs, vec![("a".to_string(), "b".to_string())]);
    }

    #[test]
    fn marks_truncated_when_raw_exceeds_budget() {
        let raw = format!("a=1 {}", "x".repeat(20));
        let (_, truncated) = parse_kv_pairs(raw.as_bytes(), 5);
        assert!(truncated);
    }

    #[test]
    fn kv_key_indexer_flags_truncation() {
        let chunk_id = ChunkId::new();
        let long_raw = format!("a=1 {}", "x".repeat(20));
        let records = vec![rec(&long_raw, 0, chunk_id)];
        let indexer = KvKeyIndexer { budget: 5 };
        let (flags, count, bytes) = indexer.build(&records);
        assert_eq!(flags, FLAG_TRUNCATED);
        assert_eq!(count, 1);
        let map = decode_simple(&bytes).unwrap();
        assert!(map.contains_key("a"));
    }

    #[test]
    fn kv_key_indexer_no_truncation_flag_when_within_budget() {
        let chunk_id = ChunkId::new();
        let records = vec![rec("a=1 b=2", 0, chunk_id)];
        let indexer = KvKeyIndexer::default();
        let (flags, _, _) = indexer.build(&records);
        assert_eq!(flags, 0);
    }
}
