//! Inverted index over Unicode word-like tokens extracted from `Raw`.

use std::collections::{BTreeMap, BTreeSet};

use unicode_segmentation::UnicodeSegmentation;

use crate::index::build::Indexer;
use crate::index::format::IndexType;
use crate::index::inverted::encode_simple;
use crate::record::{Record, RecordRef};

const MIN_LEN: usize = 2;
const MAX_LEN: usize = 32;

/// Lowercase Unicode alphanumeric runs of length `MIN_LEN..=MAX_LEN`,
/// deduplicated per record.
pub fn tokenize(raw: &[u8]) -> BTreeSet<String> {
    let text = String::from_utf8_lossy(raw);
    text.unicode_words()
        .flat_map(alphanumeric_runs)
        .filter(|t| (MIN_LEN..=MAX_LEN).contains(&t.chars().count()))
        .map(|t| t.to_lowercase())
        .collect()
}

/// A `unicode_words` word can still contain non-alphanumeric punctuation
/// glued to it (e.g. contractions); split it further into maximal
/// alphanumeric runs.
fn alphanumeric_runs(word: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for ch in word.chars() {
        if ch.is_alphanumeric() {
            current.push(ch);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

pub struct TokenIndexer;

impl Indexer for TokenIndexer {
    fn name(&self) -> &'static str {
        "token"
    }

    fn index_type(&self) -> IndexType {
        IndexType::Token
    }

    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>) {
        let mut map: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (record, record_ref) in records {
            for token in tokenize(&record.raw) {
                map.entry(token).or_default().push(record_ref.pos);
            }
        }
        let (count, bytes) = encode_simple(&map);
        (0, count, bytes)
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
    fn tokenizes_lowercase_alphanumeric_runs() {
        let tokens = tokenize(b"Connection RESET by peer (errno=104)");
        assert!(tokens.contains("connection"));
        assert!(tokens.contains("reset"));
        assert!(tokens.contains("peer"));
        assert!(tokens.contains("errno"));
        assert!(tokens.contains("104"));
        assert!(tokens.contains("by")); // length 2 kept (>= MIN_LEN)
    }

    #[test]
    fn dedups_per_record_and_sorts_postings() {
        let chunk_id = ChunkId::new();
        let records = vec![
            rec("retry retry connect", 0, chunk_id),
            rec("connect failed", 10, chunk_id),
        ];
        let indexer = TokenIndexer;
        let (_, count, bytes) = indexer.build(&records);
        let map = decode_simple(&bytes).unwrap();
        assert_eq!(map.get("retry"), Some(&vec![0]));
        assert_eq!(map.get("connect"), Some(&vec![0, 10]));
        assert_eq!(count, map.len() as u64);
    }

    #[test]
    fn single_char_and_over_long_tokens_are_excluded() {
        let long = "a".repeat(33);
        let raw = format!("x {}", long);
        let tokens = tokenize(raw.as_bytes());
        assert!(!tokens.contains("x"));
        assert!(!tokens.contains(&long));
    }
}
