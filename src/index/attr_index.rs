//! Inverted indexes over a record's structured `Attrs`: by key, by value,
//! and by `(key, value)` pair.

use std::collections::BTreeMap;

use crate::index::build::Indexer;
use crate::index::format::IndexType;
use crate::index::inverted::{encode_composite, encode_simple};
use crate::record::{Record, RecordRef};

pub struct AttrKeyIndexer;

impl Indexer for AttrKeyIndexer {
    fn name(&self) -> &'static str {
        "attr_key"
    }

    fn index_type(&self) -> IndexType {
        IndexType::AttrKey
    }

    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>) {
        let mut map: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (record, record_ref) in records {
            for key in record.attrs.keys() {
                map.entry(key.clone()).or_default().push(record_ref.pos);
            }
        }
        let (count, bytes) = encode_simple(&map);
        (0, count, bytes)
    }
}

pub struct AttrValueIndexer;

impl Indexer for AttrValueIndexer {
    fn name(&self) -> &'static str {
        "attr_value"
    }

    fn index_type(&self) -> IndexType {
        IndexType::AttrValue
    }

    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>) {
        let mut map: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (record, record_ref) in records {
            for value in record.attrs.values() {
                map.entry(value.clone()).or_default().push(record_ref.pos);
            }
        }
        let (count, bytes) = encode_simple(&map);
        (0, count, bytes)
    }
}

pub struct AttrKvIndexer;

impl Indexer for AttrKvIndexer {
    fn name(&self) -> &'static str {
        "attr_kv"
    }

    fn index_type(&self) -> IndexType {
        IndexType::AttrKv
    }

    fn build(&self, records: &[(Record, RecordRef)]) -> (u8, u64, Vec<u8>) {
        let mut map: BTreeMap<(String, String), Vec<u64>> = BTreeMap::new();
        for (record, record_ref) in records {
            for (key, value) in &record.attrs {
                map.entry((key.clone(), value.clone())).or_default().push(record_ref.pos);
            }
        }
        let (count, bytes) = encode_composite(&map);
        (0, count, bytes)
    }
}
