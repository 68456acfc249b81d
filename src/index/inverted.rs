//! Shared entry encoding for the inverted indexes (token, attr key/value/kv,
//! kv key/value/kv): key -> sorted `[RecordPos]`.

use std::collections::BTreeMap;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::error::GlError;

/// Encodes a `key -> positions` map, keys already in the iteration order
/// `BTreeMap` gives (lexicographically ascending), positions left in
/// insertion order (callers insert in append order, which is ascending).
pub fn encode_simple(map: &BTreeMap<String, Vec<u64>>) -> (u64, Vec<u8>) {
    let mut out = Vec::new();
    for (key, positions) in map {
        write_str(&mut out, key);
        write_positions(&mut out, positions);
    }
    (map.len() as u64, out)
}

pub fn decode_simple(mut buf: &[u8]) -> Result<BTreeMap<String, Vec<u64>>, GlError> {
    let mut map = BTreeMap::new();
    while !buf.is_empty() {
        let key = read_str(&mut buf)?;
        let positions = read_positions(&mut buf)?;
        map.insert(key, positions);
    }
    Ok(map)
}

/// Encodes a `(key, value) -> positions` map for the attr-kv / kv-kv
/// indexes.
pub fn encode_composite(map: &BTreeMap<(String, String), Vec<u64>>) -> (u64, Vec<u8>) {
    let mut out = Vec::new();
    for ((key, value), positions) in map {
        write_str(&mut out, key);
        write_str(&mut out, value);
        write_positions(&mut out, positions);
    }
    (map.len() as u64, out)
}

pub fn decode_composite(mut buf: &[u8]) -> Result<BTreeMap<(String, String), Vec<u64>>, GlError> {
    let mut map = BTreeMap::new();
    while !buf.is_empty() {
        let key = read_str(&mut buf)?;
        let value = read_str(&mut buf)?;
        let positions = read_positions(&mut buf)?;
        map.insert((key, value), positions);
    }
    Ok(map)
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<LE>(s.len() as u32).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn read_str(buf: &mut &[u8]) -> Result<String, GlError> {
    let len = buf.read_u32::<LE>().map_err(|_| GlError::EntrySizeMismatch)? as usize;
    if buf.len() < len {
        return Err(GlError::EntrySizeMismatch);
    }
    let s = String::from_utf8_lossy(&buf[..len]).into_owned();
    *buf = &buf[len..];
    Ok(s)
}

fn write_positions(out: &mut Vec<u8>, positions: &[u64]) {
    out.write_u32::<LE>(positions.len() as u32).unwrap();
    for pos in positions {
        out.write_u64::<LE>(*pos).unwrap();
    }
}

fn read_positions(buf: &mut &[u8]) -> Result<Vec<u64>, GlError> {
    let count = buf.read_u32::<LE>().map_err(|_| GlError::EntrySizeMismatch)? as usize;
    let mut positions = Vec::with_capacity(count);
    for _ in 0..count {
        positions.push(buf.read_u64::<LE>().map_err(|_| GlError::EntrySizeMismatch)?);
    }
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("alpha".to_string(), vec![0, 10, 20]);
        map.insert("beta".to_string(), vec![5]);
        let (count, bytes) = encode_simple(&map);
        assert_eq!(count, 2);
        assert_eq!(decode_simple(&bytes).unwrap(), map);
    }

    #[test]
    fn composite_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert(("level".to_string(), "error".to_string()), vec![3, 7]);
        let (count, bytes) = encode_composite(&map);
        assert_eq!(count, 1);
        assert_eq!(decode_composite(&bytes).unwrap(), map);
    }
}
