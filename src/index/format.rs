//! The index file frame shared by every indexer: a small header (signature,
//! type, version, flags, uleb128 entry count) followed by type-specific
//! entries and a trailing CRC32C covering header+entries.
//!
//! Publication is always write-temp-then-rename so readers never observe a
//! half-written file (spec §9 "Index atomic publish").

use std::fs::{self, File};
use std::io::Write;
use std::convert::TryInto;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::GlError;

pub const SIGNATURE: u8 = 0x47;
pub const VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    Time,
    Token,
    AttrKey,
    AttrValue,
    AttrKv,
    KvKey,
    KvValue,
    KvKv,
}

impl IndexType {
    pub fn type_byte(self) -> u8 {
        match self {
            IndexType::Time => b't',
            IndexType::Token => b'k',
            IndexType::AttrKey => b'a',
            IndexType::AttrValue => b'v',
            IndexType::AttrKv => b'x',
            IndexType::KvKey => b'K',
            IndexType::KvValue => b'V',
            IndexType::KvKv => b'X',
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            IndexType::Time => "time.idx",
            IndexType::Token => "token.idx",
            IndexType::AttrKey => "attr_key.idx",
            IndexType::AttrValue => "attr_value.idx",
            IndexType::AttrKv => "attr_kv.idx",
            IndexType::KvKey => "kv_key.idx",
            IndexType::KvValue => "kv_value.idx",
            IndexType::KvKv => "kv_kv.idx",
        }
    }

    pub fn temp_glob_prefix(self) -> String {
        format!("{}.tmp.", self.file_name())
    }
}

#[derive(Debug)]
pub struct IndexHeader {
    pub index_type: IndexType,
    pub flags: u8,
    pub entry_count: u64,
}

/// Encodes header + entries + trailing CRC and publishes atomically.
pub fn publish(dir: &Path, index_type: IndexType, flags: u8, entry_count: u64, entries: &[u8]) -> Result<(), GlError> {
    fs::create_dir_all(dir).map_err(io_err)?;

    let mut body = Vec::with_capacity(8 + entries.len());
    body.push(SIGNATURE);
    body.push(index_type.type_byte());
    body.push(VERSION);
    body.push(flags);
    leb128::write::unsigned(&mut body, entry_count).map_err(io_err)?;
    body.extend_from_slice(entries);

    let crc = crc32c::crc32c(&body);
    body.extend_from_slice(&crc.to_le_bytes());

    let final_path = dir.join(index_type.file_name());
    let tmp_path = tmp_path_for(dir, index_type);

    {
        let mut tmp = File::create(&tmp_path).map_err(io_err)?;
        tmp.write_all(&body).map_err(io_err)?;
        tmp.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp_path, &final_path).map_err(io_err)?;

    Ok(())
}

fn tmp_path_for(dir: &Path, index_type: IndexType) -> PathBuf {
    static NONCE: AtomicU64 = AtomicU64::new(0);
    let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{}.tmp.{}.{}", index_type.file_name(), process::id(), nonce))
}

/// Removes any stray `<name>.tmp.*` files for `index_type` left behind by a
/// crashed or cancelled build.
pub fn clean_orphan_temp_files(dir: &Path, index_type: IndexType) {
    let prefix = index_type.temp_glob_prefix();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// Parses and validates header+CRC, returning the header plus the entry
/// bytes (header and trailing CRC stripped).
pub fn load(path: &Path, expected_type: IndexType) -> Result<(IndexHeader, Vec<u8>), GlError> {
    let bytes = fs::read(path).map_err(io_err)?;

    if bytes.len() < 8 {
        return Err(GlError::IndexTooSmall);
    }
    if bytes[0] != SIGNATURE {
        return Err(GlError::SignatureMismatch);
    }
    if bytes[1] != expected_type.type_byte() {
        return Err(GlError::SignatureMismatch);
    }
    if bytes[2] != VERSION {
        return Err(GlError::VersionMismatch);
    }
    let flags = bytes[3];

    let mut reader = &bytes[4..bytes.len() - 4];
    let remaining_before_count = reader.len();
    let entry_count = leb128::read::unsigned(&mut reader).map_err(|_| GlError::EntrySizeMismatch)?;
    let count_len = remaining_before_count - reader.len();

    let entries_end = bytes.len() - 4;
    let entries_start = 4 + count_len;
    let entries = &bytes[entries_start..entries_end];

    let crc_expected = u32::from_le_bytes(bytes[entries_end..].try_into().unwrap());
    let crc_actual = crc32c::crc32c(&bytes[..entries_end]);
    if crc_expected != crc_actual {
        return Err(GlError::EntrySizeMismatch);
    }

    Ok((
        IndexHeader { index_type: expected_type, flags, entry_count },
        entries.to_vec(),
    ))
}

fn io_err(e: std::io::Error) -> GlError {
    GlError::RecordCorrupt(e.to_string())
}
