//! Append-only segmented storage for a single vault.
//!
//! Two backings share one trait: [`FileChunkManager`] persists frames to
//! disk (and may zstd-compress a chunk as a whole once sealed);
//! [`MemoryChunkManager`] keeps everything in a `Vec<u8>` per chunk, for the
//! `memory` vault type and for fast tests.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use crate::chunk::cursor::Cursor;
use crate::chunk::format::{self, decode_body, decode_header, HEADER_LEN};
use crate::error::GlError;
use crate::id::ChunkId;
use crate::record::{ChunkMeta, Record, RecordRef};

/// Compression marker prefixed to a sealed file chunk's on-disk body.
const MARK_PLAIN: u8 = 0x00;
const MARK_ZSTD: u8 = 0x01;

/// Append-only storage for one vault's chunks.
///
/// All methods take `&self`: internal locking serializes writers per the
/// "Append is serialized per manager (single writer)" contract. Disk I/O is
/// synchronous; callers on an async runtime should run these through
/// `tokio::task::spawn_blocking`.
pub trait ChunkManager: Send + Sync {
    fn append(&self, record: &Record) -> Result<(ChunkId, RecordRef), GlError>;
    fn seal(&self) -> Result<(), GlError>;
    fn list(&self) -> Vec<ChunkMeta>;
    fn meta(&self, id: ChunkId) -> Result<ChunkMeta, GlError>;
    fn open_cursor(&self, id: ChunkId) -> Result<Cursor, GlError>;
    fn delete(&self, id: ChunkId) -> Result<(), GlError>;
    fn active_chunk_id(&self) -> ChunkId;
    /// Changes whether future sealed chunks are zstd-compressed. Memory
    /// vaults have nothing durable to compress and refuse to enable it.
    fn set_compression(&self, enabled: bool) -> Result<(), GlError>;
}

/// Size/count-based rotation check, evaluated by the manager right after a
/// successful append (age/cron rotation is scheduler-driven, see
/// `policy.rs`).
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineRotation {
    pub max_bytes: Option<u64>,
    pub max_records: Option<u64>,
}

impl InlineRotation {
    fn should_seal(&self, meta: &ChunkMeta) -> bool {
        if let Some(max_bytes) = self.max_bytes {
            if meta.byte_size >= max_bytes {
                return true;
            }
        }
        if let Some(max_records) = self.max_records {
            if meta.record_count >= max_records {
                return true;
            }
        }
        false
    }
}

struct Inner {
    metas: BTreeMap<ChunkId, ChunkMeta>,
    active: ChunkId,
    rotation: InlineRotation,
}

/// Disk-backed chunk manager. Chunks live under `root/<chunk-id>.chunk`.
pub struct FileChunkManager {
    root: PathBuf,
    compression: std::sync::atomic::AtomicBool,
    inner: Mutex<Inner>,
    tmp_nonce: AtomicU64,
}

impl FileChunkManager {
    pub fn open(root: impl Into<PathBuf>, compression: bool, rotation: InlineRotation) -> Result<Self, GlError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;

        let mut metas = BTreeMap::new();
        let mut active = None;

        let mut entries: Vec<_> = fs::read_dir(&root)
            .map_err(|e| GlError::RecordCorrupt(e.to_string()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|ext| ext == "chunk").unwrap_or(false))
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let stem = entry.path().file_stem().unwrap().to_string_lossy().into_owned();
            let id: ChunkId = match stem.parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let meta = Self::recover_meta(&entry.path(), id)?;
            if !meta.sealed {
                active = Some(id);
            }
            metas.insert(id, meta);
        }

        let active = match active {
            Some(id) => id,
            None => {
                let id = ChunkId::new();
                let meta = ChunkMeta::new(id, Utc::now());
                File::create(root.join(format!("{}.chunk", id))).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
                metas.insert(id, meta);
                id
            }
        };

        Ok(Self {
            root,
            compression: std::sync::atomic::AtomicBool::new(compression),
            inner: Mutex::new(Inner { metas, active, rotation }),
            tmp_nonce: AtomicU64::new(0),
        })
    }

    fn chunk_path(&self, id: ChunkId) -> PathBuf {
        self.root.join(format!("{}.chunk", id))
    }

    /// Replays an active chunk's frames to recompute its metadata, and
    /// truncates a trailing partial frame left by a crash.
    fn recover_meta(path: &Path, id: ChunkId) -> Result<ChunkMeta, GlError> {
        let bytes = fs::read(path).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;

        // A sealed chunk starts with a one-byte compression marker; an
        // active chunk does not. We tell them apart by trying to parse a
        // frame at offset 0 versus offset 1.
        if let Some(body) = Self::sealed_body(&bytes) {
            let mut meta = ChunkMeta::new(id, Utc::now());
            meta.sealed = true;
            let mut pos = 0u64;
            let mut buf = &body[..];
            while !buf.is_empty() {
                if buf.len() < HEADER_LEN {
                    break;
                }
                let header = decode_header(buf).map_err(|_| GlError::RecordCorrupt("corrupt sealed chunk header".into()))?;
                let frame_len = header.frame_len();
                if buf.len() < frame_len {
                    return Err(GlError::RecordCorrupt("truncated sealed chunk".into()));
                }
                let record = decode_body(&header, &buf[HEADER_LEN..frame_len])
                    .map_err(|_| GlError::RecordCorrupt("corrupt record in sealed chunk".into()))?;
                meta.observe_append(record.ingest_ts, frame_len as u64);
                pos += frame_len as u64;
                buf = &buf[frame_len..];
            }
            meta.byte_size = pos;
            return Ok(meta);
        }

        let mut meta = ChunkMeta::new(id, Utc::now());
        let mut good_len = 0usize;
        let mut buf = &bytes[..];
        loop {
            if buf.len() < HEADER_LEN {
                break;
            }
            let header = match decode_header(buf) {
                Ok(h) => h,
                Err(_) => break,
            };
            let frame_len = header.frame_len();
            if buf.len() < frame_len {
                break; // trailing partial frame from a crash; truncate it away
            }
            let record = match decode_body(&header, &buf[HEADER_LEN..frame_len]) {
                Ok(r) => r,
                Err(_) if buf.len() == frame_len => break, // trailing torn write
                Err(e) => return Err(e),
            };
            meta.observe_append(record.ingest_ts, frame_len as u64);
            good_len += frame_len;
            buf = &buf[frame_len..];
        }
        meta.byte_size = good_len as u64;

        if good_len != bytes.len() {
            let mut file = OpenOptions::new().write(true).open(path).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
            file.set_len(good_len as u64).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
        }

        Ok(meta)
    }

    fn sealed_body(bytes: &[u8]) -> Option<&[u8]> {
        match bytes.first() {
            Some(&MARK_PLAIN) | Some(&MARK_ZSTD) => {
                // Disambiguate from an active chunk that happens to start
                // with a byte matching one of the markers: a sealed body's
                // remainder must itself decode as zero-or-more frames
                // (after optional decompression), an active file's first
                // byte is the first byte of a frame's `MAGIC`, which never
                // equals either marker value since `MAGIC` is ASCII text.
                if bytes.starts_with(&format::MAGIC) {
                    return None;
                }
                Some(&bytes[1..])
            }
            _ => None,
        }
    }

    fn decompress_if_needed(bytes: &[u8]) -> Result<Vec<u8>, GlError> {
        match Self::sealed_body(bytes) {
            Some(body) => match bytes[0] {
                MARK_ZSTD => zstd::stream::decode_all(body).map_err(|e| GlError::RecordCorrupt(e.to_string())),
                _ => Ok(body.to_vec()),
            },
            None => Ok(bytes.to_vec()),
        }
    }

    fn next_nonce(&self) -> u64 {
        self.tmp_nonce.fetch_add(1, Ordering::Relaxed)
    }
}

impl ChunkManager for FileChunkManager {
    fn set_compression(&self, enabled: bool) -> Result<(), GlError> {
        self.compression.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    fn append(&self, record: &Record) -> Result<(ChunkId, RecordRef), GlError> {
        let mut inner = self.inner.lock();
        let active = inner.active;
        let path = self.chunk_path(active);

        let frame = format::encode_record(record);
        let pos = inner.metas.get(&active).map(|m| m.byte_size).unwrap_or(0);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
        file.write_all(&frame).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
        file.sync_data().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;

        let meta = inner.metas.get_mut(&active).expect("active chunk has metadata");
        meta.observe_append(record.ingest_ts, frame.len() as u64);

        let rotation = inner.rotation;
        let should_seal = rotation.should_seal(inner.metas.get(&active).unwrap());

        let record_ref = RecordRef { chunk_id: active, pos };

        if should_seal {
            self.seal_locked(&mut inner)?;
        }

        Ok((active, record_ref))
    }

    fn seal(&self) -> Result<(), GlError> {
        let mut inner = self.inner.lock();
        self.seal_locked(&mut inner)
    }

    fn list(&self) -> Vec<ChunkMeta> {
        self.inner.lock().metas.values().cloned().collect()
    }

    fn meta(&self, id: ChunkId) -> Result<ChunkMeta, GlError> {
        self.inner.lock().metas.get(&id).cloned().ok_or(GlError::ChunkNotFound(id))
    }

    fn open_cursor(&self, id: ChunkId) -> Result<Cursor, GlError> {
        let inner = self.inner.lock();
        let meta = inner.metas.get(&id).ok_or(GlError::ChunkNotFound(id))?;
        if !meta.sealed {
            return Err(GlError::ChunkNotSealed(id));
        }
        drop(inner);

        let bytes = fs::read(self.chunk_path(id)).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
        let body = Self::decompress_if_needed(&bytes)?;
        Ok(Cursor::new(id, body))
    }

    fn delete(&self, id: ChunkId) -> Result<(), GlError> {
        let mut inner = self.inner.lock();
        if inner.active == id {
            return Err(GlError::RecordCorrupt("refusing to delete the active chunk".into()));
        }
        inner.metas.remove(&id).ok_or(GlError::ChunkNotFound(id))?;
        drop(inner);
        let _ = fs::remove_file(self.chunk_path(id));
        Ok(())
    }

    fn active_chunk_id(&self) -> ChunkId {
        self.inner.lock().active
    }
}

impl FileChunkManager {
    fn seal_locked(&self, inner: &mut Inner) -> Result<(), GlError> {
        let active = inner.active;
        {
            let meta = inner.metas.get_mut(&active).expect("active chunk has metadata");
            if meta.sealed {
                return Ok(()); // idempotent
            }
            meta.sealed = true;
        }

        let path = self.chunk_path(active);
        let raw = fs::read(&path).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;

        let (marker, body) = if self.compression.load(Ordering::Relaxed) {
            let compressed = zstd::stream::encode_all(&raw[..], 0).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
            (MARK_ZSTD, compressed)
        } else {
            (MARK_PLAIN, raw)
        };

        let tmp_path = self.root.join(format!("{}.chunk.tmp.{}.{}", active, process::id(), self.next_nonce()));
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
            tmp.write_all(&[marker]).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
            tmp.write_all(&body).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
            tmp.sync_all().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;

        let new_id = ChunkId::new();
        File::create(self.chunk_path(new_id)).map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
        inner.metas.insert(new_id, ChunkMeta::new(new_id, Utc::now()));
        inner.active = new_id;

        Ok(())
    }
}

/// In-memory chunk manager backing `memory` vaults. No compression, no
/// durability: contents are lost on process exit.
pub struct MemoryChunkManager {
    inner: Mutex<MemInner>,
}

struct MemInner {
    metas: BTreeMap<ChunkId, ChunkMeta>,
    bodies: BTreeMap<ChunkId, Vec<u8>>,
    active: ChunkId,
    rotation: InlineRotation,
}

impl MemoryChunkManager {
    pub fn new(rotation: InlineRotation) -> Self {
        let id = ChunkId::new();
        let mut metas = BTreeMap::new();
        metas.insert(id, ChunkMeta::new(id, Utc::now()));
        let mut bodies = BTreeMap::new();
        bodies.insert(id, Vec::new());
        Self {
            inner: Mutex::new(MemInner { metas, bodies, active: id, rotation }),
        }
    }
}

impl ChunkManager for MemoryChunkManager {
    fn set_compression(&self, enabled: bool) -> Result<(), GlError> {
        if enabled {
            return Err(GlError::CompressionNotSupported);
        }
        Ok(())
    }

    fn append(&self, record: &Record) -> Result<(ChunkId, RecordRef), GlError> {
        let mut inner = self.inner.lock();
        let active = inner.active;
        let frame = format::encode_record(record);
        let pos = inner.bodies.get(&active).map(|b| b.len() as u64).unwrap_or(0);

        inner.bodies.get_mut(&active).unwrap().extend_from_slice(&frame);
        let meta = inner.metas.get_mut(&active).unwrap();
        meta.observe_append(record.ingest_ts, frame.len() as u64);

        let should_seal = inner.rotation.should_seal(inner.metas.get(&active).unwrap());
        let record_ref = RecordRef { chunk_id: active, pos };

        if should_seal {
            self.seal_locked(&mut inner);
        }

        Ok((active, record_ref))
    }

    fn seal(&self) -> Result<(), GlError> {
        let mut inner = self.inner.lock();
        self.seal_locked(&mut inner);
        Ok(())
    }

    fn list(&self) -> Vec<ChunkMeta> {
        self.inner.lock().metas.values().cloned().collect()
    }

    fn meta(&self, id: ChunkId) -> Result<ChunkMeta, GlError> {
        self.inner.lock().metas.get(&id).cloned().ok_or(GlError::ChunkNotFound(id))
    }

    fn open_cursor(&self, id: ChunkId) -> Result<Cursor, GlError> {
        let inner = self.inner.lock();
        let meta = inner.metas.get(&id).ok_or(GlError::ChunkNotFound(id))?;
        if !meta.sealed {
            return Err(GlError::ChunkNotSealed(id));
        }
        let body = inner.bodies.get(&id).cloned().unwrap_or_default();
        Ok(Cursor::new(id, body))
    }

    fn delete(&self, id: ChunkId) -> Result<(), GlError> {
        let mut inner = self.inner.lock();
        if inner.active == id {
            return Err(GlError::RecordCorrupt("refusing to delete the active chunk".into()));
        }
        inner.metas.remove(&id).ok_or(GlError::ChunkNotFound(id))?;
        inner.bodies.remove(&id);
        Ok(())
    }

    fn active_chunk_id(&self) -> ChunkId {
        self.inner.lock().active
    }
}

impl MemoryChunkManager {
    fn seal_locked(&self, inner: &mut MemInner) {
        let active = inner.active;
        if let Some(meta) = inner.metas.get_mut(&active) {
            if meta.sealed {
                return;
            }
            meta.sealed = true;
        }
        let new_id = ChunkId::new();
        inner.metas.insert(new_id, ChunkMeta::new(new_id, Utc::now()));
        inner.bodies.insert(new_id, Vec::new());
        inner.active = new_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Attrs;

    fn rec(raw: &str) -> Record {
        Record {
            source_ts: None,
            ingest_ts: Utc::now(),
            write_ts: Utc::now(),
            attrs: Attrs::new(),
            raw: raw.as_bytes().to_vec(),
        }
    }

    #[test]
    fn append_and_cursor_roundtrip_memory() {
        let mgr = MemoryChunkManager::new(InlineRotation::default());
        let (chunk_id, r1) = mgr.append(&rec("a")).unwrap();
        let (_, r2) = mgr.append(&rec("b")).unwrap();
        assert!(r1.pos < r2.pos);

        mgr.seal().unwrap();
        let mut cursor = mgr.open_cursor(chunk_id).unwrap();
        let (rec1, ref1) = cursor.next().unwrap().unwrap();
        assert_eq!(rec1.raw, b"a");
        assert_eq!(ref1, r1);
        let (rec2, _) = cursor.next().unwrap().unwrap();
        assert_eq!(rec2.raw, b"b");
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn append_and_cursor_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileChunkManager::open(dir.path(), false, InlineRotation::default()).unwrap();
        let active = mgr.active_chunk_id();
        mgr.append(&rec("x")).unwrap();
        mgr.append(&rec("y")).unwrap();
        mgr.seal().unwrap();

        let mut cursor = mgr.open_cursor(active).unwrap();
        let mut raws = Vec::new();
        while let Some((record, _)) = cursor.next().unwrap() {
            raws.push(record.raw);
        }
        assert_eq!(raws, vec![b"x".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn compressed_file_chunk_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileChunkManager::open(dir.path(), true, InlineRotation::default()).unwrap();
        let active = mgr.active_chunk_id();
        for i in 0..20 {
            mgr.append(&rec(&format!("line-{}", i))).unwrap();
        }
        mgr.seal().unwrap();

        let mut cursor = mgr.open_cursor(active).unwrap();
        let mut count = 0;
        while cursor.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn size_rotation_seals_and_opens_new_active() {
        let mgr = MemoryChunkManager::new(InlineRotation { max_bytes: Some(1), max_records: None });
        let (first, _) = mgr.append(&rec("trigger-rotation")).unwrap();
        let second = mgr.active_chunk_id();
        assert_ne!(first, second);
        assert!(mgr.meta(first).unwrap().sealed);
        assert!(!mgr.meta(second).unwrap().sealed);
    }

    #[test]
    fn delete_refuses_active_chunk() {
        let mgr = MemoryChunkManager::new(InlineRotation::default());
        let active = mgr.active_chunk_id();
        assert!(mgr.delete(active).is_err());
    }

    #[test]
    fn open_cursor_on_unsealed_chunk_fails() {
        let mgr = MemoryChunkManager::new(InlineRotation::default());
        let active = mgr.active_chunk_id();
        mgr.append(&rec("a")).unwrap();
        match mgr.open_cursor(active) {
            Err(GlError::ChunkNotSealed(id)) => assert_eq!(id, active),
            other => panic!("expected ChunkNotSealed, got {:?}", other.map(|_| ())),
        }
    }
}
