//! Single-pass iteration over a sealed chunk's records in append order.

use crate::chunk::format::{decode_body, decode_header, HEADER_LEN};
use crate::error::GlError;
use crate::id::ChunkId;
use crate::record::{Record, RecordRef};

pub struct Cursor {
    chunk_id: ChunkId,
    body: Vec<u8>,
    pos: usize,
}

impl Cursor {
    pub(crate) fn new(chunk_id: ChunkId, body: Vec<u8>) -> Self {
        Self { chunk_id, body, pos: 0 }
    }

    /// Returns the next `(Record, RecordRef)` pair, or `None` at end of
    /// chunk, represented here as a plain `Option` since it marks stream end
    /// rather than failure.
    pub fn next(&mut self) -> Result<Option<(Record, RecordRef)>, GlError> {
        if self.pos >= self.body.len() {
            return Ok(None);
        }

        let frame_start = self.pos;
        let header_end = frame_start + HEADER_LEN;
        if self.body.len() < header_end {
            return Err(GlError::RecordCorrupt("truncated header at cursor position".into()));
        }
        let header = decode_header(&self.body[frame_start..header_end])?;
        let frame_len = header.frame_len();
        let frame_end = frame_start + frame_len;
        if self.body.len() < frame_end {
            return Err(GlError::RecordCorrupt("truncated frame at cursor position".into()));
        }

        let record = decode_body(&header, &self.body[header_end..frame_end])?;
        let record_ref = RecordRef { chunk_id: self.chunk_id, pos: frame_start as u64 };
        self.pos = frame_end;

        Ok(Some((record, record_ref)))
    }

    /// Collects every remaining record. Convenience for the index build
    /// helper and for tests; not part of the single-pass contract itself.
    pub fn collect_all(mut self) -> Result<Vec<(Record, RecordRef)>, GlError> {
        let mut out = Vec::new();
        while let Some(pair) = self.next()? {
            out.push(pair);
        }
        Ok(out)
    }
}
