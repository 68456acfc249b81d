//! On-disk record frame: a fixed-size header (version, type, length,
//! timestamps, attrs-length, crc32c of payload) followed by attrs
//! (length-prefixed key/value pairs) and `Raw`.
//!
//! One frame is written per `Append`. A chunk file is just a concatenation
//! of frames; there is no file-level header, so a cursor can resume
//! reading at any frame boundary it has already located.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::GlError;
use crate::record::{Attrs, Record};

pub const MAGIC: [u8; 4] = *b"GLR1";
pub const VERSION: u8 = 1;

const FLAG_HAS_SOURCE_TS: u16 = 0x0001;

/// Size of the fixed portion of a frame, in bytes.
pub const HEADER_LEN: usize = 4 // magic
    + 1 // version
    + 1 // rec_type (reserved)
    + 2 // flags
    + 8 // source_ts_us
    + 8 // ingest_ts_us
    + 8 // write_ts_us
    + 4 // attrs_len
    + 4 // raw_len
    + 4; // crc32c

pub struct RecordHeader {
    pub flags: u16,
    pub source_ts_us: i64,
    pub ingest_ts_us: i64,
    pub write_ts_us: i64,
    pub attrs_len: u32,
    pub raw_len: u32,
    pub crc32c: u32,
}

impl RecordHeader {
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.attrs_len as usize + self.raw_len as usize
    }

    pub fn has_source_ts(&self) -> bool {
        self.flags & FLAG_HAS_SOURCE_TS != 0
    }
}

fn micros_of(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn datetime_of_micros(us: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(us).single().unwrap_or_else(Utc::now)
}

/// Encodes one complete frame: header + attrs + raw.
pub fn encode_record(record: &Record) -> Vec<u8> {
    let attrs_body = encode_attrs(&record.attrs);
    let mut payload = Vec::with_capacity(attrs_body.len() + record.raw.len());
    payload.extend_from_slice(&attrs_body);
    payload.extend_from_slice(&record.raw);

    let crc = crc32c::crc32c(&payload);

    let mut flags = 0u16;
    let source_ts_us = match record.source_ts {
        Some(ts) => {
            flags |= FLAG_HAS_SOURCE_TS;
            micros_of(ts)
        }
        None => 0,
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.write_u8(VERSION).unwrap();
    out.write_u8(0).unwrap(); // rec_type, reserved
    out.write_u16::<LE>(flags).unwrap();
    out.write_i64::<LE>(source_ts_us).unwrap();
    out.write_i64::<LE>(micros_of(record.ingest_ts)).unwrap();
    out.write_i64::<LE>(micros_of(record.write_ts)).unwrap();
    out.write_u32::<LE>(attrs_body.len() as u32).unwrap();
    out.write_u32::<LE>(record.raw.len() as u32).unwrap();
    out.write_u32::<LE>(crc).unwrap();
    out.extend_from_slice(&payload);
    out
}

/// Parses the fixed header from the first `HEADER_LEN` bytes of `buf`.
pub fn decode_header(mut buf: &[u8]) -> Result<RecordHeader, GlError> {
    if buf.len() < HEADER_LEN {
        return Err(GlError::RecordCorrupt("short header".into()));
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[..4]);
    buf = &buf[4..];
    if magic != MAGIC {
        return Err(GlError::RecordCorrupt("bad magic".into()));
    }
    let version = buf.read_u8().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
    if version != VERSION {
        return Err(GlError::RecordCorrupt(format!("unsupported record version {}", version)));
    }
    let _rec_type = buf.read_u8().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
    let flags = buf.read_u16::<LE>().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
    let source_ts_us = buf.read_i64::<LE>().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
    let ingest_ts_us = buf.read_i64::<LE>().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
    let write_ts_us = buf.read_i64::<LE>().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
    let attrs_len = buf.read_u32::<LE>().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
    let raw_len = buf.read_u32::<LE>().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;
    let crc32c = buf.read_u32::<LE>().map_err(|e| GlError::RecordCorrupt(e.to_string()))?;

    Ok(RecordHeader {
        flags,
        source_ts_us,
        ingest_ts_us,
        write_ts_us,
        attrs_len,
        raw_len,
        crc32c,
    })
}

/// Decodes a full frame (header already parsed) given the payload bytes
/// (attrs + raw, exactly `header.attrs_len + header.raw_len` bytes).
pub fn decode_body(header: &RecordHeader, payload: &[u8]) -> Result<Record, GlError> {
    let expected = header.attrs_len as usize + header.raw_len as usize;
    if payload.len() != expected {
        return Err(GlError::RecordCorrupt("payload length mismatch".into()));
    }

    let actual_crc = crc32c::crc32c(payload);
    if actual_crc != header.crc32c {
        return Err(GlError::RecordCorrupt("crc32c mismatch".into()));
    }

    let (attrs_buf, raw_buf) = payload.split_at(header.attrs_len as usize);
    let attrs = decode_attrs(attrs_buf)?;

    Ok(Record {
        source_ts: if header.has_source_ts() {
            Some(datetime_of_micros(header.source_ts_us))
        } else {
            None
        },
        ingest_ts: datetime_of_micros(header.ingest_ts_us),
        write_ts: datetime_of_micros(header.write_ts_us),
        attrs,
        raw: raw_buf.to_vec(),
    })
}

fn encode_attrs(attrs: &Attrs) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in attrs {
        out.write_u32::<LE>(k.len() as u32).unwrap();
        out.extend_from_slice(k.as_bytes());
        out.write_u32::<LE>(v.len() as u32).unwrap();
        out.extend_from_slice(v.as_bytes());
    }
    out
}

fn decode_attrs(mut buf: &[u8]) -> Result<Attrs, GlError> {
    let mut attrs = Attrs::new();
    while !buf.is_empty() {
        let klen = buf
            .read_u32::<LE>()
            .map_err(|e| GlError::RecordCorrupt(e.to_string()))? as usize;
        if buf.len() < klen {
            return Err(GlError::RecordCorrupt("truncated attr key".into()));
        }
        let key = String::from_utf8_lossy(&buf[..klen]).into_owned();
        buf = &buf[klen..];

        let vlen = buf
            .read_u32::<LE>()
            .map_err(|e| GlError::RecordCorrupt(e.to_string()))? as usize;
        if buf.len() < vlen {
            return Err(GlError::RecordCorrupt("truncated attr value".into()));
        }
        let value = String::from_utf8_lossy(&buf[..vlen]).into_owned();
        buf = &buf[vlen..];

        attrs.insert(key, value);
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Record {
        let mut attrs = Attrs::new();
        attrs.insert("level".into(), "info".into());
        attrs.insert("host".into(), "a1".into());
        Record {
            source_ts: Some(Utc.timestamp_micros(1_700_000_000_000_000).unwrap()),
            ingest_ts: Utc.timestamp_micros(1_700_000_000_100_000).unwrap(),
            write_ts: Utc.timestamp_micros(1_700_000_000_200_000).unwrap(),
            attrs,
            raw: b"hello world".to_vec(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let record = sample_record();
        let frame = encode_record(&record);
        let header = decode_header(&frame[..HEADER_LEN]).unwrap();
        let decoded = decode_body(&header, &frame[HEADER_LEN..]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn detects_crc_corruption() {
        let record = sample_record();
        let mut frame = encode_record(&record);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let header = decode_header(&frame[..HEADER_LEN]).unwrap();
        assert!(decode_body(&header, &frame[HEADER_LEN..]).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = encode_record(&sample_record());
        frame[0] = b'X';
        assert!(decode_header(&frame[..HEADER_LEN]).is_err());
    }

    #[test]
    fn no_source_ts_roundtrips_as_none() {
        let mut record = sample_record();
        record.source_ts = None;
        let frame = encode_record(&record);
        let header = decode_header(&frame[..HEADER_LEN]).unwrap();
        let decoded = decode_body(&header, &frame[HEADER_LEN..]).unwrap();
        assert_eq!(decoded.source_ts, None);
    }
}
