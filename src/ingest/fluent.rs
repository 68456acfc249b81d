//! Fluent Forward v1 ingester: one task per TCP connection, msgpack framed.

use std::collections::HashMap;
use std::convert::TryInto;
use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use log::{debug, warn};
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::ingest::Ingester;
use crate::record::{Attrs, IngestMessage};
use crate::scheduler::CancelFlag;

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct FluentIngester {
    pub id: String,
    pub bind: SocketAddr,
}

#[async_trait]
impl Ingester for FluentIngester {
    async fn run(&self, cancel: CancelFlag, out: mpsc::Sender<IngestMessage>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind).await?;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            let accept = tokio::time::timeout(std::time::Duration::from_millis(200), listener.accept()).await;
            let (stream, peer) = match accept {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!("fluent ingester '{}' accept error: {}", self.id, e);
                    continue;
                }
                Err(_timeout) => continue, // poll cancel again
            };
            let id = self.id.clone();
            let out = out.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, &id, out, cancel).await {
                    debug!("fluent connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    ingester_id: &str,
    out: mpsc::Sender<IngestMessage>,
    cancel: CancelFlag,
) -> anyhow::Result<()> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }

        while let Some((value, consumed)) = try_parse_one(&buf) {
            buf.drain(..consumed);
            match decode_frame(&value, ingester_id) {
                Ok((messages, ack_chunk)) => {
                    for msg in messages {
                        if out.send(msg).await.is_err() {
                            return Ok(());
                        }
                    }
                    if let Some(chunk_id) = ack_chunk {
                        let ack = Value::Map(vec![(Value::String("ack".into()), Value::String(chunk_id.into()))]);
                        let mut bytes = Vec::new();
                        rmpv::encode::write_value(&mut bytes, &ack)?;
                        stream.write_all(&bytes).await?;
                    }
                }
                Err(e) => {
                    warn!("fluent ingester '{}' malformed frame: {}", ingester_id, e);
                    return Ok(());
                }
            }
        }

        if buf.len() > MAX_FRAME_BYTES {
            warn!("fluent ingester '{}' frame exceeds {} bytes, closing connection", ingester_id, MAX_FRAME_BYTES);
            return Ok(());
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(()); // peer closed
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn try_parse_one(buf: &[u8]) -> Option<(Value, usize)> {
    if buf.is_empty() {
        return None;
    }
    let mut cursor = Cursor::new(buf);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => Some((value, cursor.position() as usize)),
        Err(_) => None,
    }
}

/// Returns the messages produced by one top-level frame plus an optional
/// ack chunk id from the options map.
fn decode_frame(value: &Value, ingester_id: &str) -> anyhow::Result<(Vec<IngestMessage>, Option<String>)> {
    let items = value.as_array().ok_or_else(|| anyhow::anyhow!("frame is not an array"))?;
    if !(2..=4).contains(&items.len()) {
        anyhow::bail!("frame array length {} out of range", items.len());
    }
    let tag = items[0].as_str().ok_or_else(|| anyhow::anyhow!("tag is not a string"))?.to_string();
    let second = &items[1];

    if let Some(blob) = second.as_slice() {
        let options = items.get(2).cloned();
        let ack = options.as_ref().and_then(options_ack);
        let gzip = options.as_ref().map_or(false, options_compressed_gzip);
        let decoded = if gzip {
            let mut out = Vec::new();
            GzDecoder::new(blob).read_to_end(&mut out)?;
            out
        } else {
            blob.to_vec()
        };
        let mut messages = Vec::new();
        let mut cursor = Cursor::new(decoded.as_slice());
        while (cursor.position() as usize) < decoded.len() {
            let time_value = rmpv::decode::read_value(&mut cursor)?;
            let record_value = rmpv::decode::read_value(&mut cursor)?;
            messages.push(build_message(&tag, &time_value, &record_value, ingester_id));
        }
        return Ok((messages, ack));
    }

    if let Some(entries) = second.as_array() {
        let options = items.get(2).cloned();
        let ack = options.as_ref().and_then(options_ack);
        let mut messages = Vec::new();
        for entry in entries {
            let pair = entry.as_array().ok_or_else(|| anyhow::anyhow!("forward entry is not an array"))?;
            if pair.len() < 2 {
                anyhow::bail!("forward entry too short");
            }
            messages.push(build_message(&tag, &pair[0], &pair[1], ingester_id));
        }
        return Ok((messages, ack));
    }

    // Message mode: [tag, time, record, options?]
    let record = items.get(2).ok_or_else(|| anyhow::anyhow!("message frame missing record"))?;
    let options = items.get(3).cloned();
    let ack = options.as_ref().and_then(options_ack);
    Ok((vec![build_message(&tag, second, record, ingester_id)], ack))
}

fn options_ack(options: &Value) -> Option<String> {
    map_get(options, "chunk").and_then(|v| v.as_str().map(|s| s.to_string()))
}

fn options_compressed_gzip(options: &Value) -> bool {
    map_get(options, "compressed").and_then(|v| v.as_str().map(|s| s == "gzip")).unwrap_or(false)
}

fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_map()?.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v)
}

fn decode_time(value: &Value) -> DateTime<Utc> {
    match value {
        Value::Integer(i) => i.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()).unwrap_or_else(Utc::now),
        Value::F64(f) => float_to_ts(*f),
        Value::F32(f) => float_to_ts(*f as f64),
        Value::Ext(tag, data) if *tag == 0 && data.len() == 8 => {
            let secs = u32::from_be_bytes(data[0..4].try_into().unwrap());
            let nanos = u32::from_be_bytes(data[4..8].try_into().unwrap());
            Utc.timestamp_opt(secs as i64, nanos).single().unwrap_or_else(Utc::now)
        }
        _ => Utc::now(),
    }
}

fn float_to_ts(f: f64) -> DateTime<Utc> {
    let secs = f.trunc() as i64;
    let nanos = (f.fract() * 1e9).round() as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(Utc::now)
}

fn build_message(tag: &str, time_value: &Value, record: &Value, ingester_id: &str) -> IngestMessage {
    let source_ts = decode_time(time_value);

    let mut attrs = Attrs::new();
    let mut raw = None;

    if let Some(entries) = record.as_map() {
        for (k, v) in entries {
            let key = k.as_str().map(|s| s.to_string()).unwrap_or_else(|| value_to_string(k));
            let value_str = value_to_string(v);
            if raw.is_none() && matches!(key.as_str(), "message" | "log" | "msg") {
                raw = Some(value_str.clone());
            }
            attrs.insert(key, value_str);
        }
    }
    attrs.insert("tag".to_string(), tag.to_string());

    let raw = raw.unwrap_or_else(|| serde_json::to_string(record).unwrap_or_default());

    let mut msg = IngestMessage::new(raw.into_bytes(), ingester_id.to_string());
    msg.attrs = attrs;
    msg.source_ts = Some(source_ts);
    msg
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.as_str().unwrap_or_default().to_string(),
        Value::Nil => String::new(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::F32(f) => f.to_string(),
        Value::F64(f) => f.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    #[test]
    fn message_mode_extracts_message_key_as_raw() {
        let frame = Value::Array(vec![
            Value::String("app".into()),
            Value::Integer(1_700_000_000.into()),
            Value::Map(vec![(Value::String("message".into()), Value::String("hi".into()))]),
        ]);
        let (messages, ack) = decode_frame(&frame, "fluent1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].raw, b"hi");
        assert_eq!(messages[0].attrs.get("tag"), Some(&"app".to_string()));
        assert_eq!(ack, None);
    }

    #[test]
    fn message_mode_with_chunk_ack() {
        let frame = Value::Array(vec![
            Value::String("app".into()),
            Value::Integer(1_700_000_000.into()),
            Value::Map(vec![(Value::String("message".into()), Value::String("hi".into()))]),
            Value::Map(vec![(Value::String("chunk".into()), Value::String("c1".into()))]),
        ]);
        let (_, ack) = decode_frame(&frame, "fluent1").unwrap();
        assert_eq!(ack, Some("c1".to_string()));
    }

    #[test]
    fn forward_mode_yields_multiple_messages() {
        let frame = Value::Array(vec![
            Value::String("app".into()),
            Value::Array(vec![
                Value::Array(vec![Value::Integer(1.into()), Value::Map(vec![(Value::String("message".into()), Value::String("a".into()))])]),
                Value::Array(vec![Value::Integer(2.into()), Value::Map(vec![(Value::String("message".into()), Value::String("b".into()))])]),
            ]),
        ]);
        let (messages, _) = decode_frame(&frame, "fluent1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].raw, b"a");
        assert_eq!(messages[1].raw, b"b");
    }

    #[test]
    fn packed_forward_mode_decodes_concatenated_entries() {
        let entry1 = encode(&Value::Integer(1.into()));
        let mut entry1_record = encode(&Value::Map(vec![(Value::String("message".into()), Value::String("x".into()))]));
        let mut blob = entry1;
        blob.append(&mut entry1_record);

        let frame = Value::Array(vec![Value::String("app".into()), Value::Binary(blob)]);
        let (messages, _) = decode_frame(&frame, "fluent1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].raw, b"x");
    }

    #[test]
    fn event_time_extension_decodes_seconds_and_nanos() {
        let data = {
            let mut v = Vec::new();
            v.extend_from_slice(&1_700_000_000u32.to_be_bytes());
            v.extend_from_slice(&500_000_000u32.to_be_bytes());
            v
        };
        let ts = decode_time(&Value::Ext(0, data));
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_nanos(), 500_000_000);
    }

    #[test]
    fn non_record_key_falls_back_to_json_encoding() {
        let frame = Value::Array(vec![
            Value::String("app".into()),
            Value::Integer(1.into()),
            Value::Map(vec![(Value::String("other".into()), Value::String("v".into()))]),
        ]);
        let (messages, _) = decode_frame(&frame, "fluent1").unwrap();
        assert!(String::from_utf8(messages[0].raw.clone()).unwrap().contains("other"));
    }
}
