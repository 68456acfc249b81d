//! Sets `Attrs["level"]` from a leading syslog priority token or a
//! `level`/`severity` key found in the raw bytes.

use crate::digest::Digester;
use crate::record::IngestMessage;

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Standard RFC 5424 severity (0..=7, via `priority mod 8`) bucketed into
/// GastroLog's five-value level scale. `trace` has no syslog severity of
/// its own; it is only reachable through the KV/JSON synonym table.
fn severity_to_level(severity: u8) -> &'static str {
    match severity {
        0..=3 => "error",
        4 => "warn",
        5 | 6 => "info",
        _ => "debug",
    }
}

/// Case-insensitive synonyms recognized in `level=`/`severity=` key-value
/// pairs and their JSON equivalents.
fn normalize_synonym(raw: &str) -> Option<&'static str> {
    let lower = raw.to_ascii_lowercase();
    match lower.as_str() {
        "error" | "err" | "fatal" | "critical" | "crit" | "emerg" | "emergency" | "alert" | "severe" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" | "information" | "informational" | "notice" => Some("info"),
        "debug" | "dbg" | "fine" => Some("debug"),
        "trace" | "verbose" | "finest" | "finer" => Some("trace"),
        _ => None,
    }
}

/// Parses a leading `<N>` token (N = 0..=999, as a raw decimal, not
/// necessarily a valid RFC 3164 priority) and returns its severity class.
fn leading_priority_severity(raw: &[u8]) -> Option<&'static str> {
    if raw.first() != Some(&b'<') {
        return None;
    }
    let close = raw.iter().position(|&b| b == b'>')?;
    if close < 2 {
        return None;
    }
    let digits = std::str::from_utf8(&raw[1..close]).ok()?;
    let priority: u32 = digits.parse().ok()?;
    if priority > 999 {
        return None;
    }
    Some(severity_to_level((priority % 8) as u8))
}

/// Finds the first `level` or `severity` key in `key=value` or JSON
/// `"key": "value"` form and normalizes its value via the synonym table.
fn kv_or_json_level(raw: &[u8]) -> Option<&'static str> {
    let text = String::from_utf8_lossy(raw);
    for key in ["level", "severity"] {
        if let Some(value) = find_key_value(&text, key) {
            if let Some(level) = normalize_synonym(&value) {
                return Some(level);
            }
        }
    }
    None
}

/// Looks for `key=value` (value ends at whitespace, optionally quoted) or
/// `"key": "value"` / `"key":"value"` and returns the raw value text.
fn find_key_value(text: &str, key: &str) -> Option<String> {
    // key=value, possibly quoted
    let eq_needle = format!("{}=", key);
    if let Some(pos) = find_word_boundary(text, &eq_needle) {
        let rest = &text[pos + eq_needle.len()..];
        return Some(scan_bare_or_quoted(rest));
    }

    // "key": "value" (JSON-ish, tolerant of missing quotes around key)
    for quoted_key in [format!("\"{}\"", key), key.to_string()] {
        if let Some(pos) = text.find(&quoted_key) {
            let rest = &text[pos + quoted_key.len()..];
            let rest = rest.trim_start();
            if let Some(rest) = rest.strip_prefix(':') {
                let rest = rest.trim_start();
                return Some(scan_bare_or_quoted(rest));
            }
        }
    }
    None
}

/// `needle` must start at index 0 or be preceded by a non-alphanumeric
/// character, so `"loglevel=x"` doesn't match key `level`.
fn find_word_boundary(text: &str, needle: &str) -> Option<usize> {
    let mut start = 0;
    while let Some(rel) = text[start..].find(needle) {
        let pos = start + rel;
        let boundary_ok = pos == 0
            || !text[..pos].chars().next_back().map(|c| c.is_alphanumeric() || c == '_').unwrap_or(false);
        if boundary_ok {
            return Some(pos);
        }
        start = pos + needle.len();
    }
    None
}

fn scan_bare_or_quoted(rest: &str) -> String {
    if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next().unwrap_or("").to_string()
    } else {
        rest.split(|c: char| c.is_whitespace() || c == ',' || c == '}').next().unwrap_or("").to_string()
    }
}

pub struct LevelDigester;

impl Digester for LevelDigester {
    fn name(&self) -> &'static str {
        "level"
    }

    fn digest(&self, msg: &mut IngestMessage) {
        if msg.attrs.contains_key("level") || msg.attrs.contains_key("severity") || msg.attrs.contains_key("severity_name") {
            return;
        }

        let level = leading_priority_severity(&msg.raw).or_else(|| kv_or_json_level(&msg.raw));

        if let Some(level) = level {
            debug_assert!(LEVELS.contains(&level));
            msg.attrs.insert("level".to_string(), level.to_string());
        }
    }
}
