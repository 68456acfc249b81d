//! Extracts `SourceTS` from raw bytes by trying a fixed set of timestamp
//! formats and keeping whichever match starts earliest in the text.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::digest::Digester;
use crate::record::IngestMessage;

lazy_static! {
    static ref RFC3339: Regex =
        Regex::new(r"\d{4}-\d{2}-\d{2}[Tt]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|z|[+-]\d{2}:\d{2})").unwrap();
    static ref APPLE_UNIFIED: Regex =
        Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)? ?[+-]\d{4}").unwrap();
    static ref RFC3164: Regex =
        Regex::new(r"(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec) {1,2}\d{1,2} \d{2}:\d{2}:\d{2}").unwrap();
    static ref COMMON_LOG: Regex =
        Regex::new(r"\d{2}/(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4}").unwrap();
    static ref GO_RUBY: Regex = Regex::new(r"\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}").unwrap();
    static ref CTIME: Regex = Regex::new(
        r"(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun) (?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec) {1,2}\d{1,2} \d{2}:\d{2}:\d{2} \d{4}"
    )
    .unwrap();
}

/// Tries every format against `text`, returning the parsed instant from
/// whichever successful match starts at the lowest byte offset.
fn earliest_match(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut best: Option<(usize, DateTime<Utc>)> = None;

    let mut consider = |start: usize, parsed: Option<DateTime<Utc>>| {
        if let Some(parsed) = parsed {
            if best.map_or(true, |(best_start, _)| start < best_start) {
                best = Some((start, parsed));
            }
        }
    };

    if let Some(m) = RFC3339.find(text) {
        consider(m.start(), DateTime::parse_from_rfc3339(m.as_str()).ok().map(|t| t.with_timezone(&Utc)));
    }
    if let Some(m) = APPLE_UNIFIED.find(text) {
        consider(m.start(), parse_apple_unified(m.as_str()));
    }
    if let Some(m) = COMMON_LOG.find(text) {
        consider(m.start(), parse_common_log(m.as_str()));
    }
    if let Some(m) = CTIME.find(text) {
        consider(m.start(), parse_ctime(m.as_str()));
    }
    if let Some(m) = RFC3164.find(text) {
        consider(m.start(), parse_rfc3164(m.as_str(), now));
    }
    if let Some(m) = GO_RUBY.find(text) {
        consider(m.start(), parse_go_ruby(m.as_str()));
    }

    best.map(|(_, parsed)| parsed)
}

fn parse_apple_unified(s: &str) -> Option<DateTime<Utc>> {
    let sign_pos = s.rfind(|c| c == '+' || c == '-')?;
    let (date_time, tz) = s.split_at(sign_pos);
    let naive = NaiveDateTime::parse_from_str(date_time.trim(), "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(date_time.trim(), "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    let offset = parse_compact_offset(tz.trim())?;
    Some((naive - offset).and_utc())
}

fn parse_compact_offset(s: &str) -> Option<Duration> {
    // "+0700" / "-0700"
    if s.len() != 5 {
        return None;
    }
    let sign = if s.starts_with('-') { -1 } else { 1 };
    let hours: i64 = s[1..3].parse().ok()?;
    let minutes: i64 = s[3..5].parse().ok()?;
    Some(Duration::minutes(sign * (hours * 60 + minutes)))
}

fn parse_common_log(s: &str) -> Option<DateTime<Utc>> {
    let (date_time, tz) = s.rsplit_once(' ')?;
    let naive = NaiveDateTime::parse_from_str(date_time, "%d/%b/%Y:%H:%M:%S").ok()?;
    let offset = parse_compact_offset(tz)?;
    Some((naive - offset).and_utc())
}

fn parse_ctime(s: &str) -> Option<DateTime<Utc>> {
    // "Mon Jan  2 15:04:05 2006" (day may be space-padded)
    let normalized = collapse_spaces(s);
    let naive = NaiveDateTime::parse_from_str(&normalized, "%a %b %d %H:%M:%S %Y").ok()?;
    Some(naive.and_utc())
}

fn parse_go_ruby(s: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y/%m/%d %H:%M:%S").ok()?;
    Some(naive.and_utc())
}

/// RFC 3164 has no year; adopt `now`'s year, rolling back one year if the
/// derived instant would be more than 24h in the future (handles a
/// December 31st line parsed just after a January 1st rollover).
fn parse_rfc3164(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalized = collapse_spaces(s);
    let mut parts = normalized.splitn(3, ' ');
    let month = parts.next()?;
    let day: u32 = parts.next()?.parse().ok()?;
    let time = parts.next()?;
    let naive_time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    let month_num = month_number(month)?;

    let mut year = now.year();
    let mut date = NaiveDate::from_ymd_opt(year, month_num, day)?;
    let mut candidate = Utc.from_utc_datetime(&date.and_time(naive_time));
    if candidate - now > Duration::hours(24) {
        year -= 1;
        date = NaiveDate::from_ymd_opt(year, month_num, day)?;
        candidate = Utc.from_utc_datetime(&date.and_time(naive_time));
    }
    Some(candidate)
}

fn month_number(abbrev: &str) -> Option<u32> {
    Some(match abbrev {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    })
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct TimestampDigester;

impl Digester for TimestampDigester {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn digest(&self, msg: &mut IngestMessage) {
        if msg.source_ts.is_some() {
            return;
        }
        let text = String::from_utf8_lossy(&msg.raw);
        msg.source_ts = earliest_match(&text, msg.ingest_ts);
    }
}
