//! Rotation and retention policy evaluation. Both take a vault's chunk
//! metadata and decide "should we act now", but a rotation policy asks it
//! of the currently active chunk while a retention policy asks it of the
//! full sealed-chunk list.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::record::ChunkMeta;

/// When to seal the active chunk and start a new one. All variants are
/// evaluated by the `rotate:<vaultID>` scheduler task via `due`; `MaxBytes`
/// and `MaxRecords` are additionally checked inline by
/// `ChunkManager::append` via `InlineRotation` so a burst of writes doesn't
/// have to wait for the next scheduler tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RotationPolicy {
    MaxBytes { bytes: u64 },
    MaxAge { seconds: i64 },
    MaxRecords { records: u64 },
    Cron { expr: String },
}

impl RotationPolicy {
    /// `MaxBytes` is handled by `InlineRotation` inside `append` and always
    /// returns `false` here to avoid double-sealing.
    pub fn due(&self, active: &ChunkMeta, now: DateTime<Utc>) -> bool {
        match self {
            RotationPolicy::MaxAge { seconds } => now - active.created >= Duration::seconds(*seconds),
            RotationPolicy::MaxRecords { records } => active.record_count >= *records,
            RotationPolicy::Cron { expr } => match Schedule::from_str(expr) {
                // Due once a scheduled firing has passed since the active
                // chunk was created; malformed expressions never fire
                // rather than panicking the scheduler task.
                Ok(schedule) => schedule.after(&active.created).next().map_or(false, |next| next <= now),
                Err(_) => false,
            },
            RotationPolicy::MaxBytes { .. } => false,
        }
    }
}

/// When to drop sealed chunks. Applied in the fixed order age, then byte
/// budget, then chunk-count cap, each pass operating on whatever chunks
/// the previous pass left behind so pruning never deletes more than one
/// policy's worth of history per rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetentionPolicy {
    MaxAge { seconds: i64 },
    MaxBytes { bytes: u64 },
    MaxChunks { chunks: u64 },
}

/// Given every sealed chunk's metadata (oldest first) and the policy set,
/// returns the ids that should be deleted, oldest first.
pub fn chunks_to_prune(sealed: &[ChunkMeta], policies: &[RetentionPolicy], now: DateTime<Utc>) -> Vec<crate::id::ChunkId> {
    let mut survivors: Vec<&ChunkMeta> = sealed.iter().collect();
    let mut pruned = Vec::new();

    for policy in policies {
        let (keep, drop): (Vec<_>, Vec<_>) = match policy {
            RetentionPolicy::MaxAge { seconds } => survivors.iter().partition(|meta| match meta.max_ts {
                Some(max_ts) => now - max_ts < Duration::seconds(*seconds),
                None => true, // no records ever written; nothing to judge staleness by
            }),
            RetentionPolicy::MaxBytes { bytes } => {
                // Oldest-first running total; anything once the budget is
                // exceeded is dropped.
                let mut total = 0u64;
                let mut keep = Vec::new();
                let mut drop = Vec::new();
                for meta in &survivors {
                    total += meta.byte_size;
                    if total <= *bytes {
                        keep.push(*meta);
                    } else {
                        drop.push(*meta);
                    }
                }
                (keep, drop)
            }
            RetentionPolicy::MaxChunks { chunks } => {
                let chunks = *chunks as usize;
                if survivors.len() <= chunks {
                    (survivors.clone(), Vec::new())
                } else {
                    let overflow = survivors.len() - chunks;
                    (survivors[overflow..].to_vec(), survivors[..overflow].to_vec())
                }
            }
        };
        pruned.extend(drop.iter().map(|meta| meta.id));
        survivors = keep;
    }

    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ChunkId;

    fn meta(id: ChunkId, created: DateTime<Utc>, byte_size: u64) -> ChunkMeta {
        ChunkMeta {
            id,
            created,
            sealed: true,
            record_count: 1,
            byte_size,
            min_ts: Some(created),
            max_ts: Some(created),
        }
    }

    #[test]
    fn max_records_rotation_fires_at_threshold() {
        let policy = RotationPolicy::MaxRecords { records: 3 };
        let mut active = ChunkMeta::new(ChunkId::new(), Utc::now());
        active.record_count = 2;
        assert!(!policy.due(&active, Utc::now()));
        active.record_count = 3;
        assert!(policy.due(&active, Utc::now()));
    }

    #[test]
    fn max_age_rotation_fires_after_duration() {
        let policy = RotationPolicy::MaxAge { seconds: 60 };
        let created = Utc::now() - Duration::seconds(61);
        let active = ChunkMeta::new(ChunkId::new(), created);
        assert!(policy.due(&active, Utc::now()));
    }

    #[test]
    fn cron_rotation_fires_once_a_schedule_boundary_has_passed() {
        let policy = RotationPolicy::Cron { expr: "* * * * * *".to_string() };
        let created = Utc::now() - Duration::seconds(2);
        let active = ChunkMeta::new(ChunkId::new(), created);
        assert!(policy.due(&active, Utc::now()));
    }

    #[test]
    fn cron_rotation_not_due_before_next_boundary() {
        let policy = RotationPolicy::Cron { expr: "0 0 0 1 1 *".to_string() };
        let now = Utc::now();
        let active = ChunkMeta::new(ChunkId::new(), now);
        assert!(!policy.due(&active, now));
    }

    #[test]
    fn malformed_cron_expression_is_never_due() {
        let policy = RotationPolicy::Cron { expr: "not a cron expression".to_string() };
        let active = ChunkMeta::new(ChunkId::new(), Utc::now() - Duration::seconds(1000));
        assert!(!policy.due(&active, Utc::now()));
    }

    #[test]
    fn max_chunks_prunes_oldest_first() {
        let now = Utc::now();
        let ids: Vec<_> = (0..5).map(|_| ChunkId::new()).collect();
        let sealed: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| meta(*id, now - Duration::seconds((5 - i) as i64 * 60), 100))
            .collect();
        let pruned = chunks_to_prune(&sealed, &[RetentionPolicy::MaxChunks { chunks: 2 }], now);
        assert_eq!(pruned, vec![ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn max_bytes_prunes_once_running_total_exceeds_budget() {
        let now = Utc::now();
        let ids: Vec<_> = (0..3).map(|_| ChunkId::new()).collect();
        let sealed = vec![
            meta(ids[0], now - Duration::seconds(180), 100),
            meta(ids[1], now - Duration::seconds(120), 100),
            meta(ids[2], now - Duration::seconds(60), 100),
        ];
        let pruned = chunks_to_prune(&sealed, &[RetentionPolicy::MaxBytes { bytes: 150 }], now);
        assert_eq!(pruned, vec![ids[1], ids[2]]);
    }

    #[test]
    fn policies_compose_in_order() {
        let now = Utc::now();
        let ids: Vec<_> = (0..4).map(|_| ChunkId::new()).collect();
        let sealed = vec![
            meta(ids[0], now - Duration::seconds(400), 10),
            meta(ids[1], now - Duration::seconds(300), 10),
            meta(ids[2], now - Duration::seconds(200), 10),
            meta(ids[3], now - Duration::seconds(100), 10),
        ];
        let policies = vec![
            RetentionPolicy::MaxAge { seconds: 350 },
            RetentionPolicy::MaxChunks { chunks: 2 },
        ];
        let pruned = chunks_to_prune(&sealed, &policies, now);
        assert_eq!(pruned, vec![ids[0], ids[1]]);
    }

    #[test]
    fn max_age_prunes_by_max_ts_not_created() {
        let now = Utc::now();
        let id = ChunkId::new();
        // Created long ago, but still received a record recently: MaxTS is
        // what matters, so this chunk must survive.
        let mut recently_active = meta(id, now - Duration::seconds(1000), 10);
        recently_active.max_ts = Some(now - Duration::seconds(10));

        let pruned = chunks_to_prune(&[recently_active], &[RetentionPolicy::MaxAge { seconds: 60 }], now);
        assert!(pruned.is_empty());
    }

    #[test]
    fn max_age_keeps_chunks_with_no_records() {
        let now = Utc::now();
        let empty = ChunkMeta::new(ChunkId::new(), now - Duration::seconds(1000));
        let pruned = chunks_to_prune(&[empty], &[RetentionPolicy::MaxAge { seconds: 60 }], now);
        assert!(pruned.is_empty());
    }
}
