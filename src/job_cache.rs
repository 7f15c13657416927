use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::models::JobMetadata;

const MAX_STATUS_MESSAGES: usize = 50;

#[derive(Debug)]
struct CacheEntry {
    metadata: JobMetadata,
    expires_at: Instant,
}

/// In-memory progress metadata keyed by job token. Entries expire after a
/// fixed TTL regardless of whether the job finished; a miss only means no
/// progress detail is available.
#[derive(Debug)]
pub struct JobCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl JobCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, token: &str, metadata: JobMetadata) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.lock().insert(
            token.to_string(),
            CacheEntry {
                metadata,
                expires_at,
            },
        );
    }

    pub fn get(&self, token: &str) -> Option<JobMetadata> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(token) {
            Some(entry) if entry.expires_at > now => Some(entry.metadata.clone()),
            Some(_) => {
                entries.remove(token);
                None
            }
            None => None,
        }
    }

    /// Applies `apply` to a live entry; returns false when there is none.
    /// The TTL is not extended.
    pub fn update<F>(&self, token: &str, apply: F) -> bool
    where
        F: FnOnce(&mut JobMetadata),
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(token) {
            Some(entry) if entry.expires_at > now => {
                apply(&mut entry.metadata);
                true
            }
            _ => false,
        }
    }

    /// Records a line of process output and, for `progress: <n>` lines, the
    /// percent complete.
    pub fn record_output(&self, token: &str, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        let percent = parse_progress(line);
        self.update(token, |metadata| {
            if let Some(percent) = percent {
                metadata.percent = Some(percent);
            }
            if metadata.process_status_messages.len() >= MAX_STATUS_MESSAGES {
                metadata.process_status_messages.remove(0);
            }
            metadata.process_status_messages.push(line.to_string());
        })
    }

    pub fn remove(&self, token: &str) {
        self.entries.lock().remove(token);
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_progress(line: &str) -> Option<f64> {
    let (label, value) = line.split_once(':')?;
    if !label.trim().eq_ignore_ascii_case("progress") {
        return None;
    }
    let value = value.trim().trim_end_matches('%').trim();
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn metadata(feature_count: u64) -> JobMetadata {
        JobMetadata {
            feature_count,
            start_time: Utc::now(),
            percent: None,
            process_status_messages: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = JobCache::new(Duration::from_secs(60));
        cache.set("tok", metadata(3));
        assert_eq!(cache.get("tok").map(|m| m.feature_count), Some(3));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("tok").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let cache = JobCache::new(Duration::from_secs(10));
        cache.set("old", metadata(1));
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set("new", metadata(2));
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn output_lines_update_progress() {
        let cache = JobCache::new(Duration::from_secs(60));
        cache.set("tok", metadata(1));
        assert!(cache.record_output("tok", "loading datasets"));
        assert!(cache.record_output("tok", "progress: 42.5%"));
        assert!(!cache.record_output("missing", "progress: 10"));

        let entry = cache.get("tok").expect("entry");
        assert_eq!(entry.percent, Some(42.5));
        assert_eq!(entry.process_status_messages.len(), 2);
    }

    #[test]
    fn progress_parser_ignores_other_lines() {
        assert_eq!(parse_progress("Progress: 120"), Some(100.0));
        assert_eq!(parse_progress("step: 3"), None);
        assert_eq!(parse_progress("progress: soon"), None);
    }
}
