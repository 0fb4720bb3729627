//! Idempotency keys for scheduled and chained triggers, plus the TTL'd
//! seen-set that enforces run-once semantics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Keys are a hex sha256 truncated to 32 chars, plenty for dedupe and
/// short enough for log lines.
const KEY_LEN: usize = 32;

fn digest_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(KEY_LEN);
    hex
}

/// Deterministic key for one scheduled firing of a job.  The same job at
/// the same scheduled instant always maps to the same key, so a retried
/// delivery of the trigger deduplicates.
pub fn schedule_key(job_id: &str, scheduled_ms: i64) -> String {
    digest_key(&["schedule", job_id, &scheduled_ms.to_string()])
}

/// Deterministic key for a chained child job: one parent run spawns each
/// child at most once.
pub fn chain_key(parent_run_id: &str, child_job_id: &str) -> String {
    digest_key(&["chain", parent_run_id, child_job_id])
}

/// Key for an operator-requested immediate run.  Salted with a fresh
/// nonce so every request runs, by design never deduplicated.
pub fn run_now_key(job_id: &str) -> String {
    let nonce = uuid::Uuid::new_v4().to_string();
    digest_key(&["run_now", job_id, &nonce])
}

pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Remembers which idempotency keys already ran, for a TTL.  The
/// check-then-insert is atomic under one lock, so two racing triggers
/// with the same key resolve to exactly one run.
pub struct SeenSet {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_TTL)
    }
}

impl SeenSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the key was absent (caller should run) and
    /// records it; false when it was already seen within the TTL.
    pub fn insert_if_absent(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        match seen.get(key) {
            Some(_) => false,
            None => {
                seen.insert(key.to_owned(), now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}
