use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime handle cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Caching policy for live backend session handles.  Handles are expensive
/// to create, so they're reused across turns as long as the control
/// signature still matches and the handle hasn't sat idle past the TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleCacheConfig {
    /// Idle seconds after which a cached handle is considered stale.
    #[serde(default = "d_1800")]
    pub ttl_seconds: u64,
}

impl Default for HandleCacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 1_800 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Followup queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Buffering policy for messages that arrive while a turn is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupConfig {
    /// Maximum queued followups per session before new ones are rejected.
    #[serde(default = "d_10")]
    pub max_queued: usize,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self { max_queued: 10 }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_1800() -> u64 {
    1_800
}
fn d_10() -> usize {
    10
}
