//! Runtime handle cache — live backend session references, reused across
//! turns while the control signature matches and the TTL hasn't elapsed.
//!
//! The cache itself is a dumb keyed store; the orchestrator decides when a
//! cached handle is trustworthy (see `Orchestrator::resolve_handle`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use swb_domain::Result;

/// Execution mode of a backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Conversation state lives in the backend across turns.
    Persistent,
    /// Fresh backend session per turn.
    OneShot,
}

/// A live backend conversational session.  Opened by a [`SessionBackend`],
/// closed best-effort when evicted.
#[async_trait]
pub trait BackendSession: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Opens backend sessions.  This is the expensive operation the cache
/// exists to amortize.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn open(
        &self,
        session_key: &str,
        agent_id: &str,
        workdir: &str,
    ) -> Result<Arc<dyn BackendSession>>;

    /// Identifier for logging ("claude", "codex", …).
    fn id(&self) -> &str;
}

/// A cached reference to a live backend session.
#[derive(Clone)]
pub struct RuntimeHandle {
    pub session_key: String,
    pub backend_id: String,
    pub agent_id: String,
    pub mode: RunMode,
    pub workdir: String,
    /// Hash of the control-plane configuration that produced this handle;
    /// a mismatch on the next turn forces recreation.
    pub signature: String,
    pub opened_at: Instant,
    pub last_used: Instant,
    pub session: Arc<dyn BackendSession>,
}

impl RuntimeHandle {
    pub fn idle(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }
}

/// Keyed store of runtime handles.  Unique keys, no iteration order.
pub struct RuntimeHandleCache {
    handles: Mutex<HashMap<String, RuntimeHandle>>,
}

impl Default for RuntimeHandleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeHandleCache {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<RuntimeHandle> {
        self.handles.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, handle: RuntimeHandle) {
        self.handles.lock().insert(key.to_owned(), handle);
    }

    /// Remove a handle, returning it so the caller can close the backend
    /// session.
    pub fn clear(&self, key: &str) -> Option<RuntimeHandle> {
        self.handles.lock().remove(key)
    }

    /// Mark a handle as just used (resets the idle clock).
    pub fn touch(&self, key: &str) {
        if let Some(h) = self.handles.lock().get_mut(key) {
            h.last_used = Instant::now();
        }
    }

    pub fn size(&self) -> usize {
        self.handles.lock().len()
    }
}

/// Fire-and-forget close of a stale handle's backend session.  Failure is
/// logged and never blocks creation of the replacement.
pub fn spawn_close(handle: RuntimeHandle, reason: &'static str) {
    tokio::spawn(async move {
        if let Err(e) = handle.session.close().await {
            tracing::warn!(
                session_key = %handle.session_key,
                backend = %handle.backend_id,
                reason,
                error = %e,
                "failed to close stale runtime handle"
            );
        } else {
            tracing::debug!(
                session_key = %handle.session_key,
                backend = %handle.backend_id,
                reason,
                "stale runtime handle closed"
            );
        }
    });
}

/// Hash of the configuration fields that shape a backend session.  Two
/// turns whose resolved control config hashes equal can share a handle.
pub fn control_signature(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopSession;

    #[async_trait]
    impl BackendSession for NoopSession {
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn handle(key: &str) -> RuntimeHandle {
        RuntimeHandle {
            session_key: key.into(),
            backend_id: "test".into(),
            agent_id: "main".into(),
            mode: RunMode::Persistent,
            workdir: "/tmp".into(),
            signature: control_signature(&["model-a", "/tmp"]),
            opened_at: Instant::now(),
            last_used: Instant::now(),
            session: Arc::new(NoopSession),
        }
    }

    #[test]
    fn set_get_clear_size() {
        let cache = RuntimeHandleCache::new();
        assert!(cache.get("s1").is_none());
        assert_eq!(cache.size(), 0);

        cache.set("s1", handle("s1"));
        let got = cache.get("s1").expect("handle present");
        assert_eq!(got.session_key, "s1");
        assert_eq!(cache.size(), 1);

        let removed = cache.clear("s1");
        assert!(removed.is_some());
        assert!(cache.get("s1").is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn set_replaces_existing() {
        let cache = RuntimeHandleCache::new();
        cache.set("s1", handle("s1"));
        let mut newer = handle("s1");
        newer.backend_id = "other".into();
        cache.set("s1", newer);
        assert_eq!(cache.get("s1").unwrap().backend_id, "other");
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn signature_deterministic_and_delimited() {
        assert_eq!(
            control_signature(&["a", "b"]),
            control_signature(&["a", "b"])
        );
        assert_ne!(
            control_signature(&["a", "b"]),
            control_signature(&["ab", ""])
        );
        assert_eq!(control_signature(&["a"]).len(), 64);
    }

    #[tokio::test]
    async fn touch_resets_idle() {
        let cache = RuntimeHandleCache::new();
        let mut h = handle("s1");
        h.last_used = Instant::now() - std::time::Duration::from_secs(100);
        cache.set("s1", h);
        assert!(cache.get("s1").unwrap().idle().as_secs() >= 100);

        cache.touch("s1");
        assert!(cache.get("s1").unwrap().idle().as_secs() < 1);
    }
}
