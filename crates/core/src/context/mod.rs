//! Context window management.
//!
//! Two complementary mechanisms keep a session transcript inside the
//! model window: reactive pruning (synchronous, rule-ordered, runs
//! before a turn once usage crosses the prune trigger) and proactive
//! compaction (a background shadow build swapped in atomically once
//! usage crosses the lower shadow trigger).

pub mod estimate;
pub mod prune;
pub mod shadow;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use swb_domain::config::ContextConfig;
use swb_domain::transcript::Message;
use swb_domain::{Error, Result};

use crate::events::LifecycleHooks;

use estimate::estimate_messages;
use prune::{PruneReport, Pruner};
use shadow::{SessionSlot, Slots, SwapOutcome};

/// Produces summaries of transcript text.  Backed by a model call in the
/// gateway; test doubles return canned text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `purpose` is a short label ("tool_result", "conversation",
    /// "compaction") implementations may use to pick a prompt.
    async fn summarize(&self, purpose: &str, text: &str) -> Result<String>;
}

/// Stores bulky content outside the transcript and returns a reference
/// string that replaces it inline.
pub trait ArtifactSink: Send + Sync {
    fn stash(&self, session_key: &str, content: &str) -> Result<String>;
}

pub struct ContextWindowManager {
    config: ContextConfig,
    pruner: Pruner,
    slots: Slots,
    summarizer: Option<Arc<dyn Summarizer>>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
    hooks: Arc<dyn LifecycleHooks>,
}

impl ContextWindowManager {
    pub fn new(
        config: ContextConfig,
        summarizer: Option<Arc<dyn Summarizer>>,
        artifacts: Option<Arc<dyn ArtifactSink>>,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Self {
        Self {
            pruner: Pruner::new(config.clone()),
            slots: Slots::default(),
            config,
            summarizer,
            artifacts,
            hooks,
        }
    }

    // ── Transcript access ────────────────────────────────────────────

    pub fn append(&self, session_key: &str, message: Message) {
        let mut guard = self.slots.lock();
        guard
            .entry(session_key.to_owned())
            .or_insert_with(SessionSlot::new)
            .messages
            .push(message);
    }

    pub fn extend(&self, session_key: &str, messages: impl IntoIterator<Item = Message>) {
        let mut guard = self.slots.lock();
        guard
            .entry(session_key.to_owned())
            .or_insert_with(SessionSlot::new)
            .messages
            .extend(messages);
    }

    /// Clone of the active transcript, as the executor should see it.
    pub fn snapshot(&self, session_key: &str) -> Vec<Message> {
        self.slots
            .lock()
            .get(session_key)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    pub fn message_count(&self, session_key: &str) -> usize {
        self.slots
            .lock()
            .get(session_key)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    pub fn used_tokens(&self, session_key: &str) -> u64 {
        self.slots
            .lock()
            .get(session_key)
            .map(|s| estimate_messages(&s.messages))
            .unwrap_or(0)
    }

    pub fn usage_ratio(&self, session_key: &str) -> f64 {
        self.used_tokens(session_key) as f64 / self.config.context_window_tokens as f64
    }

    /// Bumped on every shadow swap; never on pruning.
    pub fn generation(&self, session_key: &str) -> u64 {
        self.slots
            .lock()
            .get(session_key)
            .map(|s| s.generation)
            .unwrap_or(0)
    }

    pub fn forget(&self, session_key: &str) {
        self.slots.lock().remove(session_key);
    }

    // ── Reactive pruning ─────────────────────────────────────────────

    /// Prune the transcript if usage crossed the prune trigger ratio.
    /// Returns `Ok(None)` when below the trigger, `Ok(Some(report))`
    /// after a successful prune, and [`Error::PruneExhausted`] when no
    /// rule could bring usage under the target.
    pub async fn maybe_prune(&self, session_key: &str) -> Result<Option<PruneReport>> {
        let (mut messages, start_generation) = {
            let guard = self.slots.lock();
            match guard.get(session_key) {
                Some(slot) => (slot.messages.clone(), slot.generation),
                None => return Ok(None),
            }
        };

        let used = estimate_messages(&messages);
        let trigger =
            (self.config.context_window_tokens as f64 * self.config.prune_trigger_ratio) as u64;
        if used < trigger {
            return Ok(None);
        }

        let report = self
            .pruner
            .prune(
                session_key,
                &mut messages,
                self.summarizer.as_deref(),
                self.artifacts.as_deref(),
            )
            .await;
        for event in &report.events {
            self.hooks.prune_rule_applied(session_key, event);
        }

        {
            let mut guard = self.slots.lock();
            if let Some(slot) = guard.get_mut(session_key) {
                // A shadow swap that landed mid-prune already shrank the
                // transcript; its result wins.
                if slot.generation == start_generation {
                    slot.messages = messages;
                }
            }
        }

        if report.exhausted {
            return Err(Error::PruneExhausted {
                used_tokens: report.used_tokens,
                context_window: report.context_window,
            });
        }
        Ok(Some(report))
    }

    // ── Proactive compaction ─────────────────────────────────────────

    /// Kick off a background shadow build if usage crossed the shadow
    /// trigger and none is in flight.
    pub fn maybe_swap(&self, session_key: &str) -> SwapOutcome {
        shadow::maybe_start_build(
            &self.slots,
            session_key,
            &self.config,
            self.summarizer.clone(),
            self.artifacts.clone(),
            Arc::clone(&self.hooks),
        )
    }

    /// Wait until a shadow swap lands for `session_key` or `timeout`
    /// elapses.  On timeout `on_timeout` runs exactly once and the
    /// active transcript keeps serving.  The timer is dropped as soon as
    /// either side wins.
    pub async fn wait_for_swap(
        &self,
        session_key: &str,
        timeout: Duration,
        on_timeout: impl FnOnce(),
    ) -> bool {
        let (notify, start_generation) = {
            let mut guard = self.slots.lock();
            let slot = guard
                .entry(session_key.to_owned())
                .or_insert_with(SessionSlot::new);
            (Arc::clone(&slot.swapped), slot.generation)
        };

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        loop {
            // Register interest before re-checking the generation so a
            // swap landing in between is never missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            if self.generation(session_key) > start_generation {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = &mut sleep => {
                    on_timeout();
                    return false;
                }
            }
        }
    }
}
