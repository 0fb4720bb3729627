//! Proactive compaction — the shadow transcript double buffer.
//!
//! Once usage crosses the shadow trigger ratio a background task builds
//! a compacted replacement (chunked incremental summaries plus the
//! protected tail) while the active transcript keeps serving turns.  On
//! success the replacement is installed in one atomic swap and the
//! generation counter bumps; on failure the active transcript is left
//! untouched.  At most one build runs per session at any time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use swb_domain::config::ContextConfig;
use swb_domain::transcript::Message;
use swb_domain::Error;

use crate::events::LifecycleHooks;

use super::estimate::estimate_messages;
use super::prune::{conversation_text, protection_cutoff, rule, PruneEvent};
use super::{ArtifactSink, Summarizer};

/// Portion of the context window a summarization chunk may occupy.
const BASE_CHUNK_RATIO: f64 = 0.4;
const MIN_CHUNK_RATIO: f64 = 0.15;
/// Token headroom reserved for the summarization prompt scaffolding.
const SUMMARIZATION_OVERHEAD_TOKENS: u64 = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// A background build was kicked off.
    Started,
    /// A build for this session is already in flight.
    AlreadyBuilding,
    /// Usage is under the shadow trigger ratio (or nothing to compact).
    NotNeeded,
}

/// Per-session double-buffer slot.
pub(crate) struct SessionSlot {
    pub messages: Vec<Message>,
    pub generation: u64,
    pub building: bool,
    pub swapped: Arc<Notify>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            generation: 0,
            building: false,
            swapped: Arc::new(Notify::new()),
        }
    }
}

pub(crate) type Slots = Arc<Mutex<HashMap<String, SessionSlot>>>;

/// Try to start a shadow build for `session_key`.  The building flag is
/// checked and set under the slot lock, so two racing callers can never
/// both start a build.
pub(crate) fn maybe_start_build(
    slots: &Slots,
    session_key: &str,
    config: &ContextConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
    hooks: Arc<dyn LifecycleHooks>,
) -> SwapOutcome {
    let Some(summarizer) = summarizer else {
        return SwapOutcome::NotNeeded;
    };

    let snapshot = {
        let mut guard = slots.lock();
        let slot = guard
            .entry(session_key.to_owned())
            .or_insert_with(SessionSlot::new);
        if slot.building {
            return SwapOutcome::AlreadyBuilding;
        }
        let used = estimate_messages(&slot.messages);
        let trigger = (config.context_window_tokens as f64 * config.shadow_trigger_ratio) as u64;
        if used < trigger {
            return SwapOutcome::NotNeeded;
        }
        let cutoff = protection_cutoff(&slot.messages, config.keep_last_turns);
        if cutoff < 2 {
            // Everything is protected; a summary would replace nothing.
            return SwapOutcome::NotNeeded;
        }
        slot.building = true;
        slot.messages.clone()
    };

    let slots = Arc::clone(slots);
    let session_key = session_key.to_owned();
    let config = config.clone();
    tokio::spawn(async move {
        if let Err(e) = run_build(
            slots,
            session_key.clone(),
            config,
            snapshot,
            summarizer,
            artifacts,
            hooks,
        )
        .await
        {
            tracing::warn!(session_key = %session_key, error = %e, "shadow build failed, active transcript unchanged");
        }
    });
    SwapOutcome::Started
}

async fn run_build(
    slots: Slots,
    session_key: String,
    config: ContextConfig,
    snapshot: Vec<Message>,
    summarizer: Arc<dyn Summarizer>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
    hooks: Arc<dyn LifecycleHooks>,
) -> Result<(), Error> {
    let window = config.context_window_tokens;
    let before = estimate_messages(&snapshot);
    // The swap keeps its own verbatim tail, sized in recent turns rather
    // than by the prune protection window.
    let cutoff = protection_cutoff(&snapshot, config.keep_last_turns);
    let head = &snapshot[..cutoff];
    let kept = &snapshot[cutoff..];

    // Flush the full head to durable memory before it gets collapsed.
    if let Some(sink) = &artifacts {
        match sink.stash(&session_key, &conversation_text(head)) {
            Ok(artifact_ref) => {
                tracing::debug!(session_key = %session_key, artifact_ref, "memory flush complete");
                hooks.prune_rule_applied(
                    &session_key,
                    &PruneEvent {
                        rule: rule::MEMORY_FLUSH,
                        before_tokens: before,
                        after_tokens: before,
                        freed_tokens: 0,
                        context_window: window,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(session_key = %session_key, error = %e, "memory flush failed, continuing compaction");
            }
        }
    }

    let summary = match summarize_chunked(head, window, summarizer.as_ref()).await {
        Ok(s) => s,
        Err(e) => {
            let mut guard = slots.lock();
            if let Some(slot) = guard.get_mut(&session_key) {
                slot.building = false;
            }
            return Err(Error::SwapBuildFailed(e.to_string()));
        }
    };

    let mut replacement = Vec::with_capacity(kept.len() + 1);
    replacement.push(Message::system(format!("[Conversation summary]\n{summary}")));
    replacement.extend_from_slice(kept);

    let after = {
        let mut guard = slots.lock();
        let Some(slot) = guard.get_mut(&session_key) else {
            // Session forgotten mid-build; nothing to install.
            return Ok(());
        };
        // Turns that landed while the build ran are carried over.
        if slot.messages.len() > snapshot.len() {
            replacement.extend_from_slice(&slot.messages[snapshot.len()..]);
        }
        let after = estimate_messages(&replacement);
        slot.messages = replacement;
        slot.generation += 1;
        slot.building = false;
        slot.swapped.notify_waiters();
        after
    };

    tracing::info!(
        session_key = %session_key,
        before_tokens = before,
        after_tokens = after,
        "shadow transcript swapped in"
    );
    hooks.prune_rule_applied(
        &session_key,
        &PruneEvent {
            rule: rule::COMPACTION,
            before_tokens: before,
            after_tokens: after,
            freed_tokens: before.saturating_sub(after),
            context_window: window,
        },
    );
    Ok(())
}

/// Summarize `messages` incrementally, one token-bounded chunk at a time,
/// threading the running summary into each subsequent prompt.
async fn summarize_chunked(
    messages: &[Message],
    context_window: u64,
    summarizer: &dyn Summarizer,
) -> swb_domain::Result<String> {
    let mut summary = String::new();
    for chunk in chunk_by_token_budget(messages, chunk_budget(context_window)) {
        let chunk_text = conversation_text(chunk);
        let prompt = if summary.is_empty() {
            chunk_text
        } else {
            format!("Summary so far:\n{summary}\n\nContinue with:\n{chunk_text}")
        };
        summary = summarizer.summarize("compaction", &prompt).await?;
    }
    Ok(summary)
}

fn chunk_budget(context_window: u64) -> u64 {
    let base = (context_window as f64 * BASE_CHUNK_RATIO) as u64;
    let floor = (context_window as f64 * MIN_CHUNK_RATIO) as u64;
    base.saturating_sub(SUMMARIZATION_OVERHEAD_TOKENS).max(floor).max(1)
}

/// Greedy split into runs of at most `max_tokens` each.  A single message
/// over the budget still gets its own chunk.
fn chunk_by_token_budget(messages: &[Message], max_tokens: u64) -> Vec<&[Message]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut run_tokens = 0u64;
    for (i, msg) in messages.iter().enumerate() {
        let cost = super::estimate::estimate_message(msg);
        if i > start && run_tokens + cost > max_tokens {
            chunks.push(&messages[start..i]);
            start = i;
            run_tokens = 0;
        }
        run_tokens += cost;
    }
    if start < messages.len() {
        chunks.push(&messages[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_budget() {
        let messages: Vec<Message> = (0..10).map(|i| Message::user("x".repeat(400 + i))).collect();
        // Each message is ~100 tokens; budget of 250 means 2 per chunk.
        let chunks = chunk_by_token_budget(&messages, 250);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 10);
    }

    #[test]
    fn oversized_message_gets_own_chunk() {
        let messages = vec![
            Message::user("a".repeat(40)),
            Message::user("b".repeat(40_000)),
            Message::user("c".repeat(40)),
        ];
        let chunks = chunk_by_token_budget(&messages, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].len(), 1);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_by_token_budget(&[], 100).is_empty());
    }

    #[test]
    fn budget_never_zero() {
        assert!(chunk_budget(1) >= 1);
        // Large windows subtract the prompt overhead.
        assert_eq!(chunk_budget(200_000), 80_000 - SUMMARIZATION_OVERHEAD_TOKENS);
    }

    struct BrokenSummary;
    #[async_trait::async_trait]
    impl crate::context::Summarizer for BrokenSummary {
        async fn summarize(&self, _purpose: &str, _text: &str) -> swb_domain::Result<String> {
            Err(Error::Summarizer("model down".into()))
        }
    }

    #[tokio::test]
    async fn failed_build_reports_swap_build_failed() {
        let slots: Slots = Arc::new(Mutex::new(HashMap::new()));
        let snapshot: Vec<Message> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user("x".repeat(400))
                } else {
                    Message::assistant("y".repeat(400))
                }
            })
            .collect();
        {
            let mut guard = slots.lock();
            let slot = guard.entry("s".to_owned()).or_insert_with(SessionSlot::new);
            slot.messages = snapshot.clone();
            slot.building = true;
        }

        let mut config = ContextConfig::default();
        config.keep_last_turns = 1;
        let err = run_build(
            Arc::clone(&slots),
            "s".to_owned(),
            config,
            snapshot,
            Arc::new(BrokenSummary),
            None,
            Arc::new(crate::events::NullHooks),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::SwapBuildFailed(_)));
        let guard = slots.lock();
        let slot = guard.get("s").unwrap();
        assert!(!slot.building);
        assert_eq!(slot.generation, 0);
        assert_eq!(slot.messages.len(), 6);
    }
}
