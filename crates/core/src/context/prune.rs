//! Reactive pruning — an ordered rule engine that trims an oversized
//! transcript in place until usage drops under the target ratio.
//!
//! Rules run strictly in priority order; the first rule whose precondition
//! holds is applied once, the ratio is re-evaluated, and the loop repeats
//! until a `*:pass` state or the target is reached.  Every application is
//! recorded as a [`PruneEvent`] for observability.

use swb_domain::config::ContextConfig;
use swb_domain::transcript::{ContentPart, Message, MessageContent, Role};

use super::estimate::{estimate_message, estimate_messages};
use super::{ArtifactSink, Summarizer};

/// Telemetry labels for the pruning state machine.  Authoritative — these
/// strings appear in events and logs.
pub mod rule {
    pub const STRIP_THINKING: &str = "decay:strip_thinking";
    pub const SUMMARIZE_TOOL_RESULT: &str = "decay:summarize_tool_result";
    pub const SUMMARIZE_GROUP: &str = "decay:summarize_group";
    pub const STRIP_TOOL_RESULT: &str = "decay:strip_tool_result";
    pub const FILE_SWAP: &str = "decay:file_swap";
    pub const MAX_MESSAGES: &str = "decay:max_messages";
    pub const DECAY_PASS: &str = "decay:pass";
    pub const SOFT_TRIM: &str = "prune:soft_trim";
    pub const HARD_CLEAR: &str = "prune:hard_clear";
    pub const PRUNE_PASS: &str = "prune:pass";
    pub const MEMORY_FLUSH: &str = "compact:memory_flush";
    pub const COMPACTION: &str = "compact:compaction";
}

/// One rule application (or a terminal pass state).
#[derive(Debug, Clone)]
pub struct PruneEvent {
    pub rule: &'static str,
    pub before_tokens: u64,
    pub after_tokens: u64,
    pub freed_tokens: u64,
    pub context_window: u64,
}

/// Outcome of one pruning invocation.
#[derive(Debug, Clone)]
pub struct PruneReport {
    pub events: Vec<PruneEvent>,
    pub used_tokens: u64,
    pub context_window: u64,
    /// True when no rule could bring usage under the target ratio.
    pub exhausted: bool,
}

impl PruneReport {
    pub fn freed_tokens(&self) -> u64 {
        self.events.iter().map(|e| e.freed_tokens).sum()
    }
}

/// Minimum number of messages ahead of the protection window before
/// `decay:summarize_group` considers a group worth collapsing.
const GROUP_MIN_MESSAGES: usize = 8;

pub struct Pruner {
    config: ContextConfig,
}

impl Pruner {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Prune `messages` in place until usage drops under the target ratio
    /// or no rule applies.
    pub async fn prune(
        &self,
        session_key: &str,
        messages: &mut Vec<Message>,
        summarizer: Option<&dyn Summarizer>,
        artifacts: Option<&dyn ArtifactSink>,
    ) -> PruneReport {
        let window = self.config.context_window_tokens;
        let target = (window as f64 * self.config.prune_target_ratio) as u64;
        let mut events = Vec::new();
        // One summarizer failure disables both summarize rules for the
        // rest of this invocation so a flaky model can't stall the loop.
        let mut summarizer_down = false;

        // ── Decay phase ──────────────────────────────────────────────
        loop {
            let before = estimate_messages(messages);
            if before <= target {
                events.push(self.pass(rule::DECAY_PASS, before));
                break;
            }
            let applied = self
                .apply_first_decay_rule(session_key, messages, summarizer, artifacts, &mut summarizer_down)
                .await;
            match applied {
                Some(rule_id) => {
                    let after = estimate_messages(messages);
                    events.push(self.event(rule_id, before, after));
                }
                None => {
                    events.push(self.pass(rule::DECAY_PASS, before));
                    break;
                }
            }
        }

        // ── Prune phase ──────────────────────────────────────────────
        loop {
            let before = estimate_messages(messages);
            if before <= target {
                events.push(self.pass(rule::PRUNE_PASS, before));
                break;
            }
            match self.apply_first_prune_rule(messages) {
                Some(rule_id) => {
                    let after = estimate_messages(messages);
                    events.push(self.event(rule_id, before, after));
                }
                None => {
                    events.push(self.pass(rule::PRUNE_PASS, before));
                    break;
                }
            }
        }

        let used_tokens = estimate_messages(messages);
        let exhausted = used_tokens > target;
        if exhausted {
            tracing::warn!(
                session_key,
                used_tokens,
                context_window = window,
                "pruning exhausted without reaching target"
            );
        }
        PruneReport {
            events,
            used_tokens,
            context_window: window,
            exhausted,
        }
    }

    fn event(&self, rule: &'static str, before: u64, after: u64) -> PruneEvent {
        tracing::debug!(
            rule,
            before_tokens = before,
            after_tokens = after,
            "prune rule applied"
        );
        PruneEvent {
            rule,
            before_tokens: before,
            after_tokens: after,
            freed_tokens: before.saturating_sub(after),
            context_window: self.config.context_window_tokens,
        }
    }

    fn pass(&self, rule: &'static str, tokens: u64) -> PruneEvent {
        PruneEvent {
            rule,
            before_tokens: tokens,
            after_tokens: tokens,
            freed_tokens: 0,
            context_window: self.config.context_window_tokens,
        }
    }

    // ── Decay rules, in priority order ───────────────────────────────

    async fn apply_first_decay_rule(
        &self,
        session_key: &str,
        messages: &mut Vec<Message>,
        summarizer: Option<&dyn Summarizer>,
        artifacts: Option<&dyn ArtifactSink>,
        summarizer_down: &mut bool,
    ) -> Option<&'static str> {
        let cutoff = protection_cutoff(messages, self.config.keep_last_assistants);

        if strip_thinking(messages, cutoff) {
            return Some(rule::STRIP_THINKING);
        }

        if !*summarizer_down {
            if let Some(sum) = summarizer {
                if let Some(idx) = self.largest_oversized_tool_result(messages, cutoff) {
                    match self.summarize_tool_result(session_key, messages, idx, sum).await {
                        Ok(()) => return Some(rule::SUMMARIZE_TOOL_RESULT),
                        Err(e) => {
                            tracing::warn!(session_key, error = %e, "tool result summarization failed, falling back to strip");
                            *summarizer_down = true;
                        }
                    }
                } else if cutoff >= GROUP_MIN_MESSAGES {
                    match self.summarize_group(session_key, messages, cutoff, sum).await {
                        Ok(()) => return Some(rule::SUMMARIZE_GROUP),
                        Err(e) => {
                            tracing::warn!(session_key, error = %e, "group summarization failed");
                            *summarizer_down = true;
                        }
                    }
                }
            }
        }

        if let Some(idx) = self.largest_oversized_tool_result(messages, cutoff) {
            self.strip_tool_result(messages, idx);
            return Some(rule::STRIP_TOOL_RESULT);
        }

        if let Some(sink) = artifacts {
            if let Some(idx) = self.largest_swappable_tool_result(messages, cutoff) {
                if self.file_swap(session_key, messages, idx, sink) {
                    return Some(rule::FILE_SWAP);
                }
            }
        }

        if let Some(max) = self.config.max_messages {
            if messages.len() > max {
                let excess = messages.len() - max;
                // Never drop into the protection window.
                let drop = excess.min(cutoff);
                if drop > 0 {
                    messages.drain(..drop);
                    return Some(rule::MAX_MESSAGES);
                }
            }
        }

        None
    }

    // ── Prune rules, in priority order ───────────────────────────────

    fn apply_first_prune_rule(&self, messages: &mut Vec<Message>) -> Option<&'static str> {
        let cutoff = protection_cutoff(messages, self.config.keep_last_assistants);

        // Soft-trim the largest overlong message outside the window.
        let trim_idx = messages[..cutoff]
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != Role::System)
            .filter(|(_, m)| m.content.char_len() > self.config.soft_trim.max_chars)
            .max_by_key(|(_, m)| m.content.char_len())
            .map(|(i, _)| i);
        if let Some(idx) = trim_idx {
            self.soft_trim(&mut messages[idx]);
            return Some(rule::SOFT_TRIM);
        }

        // Hard clear: blank the oldest non-system message that still
        // carries real content.
        if self.config.hard_clear.enabled {
            let placeholder_len = self.config.hard_clear.placeholder.len();
            let clear_idx = messages[..cutoff]
                .iter()
                .position(|m| m.role != Role::System && m.content.char_len() > placeholder_len);
            if let Some(idx) = clear_idx {
                messages[idx].content =
                    MessageContent::Text(self.config.hard_clear.placeholder.clone());
                return Some(rule::HARD_CLEAR);
            }
        }

        None
    }

    // ── Rule bodies ──────────────────────────────────────────────────

    fn largest_oversized_tool_result(&self, messages: &[Message], cutoff: usize) -> Option<usize> {
        messages[..cutoff]
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Tool && !contains_image(&m.content))
            .filter(|(_, m)| {
                m.content.char_len() >= self.config.min_prunable_chars
                    && estimate_message(m) > self.config.oversized_tool_result_tokens
            })
            .max_by_key(|(_, m)| estimate_message(m))
            .map(|(i, _)| i)
    }

    fn largest_swappable_tool_result(&self, messages: &[Message], cutoff: usize) -> Option<usize> {
        messages[..cutoff]
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Tool && !contains_image(&m.content))
            .filter(|(_, m)| m.content.char_len() >= self.config.min_prunable_chars)
            .max_by_key(|(_, m)| m.content.char_len())
            .map(|(i, _)| i)
    }

    async fn summarize_tool_result(
        &self,
        session_key: &str,
        messages: &mut [Message],
        idx: usize,
        summarizer: &dyn Summarizer,
    ) -> swb_domain::Result<()> {
        let original = tool_result_text(&messages[idx].content).unwrap_or_default();
        let summary = summarizer.summarize("tool_result", &original).await?;
        let replacement = format!(
            "[Summarized tool result]\n{summary}\n(original size: {} chars)",
            original.len()
        );
        replace_tool_result_text(&mut messages[idx].content, &replacement);
        tracing::debug!(session_key, idx, "tool result summarized");
        Ok(())
    }

    async fn summarize_group(
        &self,
        session_key: &str,
        messages: &mut Vec<Message>,
        cutoff: usize,
        summarizer: &dyn Summarizer,
    ) -> swb_domain::Result<()> {
        // Collapse the oldest half of the unprotected region.
        let group_end = (cutoff / 2).max(GROUP_MIN_MESSAGES / 2).min(cutoff);
        let text = conversation_text(&messages[..group_end]);
        let summary = summarizer.summarize("conversation", &text).await?;

        let collapsed = Message::system(format!("[Conversation summary]\n{summary}"));
        messages.splice(..group_end, std::iter::once(collapsed));
        tracing::debug!(session_key, collapsed = group_end, "message group summarized");
        Ok(())
    }

    fn strip_tool_result(&self, messages: &mut [Message], idx: usize) {
        let len = messages[idx].content.char_len();
        let replacement = format!(
            "{}\n(original size: {len} chars)",
            self.config.hard_clear.placeholder
        );
        replace_tool_result_text(&mut messages[idx].content, &replacement);
    }

    fn file_swap(
        &self,
        session_key: &str,
        messages: &mut [Message],
        idx: usize,
        sink: &dyn ArtifactSink,
    ) -> bool {
        let original = tool_result_text(&messages[idx].content).unwrap_or_default();
        match sink.stash(session_key, &original) {
            Ok(artifact_ref) => {
                let replacement = format!(
                    "[Tool result moved to {artifact_ref}; {} chars]",
                    original.len()
                );
                replace_tool_result_text(&mut messages[idx].content, &replacement);
                true
            }
            Err(e) => {
                tracing::warn!(session_key, error = %e, "artifact stash failed, skipping file swap");
                false
            }
        }
    }

    fn soft_trim(&self, msg: &mut Message) {
        let cfg = &self.config.soft_trim;
        let trim = |text: &str| -> String {
            let len = text.len();
            let head = cfg.head_chars.min(len);
            let tail = cfg.tail_chars.min(len.saturating_sub(head));
            let head_text = safe_prefix(text, head);
            let tail_text = safe_suffix(text, tail);
            format!(
                "{head_text}\n\n... [{} chars trimmed] ...\n\n{tail_text}",
                len - head_text.len() - tail_text.len()
            )
        };

        match &mut msg.content {
            MessageContent::Text(t) => *t = trim(t),
            MessageContent::Parts(parts) => {
                for part in parts.iter_mut() {
                    match part {
                        ContentPart::ToolResult { content, .. }
                            if content.len() > cfg.max_chars =>
                        {
                            *content = trim(content);
                        }
                        ContentPart::Text { text } if text.len() > cfg.max_chars => {
                            *text = trim(text);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Index before which messages are eligible for decay/prune.  Everything
/// at `>= cutoff` (the last N assistant turns and after) is protected.
pub fn protection_cutoff(messages: &[Message], keep_last: usize) -> usize {
    if keep_last == 0 {
        return messages.len();
    }
    let mut count = 0;
    for (i, msg) in messages.iter().enumerate().rev() {
        if msg.role == Role::Assistant {
            count += 1;
            if count >= keep_last {
                return i;
            }
        }
    }
    // Not enough assistant turns — protect everything.
    0
}

fn contains_image(content: &MessageContent) -> bool {
    match content {
        MessageContent::Text(_) => false,
        MessageContent::Parts(parts) => {
            parts.iter().any(|p| matches!(p, ContentPart::Image { .. }))
        }
    }
}

/// Remove thinking blocks from every unprotected message.  Returns true
/// when at least one block was removed.
fn strip_thinking(messages: &mut [Message], cutoff: usize) -> bool {
    let mut stripped = false;
    for msg in &mut messages[..cutoff] {
        if let MessageContent::Parts(parts) = &mut msg.content {
            let before = parts.len();
            parts.retain(|p| !matches!(p, ContentPart::Thinking { .. }));
            if parts.len() < before {
                stripped = true;
            }
        }
    }
    stripped
}

fn tool_result_text(content: &MessageContent) -> Option<String> {
    match content {
        MessageContent::Text(t) => Some(t.clone()),
        MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
            ContentPart::ToolResult { content, .. } => Some(content.clone()),
            _ => None,
        }),
    }
}

fn replace_tool_result_text(content: &mut MessageContent, replacement: &str) {
    match content {
        MessageContent::Text(t) => *t = replacement.to_owned(),
        MessageContent::Parts(parts) => {
            for part in parts.iter_mut() {
                if let ContentPart::ToolResult { content, .. } = part {
                    *content = replacement.to_owned();
                }
            }
        }
    }
}

/// Render messages as plain text for a summarization prompt.  Long tool
/// results are head/tail clipped so the prompt itself stays manageable.
pub fn conversation_text(messages: &[Message]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        buf.push_str(label);
        buf.push_str(": ");
        let text = match &msg.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(_) => tool_result_text(&msg.content)
                .or_else(|| msg.content.text().map(str::to_owned))
                .unwrap_or_default(),
        };
        if text.len() > 2_000 {
            buf.push_str(safe_prefix(&text, 1_000));
            buf.push_str(" [...] ");
            buf.push_str(safe_suffix(&text, 500));
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}

/// Longest prefix of at most `n` bytes ending on a char boundary.
fn safe_prefix(text: &str, n: usize) -> &str {
    if n >= text.len() {
        return text;
    }
    let mut end = n;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Longest suffix of at most `n` bytes starting on a char boundary.
fn safe_suffix(text: &str, n: usize) -> &str {
    if n >= text.len() {
        return text;
    }
    let mut start = text.len() - n;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
