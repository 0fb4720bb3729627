use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context window management
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Context window management — reactive pruning of oversized transcripts
/// plus proactive background summarization (shadow buffer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Model context window in tokens (estimates, not tokenizer counts).
    #[serde(default = "d_200k")]
    pub context_window_tokens: u64,
    /// Usage ratio above which pruning runs before a turn.
    #[serde(default = "d_085")]
    pub prune_trigger_ratio: f64,
    /// Ratio pruning tries to get under.
    #[serde(default = "d_07")]
    pub prune_target_ratio: f64,
    /// Usage ratio at which a background shadow build is kicked off.
    #[serde(default = "d_06")]
    pub shadow_trigger_ratio: f64,
    /// Number of recent assistant messages whose tool results are protected
    /// from every decay rule.
    #[serde(default = "d_3u")]
    pub keep_last_assistants: usize,
    /// Only decay tool results longer than this many chars.
    #[serde(default = "d_20000")]
    pub min_prunable_chars: usize,
    /// Individual tool results above this many estimated tokens are
    /// considered oversized.
    #[serde(default = "d_2000")]
    pub oversized_tool_result_tokens: u64,
    /// Hard cap on message count; `decay:max_messages` drops the oldest
    /// beyond it.  `None` disables the rule.
    #[serde(default = "d_max_messages")]
    pub max_messages: Option<usize>,
    /// Number of recent turns kept verbatim after a shadow swap.
    #[serde(default = "d_12")]
    pub keep_last_turns: usize,
    #[serde(default)]
    pub soft_trim: SoftTrimConfig,
    #[serde(default)]
    pub hard_clear: HardClearConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 200_000,
            prune_trigger_ratio: 0.85,
            prune_target_ratio: 0.7,
            shadow_trigger_ratio: 0.6,
            keep_last_assistants: 3,
            min_prunable_chars: 20_000,
            oversized_tool_result_tokens: 2_000,
            max_messages: Some(400),
            keep_last_turns: 12,
            soft_trim: SoftTrimConfig::default(),
            hard_clear: HardClearConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftTrimConfig {
    /// Messages above this many chars are eligible for soft-trim.
    #[serde(default = "d_8000")]
    pub max_chars: usize,
    /// Chars kept from the head.
    #[serde(default = "d_1500")]
    pub head_chars: usize,
    /// Chars kept from the tail.
    #[serde(default = "d_1500")]
    pub tail_chars: usize,
}

impl Default for SoftTrimConfig {
    fn default() -> Self {
        Self {
            max_chars: 8_000,
            head_chars: 1_500,
            tail_chars: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardClearConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_placeholder")]
    pub placeholder: String,
}

impl Default for HardClearConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            placeholder: d_placeholder(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_200k() -> u64 {
    200_000
}
fn d_085() -> f64 {
    0.85
}
fn d_07() -> f64 {
    0.7
}
fn d_06() -> f64 {
    0.6
}
fn d_3u() -> usize {
    3
}
fn d_20000() -> usize {
    20_000
}
fn d_2000() -> u64 {
    2_000
}
fn d_max_messages() -> Option<usize> {
    Some(400)
}
fn d_12() -> usize {
    12
}
fn d_8000() -> usize {
    8_000
}
fn d_1500() -> usize {
    1_500
}
fn d_placeholder() -> String {
    "[Old history cleared]".into()
}
fn d_true() -> bool {
    true
}
