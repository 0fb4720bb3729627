use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budget profiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How long an armed deep profile stays active before reverting to normal.
pub const DEEP_EXPIRY_DEFAULT_MS: u64 = 30 * 60 * 1000;

/// Per-run budget configuration.  One of the named profiles is resolved
/// once at run start; limits never change mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Profile used when the caller doesn't pick one.
    #[serde(default)]
    pub default_profile: BudgetProfileId,
    #[serde(default = "BudgetLimits::cheap")]
    pub cheap: BudgetLimits,
    #[serde(default = "BudgetLimits::normal")]
    pub normal: BudgetLimits,
    #[serde(default = "BudgetLimits::deep")]
    pub deep: BudgetLimits,
    /// Armed-deep window in milliseconds; after this the governor reverts
    /// to the normal profile.
    #[serde(default = "d_deep_expiry")]
    pub deep_expiry_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_profile: BudgetProfileId::Normal,
            cheap: BudgetLimits::cheap(),
            normal: BudgetLimits::normal(),
            deep: BudgetLimits::deep(),
            deep_expiry_ms: DEEP_EXPIRY_DEFAULT_MS,
        }
    }
}

impl BudgetConfig {
    pub fn limits(&self, id: BudgetProfileId) -> &BudgetLimits {
        match id {
            BudgetProfileId::Cheap => &self.cheap,
            BudgetProfileId::Normal => &self.normal,
            BudgetProfileId::Deep => &self.deep,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetProfileId {
    Cheap,
    #[default]
    Normal,
    Deep,
}

impl std::fmt::Display for BudgetProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetProfileId::Cheap => f.write_str("cheap"),
            BudgetProfileId::Normal => f.write_str("normal"),
            BudgetProfileId::Deep => f.write_str("deep"),
        }
    }
}

/// Hard ceilings for one run.  `None` = uncapped for that dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLimits {
    #[serde(default)]
    pub max_llm_calls: Option<u32>,
    #[serde(default)]
    pub max_tool_calls: Option<u32>,
    #[serde(default)]
    pub max_web_search_calls: Option<u32>,
    #[serde(default)]
    pub max_web_fetch_calls: Option<u32>,
    #[serde(default)]
    pub max_subagent_spawns: Option<u32>,
    #[serde(default)]
    pub max_retry_attempts: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub max_runtime_ms: Option<u64>,
    /// Whether browser-backed tools are allowed at all under this profile.
    #[serde(default)]
    pub browser_enabled: bool,
}

impl BudgetLimits {
    pub fn cheap() -> Self {
        Self {
            max_llm_calls: Some(8),
            max_tool_calls: Some(10),
            max_web_search_calls: Some(2),
            max_web_fetch_calls: Some(3),
            max_subagent_spawns: Some(0),
            max_retry_attempts: Some(2),
            max_tokens: Some(100_000),
            max_cost_usd: Some(0.25),
            max_runtime_ms: Some(2 * 60 * 1000),
            browser_enabled: false,
        }
    }

    pub fn normal() -> Self {
        Self {
            max_llm_calls: Some(30),
            max_tool_calls: Some(50),
            max_web_search_calls: Some(8),
            max_web_fetch_calls: Some(12),
            max_subagent_spawns: Some(2),
            max_retry_attempts: Some(5),
            max_tokens: Some(1_000_000),
            max_cost_usd: Some(3.0),
            max_runtime_ms: Some(10 * 60 * 1000),
            browser_enabled: false,
        }
    }

    pub fn deep() -> Self {
        Self {
            max_llm_calls: Some(120),
            max_tool_calls: Some(200),
            max_web_search_calls: Some(30),
            max_web_fetch_calls: Some(50),
            max_subagent_spawns: Some(8),
            max_retry_attempts: Some(10),
            max_tokens: Some(8_000_000),
            max_cost_usd: Some(25.0),
            max_runtime_ms: Some(60 * 60 * 1000),
            browser_enabled: true,
        }
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self::normal()
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_deep_expiry() -> u64 {
    DEEP_EXPIRY_DEFAULT_MS
}
