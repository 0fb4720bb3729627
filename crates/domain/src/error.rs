use serde::Serialize;

/// Which budget ceiling a run crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    LlmCalls,
    ToolCalls,
    WebSearchCalls,
    WebFetchCalls,
    SubagentSpawns,
    RetryAttempts,
    ErrorLoop,
    Tokens,
    CostUsd,
    RuntimeMs,
    ForceStopped,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LimitKind::LlmCalls => "llm_calls",
            LimitKind::ToolCalls => "tool_calls",
            LimitKind::WebSearchCalls => "web_search_calls",
            LimitKind::WebFetchCalls => "web_fetch_calls",
            LimitKind::SubagentSpawns => "subagent_spawns",
            LimitKind::RetryAttempts => "retry_attempts",
            LimitKind::ErrorLoop => "error_loop",
            LimitKind::Tokens => "tokens",
            LimitKind::CostUsd => "cost_usd",
            LimitKind::RuntimeMs => "runtime_ms",
            LimitKind::ForceStopped => "force_stopped",
        };
        f.write_str(s)
    }
}

/// Typed exhaustion signal raised the instant a budget counter would cross
/// its ceiling.  Carried inside [`Error::BudgetExceeded`] so the turn
/// executor can render a user-facing message instead of crashing the turn.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetExceeded {
    pub kind: LimitKind,
    pub current: f64,
    pub limit: f64,
}

impl std::fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "budget exceeded: {} at {} (limit {})",
            self.kind, self.current, self.limit
        )
    }
}

/// Shared error type used across all Switchboard crates.
///
/// Everything that crosses the core's public contract boundary is one of
/// these variants; nothing opaque leaks out.  Handle staleness and
/// duplicate triggers are deliberately absent — both are recovered or
/// reported as non-error outcomes, never surfaced as failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An operation submitted to the actor queue could not be completed
    /// because its lane went away.  Isolated to the submitting caller.
    #[error("queue failure: {0}")]
    QueueFailure(String),

    #[error("{0}")]
    BudgetExceeded(BudgetExceeded),

    /// No pruning rule could bring context usage under the target ratio.
    #[error("context pruning exhausted: {used_tokens} tokens against a {context_window} window")]
    PruneExhausted {
        used_tokens: u64,
        context_window: u64,
    },

    /// Background shadow-buffer construction failed.  The active buffer is
    /// untouched; a later build may be retried.
    #[error("shadow build failed: {0}")]
    SwapBuildFailed(String),

    /// The followup queue for a session is at capacity.
    #[error("followup queue full for session (max {max})")]
    FollowupQueueFull { max: usize },

    /// The backend runtime (session open/close, turn execution) failed.
    #[error("backend: {0}")]
    Backend(String),

    #[error("summarizer: {0}")]
    Summarizer(String),
}

impl From<BudgetExceeded> for Error {
    fn from(e: BudgetExceeded) -> Self {
        Error::BudgetExceeded(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
