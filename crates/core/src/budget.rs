//! Per-run budget governor — accounting and hard-limit enforcement for one
//! run.  Pure counters, no I/O.
//!
//! A fresh governor is constructed for every run; once any ceiling is
//! crossed the governor is tripped for good and every further consuming
//! call fails fast with the original trip reason.  Exhaustion is a typed
//! result, never a panic, so the turn executor can render a user-facing
//! "budget exceeded" message.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use swb_domain::config::{BudgetConfig, BudgetLimits, BudgetProfileId};
use swb_domain::error::{BudgetExceeded, LimitKind};

/// Consecutive occurrences of one error signature that trip the loop
/// detector.
const ERROR_LOOP_THRESHOLD: u32 = 3;

/// Monotonically increasing counters for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetUsage {
    pub llm_calls: u32,
    pub tool_calls: u32,
    pub web_search_calls: u32,
    pub web_fetch_calls: u32,
    pub subagent_spawns: u32,
    pub retry_attempts: u32,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tokens_cache_read: u64,
    pub tokens_cache_write: u64,
    pub estimated_cost_usd: f64,
}

impl BudgetUsage {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_input + self.tokens_output
    }
}

/// Deep-mode arming options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepArm {
    /// Expiry override in ms; `None` uses the configured default window.
    pub expires_in_ms: Option<u64>,
    /// Revert to normal as soon as the run completes.
    pub one_run: bool,
}

struct Inner {
    usage: BudgetUsage,
    tripped: Option<BudgetExceeded>,
    /// Per-signature consecutive error counts for loop detection.
    error_counts: HashMap<String, u32>,
    deep_reverted: bool,
}

/// One run's budget state.  Construct via [`BudgetGovernor::new`] (normal /
/// cheap) or [`BudgetGovernor::deep`] (requires explicit arming).
pub struct BudgetGovernor {
    profile: BudgetProfileId,
    limits: BudgetLimits,
    /// Limits to fall back to when an armed deep window expires.
    revert_limits: Option<BudgetLimits>,
    deep_expires_at: Option<Instant>,
    deep_one_run: bool,
    started_at: Instant,
    inner: Mutex<Inner>,
}

impl BudgetGovernor {
    /// Resolve a profile from config.  Asking for `deep` here is a config
    /// error — deep must be armed explicitly via [`BudgetGovernor::deep`].
    pub fn new(config: &BudgetConfig, profile: BudgetProfileId) -> Self {
        debug_assert_ne!(
            profile,
            BudgetProfileId::Deep,
            "deep profile requires explicit arming"
        );
        let profile = if profile == BudgetProfileId::Deep {
            BudgetProfileId::Normal
        } else {
            profile
        };
        Self::build(profile, config.limits(profile).clone(), None, None, false)
    }

    /// Arm the deep profile for a bounded window.  After expiry the
    /// governor reverts to the normal profile's ceilings mid-run.
    pub fn deep(config: &BudgetConfig, arm: DeepArm) -> Self {
        let window_ms = arm.expires_in_ms.unwrap_or(config.deep_expiry_ms);
        Self::build(
            BudgetProfileId::Deep,
            config.deep.clone(),
            Some(config.normal.clone()),
            Some(Instant::now() + std::time::Duration::from_millis(window_ms)),
            arm.one_run,
        )
    }

    fn build(
        profile: BudgetProfileId,
        limits: BudgetLimits,
        revert_limits: Option<BudgetLimits>,
        deep_expires_at: Option<Instant>,
        deep_one_run: bool,
    ) -> Self {
        Self {
            profile,
            limits,
            revert_limits,
            deep_expires_at,
            deep_one_run,
            started_at: Instant::now(),
            inner: Mutex::new(Inner {
                usage: BudgetUsage::default(),
                tripped: None,
                error_counts: HashMap::new(),
                deep_reverted: false,
            }),
        }
    }

    pub fn profile(&self) -> BudgetProfileId {
        self.profile
    }

    pub fn usage(&self) -> BudgetUsage {
        self.inner.lock().usage
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.lock().tripped.is_some()
    }

    pub fn trip_reason(&self) -> Option<BudgetExceeded> {
        self.inner.lock().tripped.clone()
    }

    /// Whether an armed deep window has lapsed back to normal ceilings.
    pub fn deep_reverted(&self) -> bool {
        self.inner.lock().deep_reverted
    }

    /// Record one model call plus its token/cost deltas.
    pub fn record_llm_call(
        &self,
        tokens: swb_domain::transcript::TokenUsage,
    ) -> Result<(), BudgetExceeded> {
        let mut inner = self.inner.lock();
        self.check_locked(&mut inner)?;

        inner.usage.llm_calls += 1;
        inner.usage.tokens_input += tokens.input;
        inner.usage.tokens_output += tokens.output;
        inner.usage.tokens_cache_read += tokens.cache_read;
        inner.usage.tokens_cache_write += tokens.cache_write;
        inner.usage.estimated_cost_usd += tokens.cost_usd;

        let limits = self.effective_limits(&inner);
        if let Some(max) = limits.max_llm_calls {
            if inner.usage.llm_calls > max {
                return Err(self.trip(&mut inner, LimitKind::LlmCalls, max as f64));
            }
        }
        if let Some(max) = limits.max_tokens {
            if inner.usage.total_tokens() > max {
                return Err(self.trip(&mut inner, LimitKind::Tokens, max as f64));
            }
        }
        if let Some(max) = limits.max_cost_usd {
            if inner.usage.estimated_cost_usd > max {
                return Err(self.trip(&mut inner, LimitKind::CostUsd, max));
            }
        }
        Ok(())
    }

    /// Record one tool call.  Named web tools are also counted against
    /// their own family ceiling.
    pub fn record_tool_call(&self, tool_name: Option<&str>) -> Result<(), BudgetExceeded> {
        let mut inner = self.inner.lock();
        self.check_locked(&mut inner)?;

        inner.usage.tool_calls += 1;
        match tool_name {
            Some("web_search") => inner.usage.web_search_calls += 1,
            Some("web_fetch") => inner.usage.web_fetch_calls += 1,
            _ => {}
        }

        let limits = self.effective_limits(&inner);
        if let Some(max) = limits.max_tool_calls {
            if inner.usage.tool_calls > max {
                return Err(self.trip(&mut inner, LimitKind::ToolCalls, max as f64));
            }
        }
        if let Some(max) = limits.max_web_search_calls {
            if inner.usage.web_search_calls > max {
                return Err(self.trip(&mut inner, LimitKind::WebSearchCalls, max as f64));
            }
        }
        if let Some(max) = limits.max_web_fetch_calls {
            if inner.usage.web_fetch_calls > max {
                return Err(self.trip(&mut inner, LimitKind::WebFetchCalls, max as f64));
            }
        }
        Ok(())
    }

    pub fn record_subagent_spawn(&self) -> Result<(), BudgetExceeded> {
        let mut inner = self.inner.lock();
        self.check_locked(&mut inner)?;

        let limits = self.effective_limits(&inner);
        if let Some(max) = limits.max_subagent_spawns {
            if inner.usage.subagent_spawns + 1 > max {
                return Err(self.trip(&mut inner, LimitKind::SubagentSpawns, max as f64));
            }
        }
        inner.usage.subagent_spawns += 1;
        Ok(())
    }

    /// Record a retry of an operation.  A dedicated ceiling independent of
    /// total call count, so a tool stuck in retry can't eat the run budget.
    pub fn record_retry(&self) -> Result<(), BudgetExceeded> {
        let mut inner = self.inner.lock();
        self.check_locked(&mut inner)?;

        let limits = self.effective_limits(&inner);
        if let Some(max) = limits.max_retry_attempts {
            if inner.usage.retry_attempts + 1 > max {
                return Err(self.trip(&mut inner, LimitKind::RetryAttempts, max as f64));
            }
        }
        inner.usage.retry_attempts += 1;
        Ok(())
    }

    /// Record a failed operation for loop detection.  The third
    /// occurrence of the same signature trips `error_loop` regardless of
    /// the remaining call budget.
    pub fn record_error(&self, signature: &str) -> Result<(), BudgetExceeded> {
        let mut inner = self.inner.lock();
        self.check_locked(&mut inner)?;

        let count = inner
            .error_counts
            .entry(signature.to_owned())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let count = *count;
        if count >= ERROR_LOOP_THRESHOLD {
            return Err(self.trip(&mut inner, LimitKind::ErrorLoop, ERROR_LOOP_THRESHOLD as f64));
        }
        Ok(())
    }

    /// Pre-check a candidate operation without consuming anything.
    /// Covers wall-clock, deep-window expiry, and the tripped state.
    pub fn check(&self) -> Result<(), BudgetExceeded> {
        let mut inner = self.inner.lock();
        self.check_locked(&mut inner)
    }

    /// Pre-check one prospective tool call without consuming it.  Trips
    /// on the same ceilings [`BudgetGovernor::record_tool_call`] would
    /// cross, so an unaffordable call never starts.
    pub fn check_tool(&self, tool_name: Option<&str>) -> Result<(), BudgetExceeded> {
        let mut inner = self.inner.lock();
        self.check_locked(&mut inner)?;

        let limits = self.effective_limits(&inner);
        if let Some(max) = limits.max_tool_calls {
            if inner.usage.tool_calls + 1 > max {
                return Err(self.trip(&mut inner, LimitKind::ToolCalls, max as f64));
            }
        }
        match tool_name {
            Some("web_search") => {
                if let Some(max) = limits.max_web_search_calls {
                    if inner.usage.web_search_calls + 1 > max {
                        return Err(self.trip(&mut inner, LimitKind::WebSearchCalls, max as f64));
                    }
                }
            }
            Some("web_fetch") => {
                if let Some(max) = limits.max_web_fetch_calls {
                    if inner.usage.web_fetch_calls + 1 > max {
                        return Err(self.trip(&mut inner, LimitKind::WebFetchCalls, max as f64));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether browser-backed tools are permitted under the effective
    /// profile.  A pre-check, not a consuming call.
    pub fn check_browser_allowed(&self) -> bool {
        let inner = self.inner.lock();
        self.effective_limits(&inner).browser_enabled
    }

    /// Manual kill-switch.
    pub fn force_stop(&self) {
        let mut inner = self.inner.lock();
        if inner.tripped.is_none() {
            let current = self.elapsed_ms() as f64;
            inner.tripped = Some(BudgetExceeded {
                kind: LimitKind::ForceStopped,
                current,
                limit: current,
            });
        }
    }

    /// Mark the run finished.  An armed one-run deep window reverts here.
    pub fn complete(&self) {
        if self.deep_one_run {
            let mut inner = self.inner.lock();
            if !inner.deep_reverted {
                inner.deep_reverted = true;
                tracing::info!(profile = %self.profile, "deep budget reverted (one-run)");
            }
        }
    }

    // ── Private ──────────────────────────────────────────────────────

    /// Limits currently in force, accounting for deep-window expiry.
    fn effective_limits<'a>(&'a self, inner: &Inner) -> &'a BudgetLimits {
        if inner.deep_reverted {
            if let Some(ref revert) = self.revert_limits {
                return revert;
            }
        }
        &self.limits
    }

    fn check_locked(&self, inner: &mut Inner) -> Result<(), BudgetExceeded> {
        if let Some(ref tripped) = inner.tripped {
            return Err(tripped.clone());
        }

        // Deep window lapse is observed lazily on the next check.
        if let Some(expires_at) = self.deep_expires_at {
            if !inner.deep_reverted && Instant::now() >= expires_at {
                inner.deep_reverted = true;
                tracing::info!(profile = %self.profile, "deep budget reverted (expired)");
            }
        }

        let elapsed = self.elapsed_ms();
        if let Some(max) = self.effective_limits(inner).max_runtime_ms {
            if elapsed > max {
                return Err(self.trip(inner, LimitKind::RuntimeMs, max as f64));
            }
        }
        Ok(())
    }

    fn trip(&self, inner: &mut Inner, kind: LimitKind, limit: f64) -> BudgetExceeded {
        let current = match kind {
            LimitKind::LlmCalls => inner.usage.llm_calls as f64,
            LimitKind::ToolCalls => inner.usage.tool_calls as f64,
            LimitKind::WebSearchCalls => inner.usage.web_search_calls as f64,
            LimitKind::WebFetchCalls => inner.usage.web_fetch_calls as f64,
            LimitKind::SubagentSpawns => (inner.usage.subagent_spawns + 1) as f64,
            LimitKind::RetryAttempts => (inner.usage.retry_attempts + 1) as f64,
            LimitKind::ErrorLoop => ERROR_LOOP_THRESHOLD as f64,
            LimitKind::Tokens => inner.usage.total_tokens() as f64,
            LimitKind::CostUsd => inner.usage.estimated_cost_usd,
            LimitKind::RuntimeMs | LimitKind::ForceStopped => self.elapsed_ms() as f64,
        };
        let exceeded = BudgetExceeded {
            kind,
            current,
            limit,
        };
        tracing::warn!(
            profile = %self.profile,
            kind = %kind,
            current,
            limit,
            "budget tripped"
        );
        inner.tripped = Some(exceeded.clone());
        exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swb_domain::transcript::TokenUsage;

    fn config() -> BudgetConfig {
        BudgetConfig::default()
    }

    fn governor_with(limits: BudgetLimits) -> BudgetGovernor {
        BudgetGovernor::build(BudgetProfileId::Cheap, limits, None, None, false)
    }

    fn uncapped() -> BudgetLimits {
        BudgetLimits {
            max_llm_calls: None,
            max_tool_calls: None,
            max_web_search_calls: None,
            max_web_fetch_calls: None,
            max_subagent_spawns: None,
            max_retry_attempts: None,
            max_tokens: None,
            max_cost_usd: None,
            max_runtime_ms: None,
            browser_enabled: false,
        }
    }

    #[test]
    fn llm_call_ceiling_exact() {
        let gov = governor_with(BudgetLimits {
            max_llm_calls: Some(2),
            ..uncapped()
        });
        assert!(gov.record_llm_call(TokenUsage::default()).is_ok());
        assert!(gov.record_llm_call(TokenUsage::default()).is_ok());
        let err = gov.record_llm_call(TokenUsage::default()).unwrap_err();
        assert_eq!(err.kind, LimitKind::LlmCalls);
        assert_eq!(err.limit, 2.0);
    }

    #[test]
    fn tool_precheck_rejects_without_consuming() {
        let gov = governor_with(BudgetLimits {
            max_tool_calls: Some(2),
            ..uncapped()
        });
        assert!(gov.check_tool(None).is_ok());
        assert_eq!(gov.usage().tool_calls, 0);

        assert!(gov.record_tool_call(None).is_ok());
        assert!(gov.record_tool_call(None).is_ok());

        // The third call is unaffordable; the pre-check trips before it
        // starts and the counter stays put.
        let err = gov.check_tool(None).unwrap_err();
        assert_eq!(err.kind, LimitKind::ToolCalls);
        assert_eq!(gov.usage().tool_calls, 2);
        assert!(gov.is_tripped());
    }

    #[test]
    fn tool_precheck_covers_web_family_ceilings() {
        let gov = governor_with(BudgetLimits {
            max_web_search_calls: Some(1),
            ..uncapped()
        });
        assert!(gov.check_tool(Some("web_search")).is_ok());
        assert!(gov.record_tool_call(Some("web_search")).is_ok());

        let err = gov.check_tool(Some("web_search")).unwrap_err();
        assert_eq!(err.kind, LimitKind::WebSearchCalls);
        assert_eq!(gov.usage().web_search_calls, 1);
    }

    #[test]
    fn tripped_governor_stays_tripped_and_counters_freeze() {
        let gov = governor_with(BudgetLimits {
            max_tool_calls: Some(1),
            ..uncapped()
        });
        assert!(gov.record_tool_call(None).is_ok());
        assert!(gov.record_tool_call(None).is_err());
        assert!(gov.is_tripped());

        // Further calls fail with the original reason and don't consume.
        let err = gov.record_tool_call(None).unwrap_err();
        assert_eq!(err.kind, LimitKind::ToolCalls);
        assert_eq!(gov.usage().tool_calls, 2);
        assert!(gov.record_llm_call(TokenUsage::default()).is_err());
        assert_eq!(gov.usage().llm_calls, 0);
    }

    #[test]
    fn token_accumulation_and_ceiling() {
        let gov = governor_with(BudgetLimits {
            max_tokens: Some(1000),
            ..uncapped()
        });
        assert!(gov
            .record_llm_call(TokenUsage {
                input: 400,
                output: 200,
                ..Default::default()
            })
            .is_ok());
        assert_eq!(gov.usage().total_tokens(), 600);

        let err = gov
            .record_llm_call(TokenUsage {
                input: 400,
                output: 200,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind, LimitKind::Tokens);
        assert_eq!(err.current, 1200.0);
    }

    #[test]
    fn cost_ceiling() {
        let gov = governor_with(BudgetLimits {
            max_cost_usd: Some(0.05),
            ..uncapped()
        });
        let err = gov
            .record_llm_call(TokenUsage {
                cost_usd: 0.06,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind, LimitKind::CostUsd);
    }

    #[test]
    fn web_tool_families_tracked_separately() {
        let gov = governor_with(BudgetLimits {
            max_web_fetch_calls: Some(1),
            ..uncapped()
        });
        assert!(gov.record_tool_call(Some("web_search")).is_ok());
        assert!(gov.record_tool_call(Some("web_fetch")).is_ok());
        let err = gov.record_tool_call(Some("web_fetch")).unwrap_err();
        assert_eq!(err.kind, LimitKind::WebFetchCalls);
        assert_eq!(gov.usage().web_search_calls, 1);
        assert_eq!(gov.usage().web_fetch_calls, 2);
    }

    #[test]
    fn retry_ceiling_independent_of_calls() {
        let gov = governor_with(BudgetLimits {
            max_retry_attempts: Some(3),
            ..uncapped()
        });
        for _ in 0..3 {
            assert!(gov.record_retry().is_ok());
        }
        let err = gov.record_retry().unwrap_err();
        assert_eq!(err.kind, LimitKind::RetryAttempts);
        assert_eq!(gov.usage().retry_attempts, 3);
    }

    #[test]
    fn error_loop_trips_on_third_same_signature() {
        let gov = governor_with(uncapped());
        assert!(gov.record_error("api timeout").is_ok());
        assert!(gov.record_error("api timeout").is_ok());
        let err = gov.record_error("api timeout").unwrap_err();
        assert_eq!(err.kind, LimitKind::ErrorLoop);
        assert_eq!(err.current, 3.0);
    }

    #[test]
    fn distinct_error_signatures_counted_separately() {
        let gov = governor_with(uncapped());
        assert!(gov.record_error("a").is_ok());
        assert!(gov.record_error("a").is_ok());
        assert!(gov.record_error("b").is_ok());
        assert!(gov.record_error("b").is_ok());
        assert!(gov.record_error("c").is_ok());
    }

    #[test]
    fn cheap_profile_blocks_subagents_by_default() {
        let gov = BudgetGovernor::new(&config(), BudgetProfileId::Cheap);
        let err = gov.record_subagent_spawn().unwrap_err();
        assert_eq!(err.kind, LimitKind::SubagentSpawns);
    }

    #[test]
    fn browser_gated_by_profile() {
        let cheap = BudgetGovernor::new(&config(), BudgetProfileId::Cheap);
        assert!(!cheap.check_browser_allowed());
        let deep = BudgetGovernor::deep(&config(), DeepArm::default());
        assert!(deep.check_browser_allowed());
    }

    #[test]
    fn force_stop_rejects_everything() {
        let gov = BudgetGovernor::new(&config(), BudgetProfileId::Normal);
        gov.force_stop();
        assert!(gov.is_tripped());
        let err = gov.record_tool_call(None).unwrap_err();
        assert_eq!(err.kind, LimitKind::ForceStopped);
    }

    #[test]
    fn deep_expiry_reverts_to_normal_limits() {
        let cfg = config();
        let gov = BudgetGovernor::deep(
            &cfg,
            DeepArm {
                expires_in_ms: Some(0),
                one_run: false,
            },
        );
        // Observation is lazy; the first check flips the window.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(gov.check().is_ok());
        assert!(gov.deep_reverted());
        // Browser was deep-only, so it's gone after the revert.
        assert!(!gov.check_browser_allowed());
    }

    #[test]
    fn deep_one_run_reverts_on_complete() {
        let gov = BudgetGovernor::deep(
            &config(),
            DeepArm {
                expires_in_ms: None,
                one_run: true,
            },
        );
        assert!(!gov.deep_reverted());
        gov.complete();
        assert!(gov.deep_reverted());
    }

    #[test]
    fn runtime_ceiling() {
        let gov = governor_with(BudgetLimits {
            max_runtime_ms: Some(0),
            ..uncapped()
        });
        std::thread::sleep(std::time::Duration::from_millis(5));
        let err = gov.check().unwrap_err();
        assert_eq!(err.kind, LimitKind::RuntimeMs);
    }
}
