use swb_domain::config::{BudgetProfileId, Config, DmScope};

#[test]
fn default_profile_is_normal() {
    let config = Config::default();
    assert_eq!(config.budget.default_profile, BudgetProfileId::Normal);
}

#[test]
fn default_dm_scope_isolates_per_channel_peer() {
    let config = Config::default();
    assert_eq!(config.sessions.dm_scope, DmScope::PerChannelPeer);
    assert_eq!(config.sessions.agent_id, "main");
}

#[test]
fn empty_document_parses_to_defaults() {
    let config: Config = serde_json::from_str("{}").unwrap();
    assert_eq!(config.context.context_window_tokens, 200_000);
    assert_eq!(config.handle_cache.ttl_seconds, 1_800);
    assert_eq!(config.followup.max_queued, 10);
}

#[test]
fn partial_override_keeps_sibling_defaults() {
    let config: Config = serde_json::from_str(
        r#"{
            "context": { "prune_trigger_ratio": 0.9 },
            "sessions": { "dm_scope": "per_peer" }
        }"#,
    )
    .unwrap();
    assert_eq!(config.context.prune_trigger_ratio, 0.9);
    assert_eq!(config.context.prune_target_ratio, 0.7);
    assert_eq!(config.sessions.dm_scope, DmScope::PerPeer);
}

#[test]
fn prune_ratios_ordered_by_default() {
    let c = Config::default().context;
    assert!(c.shadow_trigger_ratio < c.prune_target_ratio);
    assert!(c.prune_target_ratio < c.prune_trigger_ratio);
}

#[test]
fn deep_profile_must_be_armed_with_expiry() {
    let config = Config::default();
    assert_eq!(config.budget.deep_expiry_ms, 30 * 60 * 1000);
    // Deep ceilings are the widest of the three profiles.
    let normal = config.budget.limits(BudgetProfileId::Normal);
    let deep = config.budget.limits(BudgetProfileId::Deep);
    assert!(deep.max_llm_calls.unwrap() > normal.max_llm_calls.unwrap());
    assert!(deep.browser_enabled);
    assert!(!normal.browser_enabled);
}

#[test]
fn budget_profile_round_trips_through_json() {
    let json = serde_json::to_string(&BudgetProfileId::Deep).unwrap();
    assert_eq!(json, "\"deep\"");
    let back: BudgetProfileId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, BudgetProfileId::Deep);
}
