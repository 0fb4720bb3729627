//! Switchboard orchestration core.
//!
//! The substrate every channel adapter drives: per-session serialization
//! ([`lane::ActorQueue`]), cached backend handles ([`handle_cache`]),
//! buffering of messages that arrive mid-turn ([`followup`]), hard
//! per-run resource ceilings ([`budget`]), bounded-context transcripts
//! ([`context`]), and dedupe keys for replayed triggers ([`idempotency`]).
//! [`orchestrator::Orchestrator`] owns one instance of each and exposes
//! the inbound contract (`resolve_session_key` + `enqueue_turn`).

pub mod budget;
pub mod context;
pub mod events;
pub mod followup;
pub mod handle_cache;
pub mod idempotency;
pub mod lane;
pub mod orchestrator;
pub mod session_key;

pub use budget::BudgetGovernor;
pub use context::ContextWindowManager;
pub use followup::FollowupQueue;
pub use handle_cache::{RuntimeHandle, RuntimeHandleCache};
pub use lane::ActorQueue;
pub use orchestrator::Orchestrator;
pub use session_key::resolve_session_key;
