//! The orchestrator wires every core component together and exposes the
//! contract channel adapters drive: resolve a session key, submit text,
//! get back either a completed turn or a queued-followup position.
//!
//! One turn at a time per session key (the actor queue enforces it);
//! messages that arrive mid-turn become followups and are folded into
//! the next turn's input.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use swb_domain::config::{BudgetProfileId, Config, InboundMetadata};
use swb_domain::transcript::Message;
use swb_domain::Result;

use crate::budget::{BudgetGovernor, BudgetUsage, DeepArm};
use crate::context::{ArtifactSink, ContextWindowManager, Summarizer};
use crate::events::{LifecycleHooks, NullHooks};
use crate::followup::{FollowupItem, FollowupQueue, NullNotifier, PositionNotifier};
use crate::handle_cache::{
    control_signature, spawn_close, RunMode, RuntimeHandle, RuntimeHandleCache, SessionBackend,
};
use crate::idempotency::SeenSet;
use crate::lane::ActorQueue;
use crate::session_key::resolve_session_key;

/// What the backend produced for one turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub text: String,
}

/// Runs one turn against a live backend session.  Implementations must
/// report model and tool activity through the governor as they go and
/// bail out promptly when the cancellation token fires.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn execute(
        &self,
        handle: &RuntimeHandle,
        transcript: Vec<Message>,
        governor: &BudgetGovernor,
        cancel: CancellationToken,
    ) -> Result<TurnResult>;
}

/// Per-turn knobs.  Defaults to the configured budget profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnOptions {
    pub profile: Option<BudgetProfileId>,
    /// Arming options when the profile is deep.
    pub deep_arm: Option<DeepArm>,
}

#[derive(Debug, Clone)]
pub struct TurnReply {
    pub session_key: String,
    pub text: String,
    pub usage: BudgetUsage,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The session was idle; the turn ran to completion.
    Completed(TurnReply),
    /// The session was busy; the text was queued as a followup.
    Queued(FollowupItem),
}

/// A duplicate scheduled trigger is an outcome, not an error.
#[derive(Debug, Clone)]
pub enum ScheduledOutcome {
    Completed(TurnReply),
    Duplicate,
}

/// External collaborators the orchestrator delegates to.  Backend and
/// executor are required; the rest default to no-ops.
pub struct Collaborators {
    pub backend: Arc<dyn SessionBackend>,
    pub executor: Arc<dyn TurnExecutor>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub artifacts: Option<Arc<dyn ArtifactSink>>,
    pub notifier: Option<Box<dyn PositionNotifier>>,
    pub hooks: Option<Arc<dyn LifecycleHooks>>,
}

impl Collaborators {
    pub fn new(backend: Arc<dyn SessionBackend>, executor: Arc<dyn TurnExecutor>) -> Self {
        Self {
            backend,
            executor,
            summarizer: None,
            artifacts: None,
            notifier: None,
            hooks: None,
        }
    }
}

#[derive(Clone)]
struct ActiveTurn {
    governor: Arc<BudgetGovernor>,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    config: Config,
    queue: ActorQueue,
    handles: RuntimeHandleCache,
    followups: FollowupQueue,
    context: ContextWindowManager,
    seen: SeenSet,
    backend: Arc<dyn SessionBackend>,
    executor: Arc<dyn TurnExecutor>,
    hooks: Arc<dyn LifecycleHooks>,
    /// Governor and cancel token of the in-flight turn, per session.
    active: Mutex<HashMap<String, ActiveTurn>>,
}

impl Orchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Arc<Self> {
        let hooks = collaborators
            .hooks
            .unwrap_or_else(|| Arc::new(NullHooks) as Arc<dyn LifecycleHooks>);
        let context = ContextWindowManager::new(
            config.context.clone(),
            collaborators.summarizer,
            collaborators.artifacts,
            Arc::clone(&hooks),
        );
        let followups = FollowupQueue::new(
            config.followup.clone(),
            collaborators.notifier.unwrap_or_else(|| Box::new(NullNotifier)),
        );
        let orch = Arc::new(Self {
            queue: ActorQueue::new(),
            handles: RuntimeHandleCache::new(),
            followups,
            context,
            seen: SeenSet::default(),
            backend: collaborators.backend,
            executor: collaborators.executor,
            hooks,
            config,
            active: Mutex::new(HashMap::new()),
        });

        // Followups are drained when a lane slot frees up, the only
        // point ordered after every busy-check-and-enqueue.  A drain
        // anywhere earlier can miss an item enqueued while the finished
        // turn still held its slot.
        let weak = Arc::downgrade(&orch);
        orch.queue.set_release_hook(move |session_key| {
            if let Some(this) = weak.upgrade() {
                this.spawn_followup_turn(session_key);
            }
        });
        orch
    }

    /// Map an inbound trigger to its session key.
    pub fn session_key_for(&self, meta: &InboundMetadata) -> String {
        resolve_session_key(
            &self.config.sessions.agent_id,
            self.config.sessions.dm_scope,
            meta,
        )
    }

    // ── Inbound contract ─────────────────────────────────────────────

    /// Submit an inbound message.  Idle session: the turn runs now.
    /// Busy session: the text is queued as a followup and its position
    /// is returned.
    pub async fn submit(
        self: &Arc<Self>,
        meta: &InboundMetadata,
        text: impl Into<String>,
    ) -> Result<SubmitOutcome> {
        let key = self.session_key_for(meta);
        self.submit_keyed(&key, text, TurnOptions::default()).await
    }

    pub async fn submit_keyed(
        self: &Arc<Self>,
        session_key: &str,
        text: impl Into<String>,
        options: TurnOptions,
    ) -> Result<SubmitOutcome> {
        let text = text.into();
        // The busy check and the enqueue share the lane lock, so the
        // in-flight turn cannot release its slot in between; its
        // release-time drain always sees anything queued here.
        let queued = self
            .queue
            .if_busy(session_key, || self.followups.enqueue(session_key, text.clone()));
        if let Some(item) = queued {
            let item = item?;
            tracing::info!(
                session_key,
                item_id = %item.id,
                position = item.position,
                "session busy, followup queued"
            );
            return Ok(SubmitOutcome::Queued(item));
        }
        let reply = self.enqueue_turn(session_key, text, options).await?;
        Ok(SubmitOutcome::Completed(reply))
    }

    /// Run a scheduled or chained trigger exactly once per idempotency
    /// key.  Replayed deliveries resolve to [`ScheduledOutcome::Duplicate`].
    /// Unlike [`submit`], a busy session queues the turn in its lane
    /// rather than deferring to followups.
    pub async fn run_scheduled(
        self: &Arc<Self>,
        idempotency_key: &str,
        session_key: &str,
        text: impl Into<String>,
        options: TurnOptions,
    ) -> Result<ScheduledOutcome> {
        if !self.seen.insert_if_absent(idempotency_key) {
            tracing::info!(idempotency_key, session_key, "duplicate trigger suppressed");
            return Ok(ScheduledOutcome::Duplicate);
        }
        let reply = self.enqueue_turn(session_key, text.into(), options).await?;
        Ok(ScheduledOutcome::Completed(reply))
    }

    /// Stop the in-flight turn for a session, if any.  The governor
    /// trips as force-stopped and the cancellation token fires; the
    /// executor decides how abruptly to unwind.
    pub fn cancel(&self, session_key: &str) -> bool {
        let Some(turn) = self.active.lock().get(session_key).cloned() else {
            return false;
        };
        turn.governor.force_stop();
        turn.cancel.cancel();
        tracing::info!(session_key, "in-flight turn cancelled");
        true
    }

    // ── Introspection for adapters ───────────────────────────────────

    pub fn is_busy(&self, session_key: &str) -> bool {
        self.queue.is_busy(session_key)
    }

    pub fn followups(&self) -> &FollowupQueue {
        &self.followups
    }

    pub fn context(&self) -> &ContextWindowManager {
        &self.context
    }

    pub fn handles(&self) -> &RuntimeHandleCache {
        &self.handles
    }

    // ── Turn execution ───────────────────────────────────────────────

    /// Queue one turn in the session's lane and wait for it.  Unlike
    /// [`Orchestrator::submit_keyed`] this never defers to followups;
    /// callers that want strict ordering behind the in-flight turn use
    /// this directly.
    pub async fn enqueue_turn(
        self: &Arc<Self>,
        session_key: &str,
        text: impl Into<String>,
        options: TurnOptions,
    ) -> Result<TurnReply> {
        let text = text.into();
        let this = Arc::clone(self);
        let key = session_key.to_owned();
        self.queue
            .run(session_key, move || async move {
                this.turn_in_lane(key, text, options).await
            })
            .await?
    }

    async fn turn_in_lane(
        self: Arc<Self>,
        key: String,
        text: String,
        options: TurnOptions,
    ) -> Result<TurnReply> {
        let started = Instant::now();
        self.hooks.before_run(&key, Utc::now());

        // Followups that queued up before this turn got its slot are
        // folded into the input, oldest first.
        let input = match self.followups.drain_folded(&key) {
            Some(folded) => format!("{folded}\n{text}"),
            None => text,
        };

        self.context.maybe_prune(&key).await?;

        let handle = self.resolve_handle(&key).await?;
        let governor = Arc::new(self.build_governor(&options));
        let cancel = CancellationToken::new();
        self.active.lock().insert(
            key.clone(),
            ActiveTurn {
                governor: Arc::clone(&governor),
                cancel: cancel.clone(),
            },
        );

        self.context.append(&key, Message::user(input));
        let transcript = self.context.snapshot(&key);
        let result = self
            .executor
            .execute(&handle, transcript, &governor, cancel)
            .await;

        self.active.lock().remove(&key);
        governor.complete();

        let turn = match result {
            Ok(turn) => turn,
            Err(e) => {
                tracing::warn!(session_key = %key, error = %e, "turn failed");
                return Err(e);
            }
        };

        self.context.append(&key, Message::assistant(turn.text.clone()));
        self.handles.touch(&key);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.hooks.after_run(&key, elapsed_ms, turn.text.len());
        tracing::info!(
            session_key = %key,
            elapsed_ms,
            llm_calls = governor.usage().llm_calls,
            "turn complete"
        );

        // Opportunistic compaction between turns; the result swaps in
        // whenever the build finishes.  Followups that arrived mid-turn
        // are picked up by the lane release hook once this slot frees.
        let _ = self.context.maybe_swap(&key);

        Ok(TurnReply {
            session_key: key,
            text: turn.text,
            usage: governor.usage(),
        })
    }

    /// Drain queued followups into one folded turn.  Runs from the lane
    /// release hook, after the finished turn has given up its slot.
    fn spawn_followup_turn(self: &Arc<Self>, session_key: &str) {
        if self.followups.is_empty(session_key) {
            return;
        }
        let this = Arc::clone(self);
        let key = session_key.to_owned();
        tokio::spawn(async move {
            let Some(folded) = this.followups.drain_folded(&key) else {
                return;
            };
            tracing::debug!(session_key = %key, "running queued followups");
            if let Err(e) = this.enqueue_turn(&key, folded, TurnOptions::default()).await {
                tracing::warn!(session_key = %key, error = %e, "followup turn failed");
            }
        });
    }

    fn build_governor(&self, options: &TurnOptions) -> BudgetGovernor {
        let profile = options.profile.unwrap_or(self.config.budget.default_profile);
        match profile {
            BudgetProfileId::Deep => {
                BudgetGovernor::deep(&self.config.budget, options.deep_arm.unwrap_or_default())
            }
            p => BudgetGovernor::new(&self.config.budget, p),
        }
    }

    /// Reuse the cached handle when its control signature matches and it
    /// hasn't idled past the TTL; otherwise close it in the background
    /// and open a fresh session.  Staleness is recovered here, never
    /// surfaced to the caller.
    async fn resolve_handle(&self, key: &str) -> Result<RuntimeHandle> {
        let sessions = &self.config.sessions;
        let signature =
            control_signature(&[self.backend.id(), &sessions.agent_id, &sessions.workdir]);
        let ttl = Duration::from_secs(self.config.handle_cache.ttl_seconds);

        if let Some(handle) = self.handles.get(key) {
            if handle.signature == signature && handle.idle() < ttl {
                self.handles.touch(key);
                return Ok(handle);
            }
            let reason = if handle.signature != signature {
                "signature_changed"
            } else {
                "ttl_expired"
            };
            tracing::info!(session_key = %key, reason, "dropping stale runtime handle");
            if let Some(stale) = self.handles.clear(key) {
                spawn_close(stale, reason);
            }
        }

        let session = self
            .backend
            .open(key, &sessions.agent_id, &sessions.workdir)
            .await?;
        let now = Instant::now();
        let handle = RuntimeHandle {
            session_key: key.to_owned(),
            backend_id: self.backend.id().to_owned(),
            agent_id: sessions.agent_id.clone(),
            mode: RunMode::Persistent,
            workdir: sessions.workdir.clone(),
            signature,
            opened_at: now,
            last_used: now,
            session,
        };
        self.handles.set(key, handle.clone());
        tracing::debug!(session_key = %key, backend = %handle.backend_id, "runtime handle opened");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use swb_domain::error::LimitKind;
    use swb_domain::Error;

    use crate::handle_cache::BackendSession;

    struct MockSession;
    #[async_trait]
    impl BackendSession for MockSession {
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct MockBackend {
        opens: AtomicUsize,
    }
    #[async_trait]
    impl SessionBackend for MockBackend {
        async fn open(
            &self,
            _session_key: &str,
            _agent_id: &str,
            _workdir: &str,
        ) -> Result<Arc<dyn BackendSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockSession))
        }
        fn id(&self) -> &str {
            "mock"
        }
    }

    /// Echoes the last user message after an optional delay, recording
    /// one model call.
    struct EchoExecutor {
        delay: Duration,
        runs: AtomicUsize,
    }
    impl EchoExecutor {
        fn immediate() -> Self {
            Self {
                delay: Duration::ZERO,
                runs: AtomicUsize::new(0),
            }
        }
    }
    #[async_trait]
    impl TurnExecutor for EchoExecutor {
        async fn execute(
            &self,
            _handle: &RuntimeHandle,
            transcript: Vec<Message>,
            governor: &BudgetGovernor,
            _cancel: CancellationToken,
        ) -> Result<TurnResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            governor.record_llm_call(Default::default())?;
            let last = transcript
                .last()
                .and_then(|m| m.content.text().map(str::to_owned))
                .unwrap_or_default();
            Ok(TurnResult {
                text: format!("echo: {last}"),
            })
        }
    }

    /// Parks until cancelled, then reports the governor's trip reason.
    struct ParkedExecutor;
    #[async_trait]
    impl TurnExecutor for ParkedExecutor {
        async fn execute(
            &self,
            _handle: &RuntimeHandle,
            _transcript: Vec<Message>,
            governor: &BudgetGovernor,
            cancel: CancellationToken,
        ) -> Result<TurnResult> {
            cancel.cancelled().await;
            match governor.check() {
                Err(e) => Err(e.into()),
                Ok(()) => Ok(TurnResult {
                    text: "cancelled without trip".into(),
                }),
            }
        }
    }

    fn orchestrator_with(executor: Arc<dyn TurnExecutor>) -> (Arc<Orchestrator>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend {
            opens: AtomicUsize::new(0),
        });
        let orch = Orchestrator::new(
            Config::default(),
            Collaborators::new(backend.clone(), executor),
        );
        (orch, backend)
    }

    #[tokio::test]
    async fn submit_runs_turn_and_appends_transcript() {
        let (orch, _) = orchestrator_with(Arc::new(EchoExecutor::immediate()));
        let outcome = orch
            .submit_keyed("agent:main:main", "hello", TurnOptions::default())
            .await
            .unwrap();

        let SubmitOutcome::Completed(reply) = outcome else {
            panic!("expected completed turn");
        };
        assert_eq!(reply.text, "echo: hello");
        assert_eq!(reply.usage.llm_calls, 1);
        // user + assistant
        assert_eq!(orch.context().message_count("agent:main:main"), 2);
    }

    #[tokio::test]
    async fn handle_reused_until_ttl_expires() {
        let (orch, backend) = orchestrator_with(Arc::new(EchoExecutor::immediate()));
        for _ in 0..3 {
            orch.submit_keyed("k", "hi", TurnOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);

        let mut config = Config::default();
        config.handle_cache.ttl_seconds = 0;
        let backend2 = Arc::new(MockBackend {
            opens: AtomicUsize::new(0),
        });
        let orch2 = Orchestrator::new(
            config,
            Collaborators::new(backend2.clone(), Arc::new(EchoExecutor::immediate())),
        );
        orch2.submit_keyed("k", "a", TurnOptions::default()).await.unwrap();
        orch2.submit_keyed("k", "b", TurnOptions::default()).await.unwrap();
        assert_eq!(backend2.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn signature_mismatch_recreates_handle() {
        let (orch, backend) = orchestrator_with(Arc::new(EchoExecutor::immediate()));
        orch.submit_keyed("k", "a", TurnOptions::default()).await.unwrap();
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);

        // Simulate a control-plane change landing between turns.
        let mut stale = orch.handles().get("k").unwrap();
        stale.signature = "different-config".into();
        orch.handles().set("k", stale);

        orch.submit_keyed("k", "b", TurnOptions::default()).await.unwrap();
        assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_scheduled_trigger_runs_once() {
        let executor = Arc::new(EchoExecutor::immediate());
        let (orch, _) = orchestrator_with(executor.clone());
        let idem = crate::idempotency::schedule_key("job-7", 1_700_000_000_000);

        let first = orch
            .run_scheduled(&idem, "k", "tick", TurnOptions::default())
            .await
            .unwrap();
        let second = orch
            .run_scheduled(&idem, "k", "tick", TurnOptions::default())
            .await
            .unwrap();

        assert!(matches!(first, ScheduledOutcome::Completed(_)));
        assert!(matches!(second, ScheduledOutcome::Duplicate));
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_trips_force_stop() {
        let (orch, _) = orchestrator_with(Arc::new(ParkedExecutor));

        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move {
                orch.submit_keyed("k", "long job", TurnOptions::default())
                    .await
            })
        };

        // Wait for the turn to register as active, then cancel it.
        for _ in 0..100 {
            if orch.cancel("k") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        match runner.await.unwrap() {
            Err(Error::BudgetExceeded(e)) => assert_eq!(e.kind, LimitKind::ForceStopped),
            other => panic!("expected force-stop trip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_idle_session_is_noop() {
        let (orch, _) = orchestrator_with(Arc::new(EchoExecutor::immediate()));
        assert!(!orch.cancel("nobody-home"));
    }

    #[tokio::test]
    async fn metadata_routing_uses_session_key() {
        let (orch, _) = orchestrator_with(Arc::new(EchoExecutor::immediate()));
        let meta = InboundMetadata {
            channel: Some("telegram".into()),
            peer_id: Some("alice".into()),
            is_direct: true,
            ..Default::default()
        };
        let outcome = orch.submit(&meta, "hi").await.unwrap();
        let SubmitOutcome::Completed(reply) = outcome else {
            panic!("expected completed turn");
        };
        assert_eq!(reply.session_key, "agent:main:telegram:dm:alice");
    }
}
