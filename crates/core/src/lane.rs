//! Per-session actor queue.
//!
//! One lane per session key; each lane is a worker task draining an
//! unbounded channel of jobs, so operations for the same key run strictly
//! in arrival order while unrelated keys proceed fully in parallel.  A
//! failed operation reports only to its own caller and never blocks the
//! operations queued behind it.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use swb_domain::{Error, Result};

type Job = BoxFuture<'static, ()>;
type ReleaseHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    /// Jobs enqueued but not yet finished (includes the in-flight one).
    pending: usize,
}

/// Keyed serialization primitive: at most one in-flight operation per key.
pub struct ActorQueue {
    lanes: Arc<Mutex<HashMap<String, Lane>>>,
    /// Invoked after each finished job has given up its lane slot.
    on_release: Arc<Mutex<Option<ReleaseHook>>>,
}

impl Default for ActorQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorQueue {
    pub fn new() -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            on_release: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a callback invoked after every finished job, strictly
    /// after its lane slot has been released.  Anything enqueued while
    /// [`ActorQueue::if_busy`] observed the slot as held is therefore
    /// visible to the callback.
    pub fn set_release_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_release.lock() = Some(Arc::new(hook));
    }

    /// Run `f` under the lane table lock iff `key` has an in-flight or
    /// queued operation, making the busy check and `f` atomic with slot
    /// release.  Returns `None` without calling `f` when the key is idle.
    pub fn if_busy<T>(&self, key: &str, f: impl FnOnce() -> T) -> Option<T> {
        let lanes = self.lanes.lock();
        match lanes.get(key) {
            Some(lane) if lane.pending > 0 => Some(f()),
            _ => None,
        }
    }

    /// Run `op` after everything already queued for `key`.
    ///
    /// The returned future resolves with the operation's own output once
    /// its turn comes and it completes.  Queue bookkeeping itself never
    /// fails; [`Error::QueueFailure`] is only possible if the runtime is
    /// shutting down underneath us.
    pub async fn run<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<T>();

        let job: Job = Box::pin(async move {
            let out = op().await;
            // Caller may have gone away; the job still ran to completion.
            let _ = done_tx.send(out);
        });

        {
            let mut lanes = self.lanes.lock();
            let lane = lanes.entry(key.to_owned()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel::<Job>();
                self.spawn_worker(key.to_owned(), rx);
                Lane { tx, pending: 0 }
            });
            lane.pending += 1;
            if lane.tx.send(job).is_err() {
                // Worker gone — should not happen while the lane entry exists.
                lane.pending -= 1;
                return Err(Error::QueueFailure(format!(
                    "lane worker for {key} is gone"
                )));
            }
        }

        done_rx
            .await
            .map_err(|_| Error::QueueFailure(format!("operation for {key} was dropped")))
    }

    fn spawn_worker(&self, key: String, mut rx: mpsc::UnboundedReceiver<Job>) {
        let lanes = Arc::clone(&self.lanes);
        let on_release = Arc::clone(&self.on_release);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;

                // Decrement under the same lock `run` enqueues with, so a
                // send racing this cleanup either lands before the removal
                // check or creates a fresh lane.
                let drained = {
                    let mut lanes = lanes.lock();
                    match lanes.get_mut(&key) {
                        Some(lane) => {
                            lane.pending -= 1;
                            if lane.pending == 0 {
                                lanes.remove(&key);
                                true
                            } else {
                                false
                            }
                        }
                        None => true,
                    }
                };

                // The slot is free at this point; an `if_busy` enqueue
                // either saw the slot held and is now visible here, or
                // saw the key idle and served itself.
                let hook = on_release.lock().clone();
                if let Some(hook) = hook {
                    hook(&key);
                }

                if drained {
                    tracing::debug!(session_key = %key, "lane drained, removed");
                    break;
                }
            }
        });
    }

    /// Number of live lanes (sessions with in-flight or queued work).
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Operations in flight or queued for `key`.
    pub fn queued(&self, key: &str) -> usize {
        self.lanes.lock().get(key).map(|l| l.pending).unwrap_or(0)
    }

    /// True if the key currently has an in-flight or queued operation.
    pub fn is_busy(&self, key: &str) -> bool {
        self.queued(key) > 0
    }
}
