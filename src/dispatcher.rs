//! Reconciliation dispatcher
//!
//! Consumes the watcher's event stream and decides, per event, which single
//! callback to run: reconcile, one finalizer drain step, or deleted. Events
//! for one identity are processed strictly in arrival order by one task at a
//! time; different identities run concurrently, bounded by the worker pool.
//!
//! Per identity the lifecycle is:
//!
//! ```text
//! Idle -> Reconciling -> Idle
//!                     -> Finalizing (one drain step per event) -> Deleted (forgotten)
//! ```
//!
//! Failures never stop the loop. They are reported to the error sink and the
//! object is retried when it is presented again (next event or resync).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::controller::{guarded, Context, Reconciler};
use crate::echo::Echo;
use crate::finalizer::DrainOutcome;
use crate::object::{is_deleting, meaningful_payload, Object, ObjectKey, ResourceVersion};
use crate::sink::{Failure, Phase};
use crate::store::WatchEvent;
use crate::Result;

/// What to do with one event
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Hand the object to reconcile logic; carries its meaningful payload
    Reconcile(Value),
    /// Run one finalizer drain step
    Drain,
    /// The object is gone: run deleted logic and forget the identity
    Deleted,
    /// Deleting, but only finalizers owned by someone else remain
    AwaitRemoval,
    /// Nothing meaningful changed since the last reconcile
    Suppress(Echo),
    /// A deletion-path presentation already drained
    Stale,
}

/// Decide the action for an event
///
/// Deletion-path decisions depend only on the event, the settled version and
/// the engine's pending write: a presentation older than a drain write is
/// stale. Live objects are checked against the echo tracker, which also
/// clears the pending self-write once it has been observed.
pub fn classify<K: Object>(event: &WatchEvent<K>, ctx: &Context<K>) -> Result<Action> {
    let obj = event.object();
    let key = ObjectKey::of(obj);
    let version = ResourceVersion::of(obj);

    if let WatchEvent::Deleted(_) = event {
        return Ok(Action::Deleted);
    }

    if is_deleting(obj) {
        if version
            .as_ref()
            .is_some_and(|v| ctx.echo().is_settled(&key, v) || ctx.echo().is_superseded(&key, v))
        {
            return Ok(Action::Stale);
        }
        return Ok(match ctx.finalizers().next_to_drain(obj.finalizers()) {
            Some(_) => Action::Drain,
            None => Action::AwaitRemoval,
        });
    }

    let payload = meaningful_payload(obj)?;
    Ok(match ctx.echo().observe(&key, version.as_ref(), &payload) {
        Echo::Changed => Action::Reconcile(payload),
        echo => Action::Suppress(echo),
    })
}

/// Per-identity sequential, cross-identity concurrent event processing
pub struct Dispatcher<K: Object, R: Reconciler<K>> {
    reconciler: Arc<R>,
    ctx: Arc<Context<K>>,
    workers: usize,
}

impl<K: Object, R: Reconciler<K>> Dispatcher<K, R> {
    /// Create a dispatcher running at most `workers` callbacks at once
    pub fn new(reconciler: Arc<R>, ctx: Arc<Context<K>>, workers: usize) -> Self {
        Self {
            reconciler,
            ctx,
            workers: workers.max(1),
        }
    }

    /// Consume `events` until the stream ends or `shutdown` is cancelled
    ///
    /// When the stream ends, events already queued are still processed. On
    /// shutdown no new event is accepted; callbacks already running are
    /// awaited and queued events that have not started are dropped.
    pub async fn run<S>(&self, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = WatchEvent<K>> + Send + Unpin,
    {
        let mut events = events;
        let permits = Arc::new(Semaphore::new(self.workers));
        // Identities with a task in flight, and the events queued behind it
        let mut active: HashMap<ObjectKey, VecDeque<WatchEvent<K>>> = HashMap::new();
        let mut tasks: JoinSet<ObjectKey> = JoinSet::new();

        info!(workers = self.workers, "dispatcher started");
        let mut accepting = true;
        loop {
            if !accepting && tasks.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let key = match joined {
                        Ok(key) => key,
                        Err(e) => {
                            error!(error = %e, "dispatch task aborted");
                            continue;
                        }
                    };
                    match active.get_mut(&key).and_then(VecDeque::pop_front) {
                        Some(next) => self.spawn(&mut tasks, &permits, key, next),
                        None => {
                            active.remove(&key);
                        }
                    }
                }
                event = events.next(), if accepting => match event {
                    Some(event) => {
                        let key = event.key();
                        match active.get_mut(&key) {
                            Some(queue) => {
                                trace!(%key, queued = queue.len() + 1, "identity busy, queueing event");
                                queue.push_back(event);
                            }
                            None => {
                                active.insert(key.clone(), VecDeque::new());
                                self.spawn(&mut tasks, &permits, key, event);
                            }
                        }
                    }
                    None => {
                        debug!("event stream ended, finishing queued events");
                        accepting = false;
                    }
                },
            }
        }

        // Tasks still waiting for a worker slot give up; running callbacks finish
        permits.close();
        let dropped: usize = active.values().map(VecDeque::len).sum();
        info!(in_flight = tasks.len(), dropped, "dispatcher draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "dispatch task aborted");
            }
        }
        info!("dispatcher stopped");
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<ObjectKey>,
        permits: &Arc<Semaphore>,
        key: ObjectKey,
        event: WatchEvent<K>,
    ) {
        let permits = permits.clone();
        let reconciler = self.reconciler.clone();
        let ctx = self.ctx.clone();
        tasks.spawn(async move {
            if let Ok(_permit) = permits.acquire_owned().await {
                dispatch(reconciler.as_ref(), &ctx, event).await;
            }
            key
        });
    }
}

/// Process one event for one identity
#[instrument(skip_all, fields(key = %event.key(), event = %event.event_type()))]
async fn dispatch<K: Object, R: Reconciler<K>>(reconciler: &R, ctx: &Context<K>, event: WatchEvent<K>) {
    let key = event.key();
    let version = event.version();

    let action = match classify(&event, ctx) {
        Ok(action) => action,
        Err(e) => {
            ctx.sink()
                .report(&Failure::for_object(key, Phase::Reconcile, e));
            return;
        }
    };

    match action {
        Action::Reconcile(payload) => {
            ctx.echo().mark_handled(&key, payload);
            debug!(version = ?version, "reconciling");
            if let Err(e) = guarded(reconciler.reconcile(event.into_object(), ctx)).await {
                ctx.echo().clear_handled(&key);
                if e.is_not_found() {
                    debug!(error = %e, "object vanished during reconcile");
                } else {
                    ctx.sink()
                        .report(&Failure::for_object(key, Phase::Reconcile, e));
                }
            }
        }
        Action::Drain => {
            let obj = event.into_object();
            match ctx
                .finalizers()
                .drain_one(ctx.client(), ctx.echo(), &obj)
                .await
            {
                DrainOutcome::Drained { finalizer, .. } => {
                    debug!(finalizer = %finalizer, "drain step complete");
                    if let Some(version) = version {
                        ctx.echo().settle(&key, version);
                    }
                }
                DrainOutcome::Failed { finalizer, error } if error.is_not_found() => {
                    debug!(finalizer = %finalizer, "object vanished during finalize");
                }
                DrainOutcome::Failed { finalizer, error } => {
                    ctx.sink()
                        .report(&Failure::for_object(key, Phase::Finalize(finalizer), error));
                }
                DrainOutcome::Blocked { foreign } => {
                    debug!(?foreign, "waiting for foreign finalizers");
                }
                DrainOutcome::Empty => {}
            }
        }
        Action::Deleted => {
            let obj = event.into_object();
            if !obj.finalizers().is_empty() {
                warn!(
                    finalizers = ?obj.finalizers(),
                    "object removed with finalizers still present"
                );
            }
            info!("object deleted");
            if let Err(e) = guarded(reconciler.deleted(obj, ctx)).await {
                ctx.sink()
                    .report(&Failure::for_object(key.clone(), Phase::Deleted, e));
            }
            ctx.echo().forget(&key);
        }
        Action::AwaitRemoval => {
            debug!(finalizers = ?event.object().finalizers(), "deleting, nothing left to drain");
        }
        Action::Suppress(echo) => {
            trace!(?echo, version = ?version, "suppressed echo");
        }
        Action::Stale => {
            trace!(version = ?version, "deletion step already settled");
        }
    }
}
