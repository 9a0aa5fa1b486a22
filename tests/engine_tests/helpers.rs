//! Shared fixtures for the engine stories

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether::config::EngineConfig;
use tether::controller::{Context, Reconciler};
use tether::crd::{Workspace, WorkspaceSpec};
use tether::finalizer::{finalizer_fn, Finalizer};
use tether::object::{ObjectKey, WatchScope};
use tether::operator::{Operator, OperatorBuilder};
use tether::sink::{ErrorSink, Failure, Phase};
use tether::store::{MemoryStore, ObjectStore};
use tether::{Error, Result};

pub const NAMESPACE: &str = "default";

/// Upper bound for anything the engine is expected to do
pub const WAIT: Duration = Duration::from_secs(5);

/// Long enough for stray events to show up if the engine would emit them
pub const QUIET: Duration = Duration::from_millis(300);

pub fn workspace(name: &str) -> Workspace {
    let mut ws = Workspace::new(name, WorkspaceSpec::new("alice"));
    ws.metadata.namespace = Some(NAMESPACE.to_string());
    ws
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::for_kind::<Workspace>(Some(NAMESPACE), name)
}

// =============================================================================
// Recording
// =============================================================================

/// Ordered log of every callback the engine invoked
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| e.as_str() == entry).count()
    }
}

/// Error sink that keeps every failure for later assertions
#[derive(Default)]
pub struct CollectingSink {
    failures: Mutex<Vec<(Option<ObjectKey>, Phase, String)>>,
}

impl CollectingSink {
    pub fn count(&self, phase: &Phase) -> usize {
        self.failures
            .lock()
            .iter()
            .filter(|(_, p, _)| p == phase)
            .count()
    }

    pub fn keys(&self) -> Vec<Option<ObjectKey>> {
        self.failures.lock().iter().map(|(k, _, _)| k.clone()).collect()
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, failure: &Failure) {
        self.failures.lock().push((
            failure.key.clone(),
            failure.phase.clone(),
            failure.error.to_string(),
        ));
    }
}

/// Reconciler that journals its calls and attaches a fixed set of finalizers
pub struct Recorder {
    journal: Journal,
    attach: Vec<&'static str>,
    failures_left: AtomicUsize,
}

impl Recorder {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            attach: Vec::new(),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Attach these finalizers, in this order, on every reconcile
    pub fn attaching(mut self, ids: &[&'static str]) -> Self {
        self.attach = ids.to_vec();
        self
    }

    /// Fail the first `times` reconciles
    pub fn failing(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Reconciler<Workspace> for Recorder {
    async fn reconcile(&self, ws: Workspace, ctx: &Context<Workspace>) -> Result<()> {
        self.journal.record(format!("reconcile:{}", ws.name_any()));
        if take_failure(&self.failures_left) {
            return Err(Error::callback("downstream unavailable"));
        }

        let mut current = ws;
        for id in &self.attach {
            current = ctx.attach(id, &current).await?;
        }
        Ok(())
    }

    async fn deleted(&self, ws: Workspace, _ctx: &Context<Workspace>) -> Result<()> {
        self.journal.record(format!("deleted:{}", ws.name_any()));
        Ok(())
    }
}

fn take_failure(left: &AtomicUsize) -> bool {
    left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Finalizer journaling `finalize:<id>:<name>`
pub fn recording_finalizer(id: &'static str, journal: Journal) -> impl Finalizer<Workspace> {
    flaky_finalizer(id, journal, 0)
}

/// Finalizer failing its first `failures` runs, journaling each attempt
pub fn flaky_finalizer(
    id: &'static str,
    journal: Journal,
    failures: usize,
) -> impl Finalizer<Workspace> {
    let left = Arc::new(AtomicUsize::new(failures));
    finalizer_fn(move |ws: Workspace| {
        let journal = journal.clone();
        let left = left.clone();
        async move {
            if take_failure(&left) {
                journal.record(format!("failed:{id}:{}", ws.name_any()));
                Err(Error::callback("volume still attached"))
            } else {
                journal.record(format!("finalize:{id}:{}", ws.name_any()));
                Ok(())
            }
        }
    })
}

// =============================================================================
// Running operators
// =============================================================================

/// Engine settings with test-sized timings
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .workers(4)
        .operation_timeout(Duration::from_secs(2))
        .reconnect_backoff(Duration::from_millis(10), Duration::from_millis(50))
}

/// Operator over `store` in the test namespace, reporting into `sink`
pub fn operator(
    store: &Arc<MemoryStore<Workspace>>,
    reconciler: Recorder,
    sink: &Arc<CollectingSink>,
) -> OperatorBuilder<Workspace, Recorder> {
    let store: Arc<dyn ObjectStore<Workspace>> = store.clone();
    let sink: Arc<dyn ErrorSink> = sink.clone();
    Operator::builder(store, reconciler)
        .scope(WatchScope::namespace(NAMESPACE))
        .config(fast_config())
        .error_sink(sink)
}

/// An operator running in the background
pub struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub fn start(operator: Operator<Workspace, Recorder>) -> Running {
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(operator.run(shutdown.clone()));
    Running { shutdown, task }
}

impl Running {
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("operator did not stop")
            .expect("operator task panicked");
    }
}

// =============================================================================
// Waiting
// =============================================================================

/// Poll `check` until it holds, failing the test after [`WAIT`]
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Finalizers currently on the stored object (empty once it is gone)
pub async fn finalizers_of(store: &MemoryStore<Workspace>, name: &str) -> Vec<String> {
    store
        .get(&key(name))
        .await
        .map(|ws| ws.finalizers().to_vec())
        .unwrap_or_default()
}

pub async fn wait_for_finalizers(store: &MemoryStore<Workspace>, name: &str, expected: &[&str]) {
    let deadline = Instant::now() + WAIT;
    loop {
        let present = finalizers_of(store, name).await;
        if present == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for finalizers {expected:?} on {name}, have {present:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_removal(store: &MemoryStore<Workspace>, name: &str) {
    let deadline = Instant::now() + WAIT;
    loop {
        match store.get(&key(name)).await {
            Err(e) if e.is_not_found() => return,
            _ => {}
        }
        assert!(Instant::now() < deadline, "timed out waiting for {name} to be removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
