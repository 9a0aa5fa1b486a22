//! Operator assembly
//!
//! Wires the store client, finalizer registry, echo tracker, watcher and
//! dispatcher for one resource kind under a single lifetime scope.
//!
//! ```ignore
//! let operator = Operator::builder(store, WorkspaceReconciler)
//!     .scope(WatchScope::namespace("default"))
//!     .finalizer("workspaces.tether.dev/cleanup", cleanup)
//!     .build()?;
//! operator.run(shutdown).await;
//! ```

use std::sync::Arc;

use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::Client;
use crate::config::EngineConfig;
use crate::controller::{Context, Reconciler};
use crate::dispatcher::Dispatcher;
use crate::echo::EchoTracker;
use crate::finalizer::{Finalizer, FinalizerRegistry, FinalizerRegistryBuilder};
use crate::object::{Object, WatchScope};
use crate::sink::{ErrorSink, TracingErrorSink};
use crate::store::ObjectStore;
use crate::watcher::{Subscription, Watcher};
use crate::Result;

/// A running reconciliation engine for one kind and scope
pub struct Operator<K: Object, R: Reconciler<K>> {
    watcher: Arc<Watcher<K>>,
    dispatcher: Dispatcher<K, R>,
    context: Arc<Context<K>>,
    scope: WatchScope,
}

impl<K: Object, R: Reconciler<K>> Operator<K, R> {
    /// Start building an operator over `store` driving `reconciler`
    pub fn builder(store: Arc<dyn ObjectStore<K>>, reconciler: R) -> OperatorBuilder<K, R> {
        OperatorBuilder::new(store, reconciler)
    }

    /// Context handed to callbacks (client, attach primitive, sink)
    pub fn context(&self) -> Arc<Context<K>> {
        self.context.clone()
    }

    /// Store client shared with the engine
    pub fn client(&self) -> Client<K> {
        self.context.client().clone()
    }

    /// Raw, unfiltered event stream, as seen before echo suppression
    pub fn subscribe(&self) -> Subscription<K> {
        self.watcher.subscribe()
    }

    /// Run until `shutdown` is cancelled
    ///
    /// The dispatcher subscribes before the watcher starts listing, so the
    /// initial list reaches it as `Added` events. On shutdown the watcher
    /// stops reconnecting and running callbacks are allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let kind = K::kind(&());
        info!(%kind, scope = %self.scope, "operator starting");

        let events = self.watcher.subscribe();
        let watcher = self.watcher.clone();
        let token = shutdown.clone();
        let watch = tokio::spawn(async move { watcher.run(token).await });

        self.dispatcher.run(events, shutdown.clone()).await;

        // The dispatcher only returns early if the event stream ended
        shutdown.cancel();
        if let Err(e) = watch.await {
            error!(error = %e, "watcher task failed");
        }
        info!(%kind, "operator stopped");
    }
}

/// Builder for [`Operator`]
pub struct OperatorBuilder<K: Object, R: Reconciler<K>> {
    store: Arc<dyn ObjectStore<K>>,
    reconciler: R,
    scope: WatchScope,
    config: EngineConfig,
    finalizers: FinalizerRegistryBuilder<K>,
    sink: Option<Arc<dyn ErrorSink>>,
}

impl<K: Object, R: Reconciler<K>> OperatorBuilder<K, R> {
    fn new(store: Arc<dyn ObjectStore<K>>, reconciler: R) -> Self {
        Self {
            store,
            reconciler,
            scope: WatchScope::All,
            config: EngineConfig::default(),
            finalizers: FinalizerRegistry::builder(),
            sink: None,
        }
    }

    /// Limit the operator to one namespace (default: all namespaces)
    pub fn scope(mut self, scope: WatchScope) -> Self {
        self.scope = scope;
        self
    }

    /// Override engine settings
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a finalizer; registration order is drain order
    pub fn finalizer(mut self, id: impl Into<String>, finalizer: impl Finalizer<K> + 'static) -> Self {
        self.finalizers = self.finalizers.register(id, finalizer);
        self
    }

    /// Route failures to `sink` instead of the log
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the finalizer registrations and assemble the operator
    pub fn build(self) -> Result<Operator<K, R>> {
        let finalizers = Arc::new(self.finalizers.build()?);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingErrorSink) as Arc<dyn ErrorSink>);
        let client = Client::new(self.store, self.config.operation_timeout);

        let context = Arc::new(Context::new(
            client.clone(),
            finalizers,
            Arc::new(EchoTracker::new()),
            sink.clone(),
        ));
        let watcher = Arc::new(Watcher::new(
            client,
            self.scope.clone(),
            self.config.watcher,
            sink,
        ));
        let dispatcher = Dispatcher::new(
            Arc::new(self.reconciler),
            context.clone(),
            self.config.workers,
        );

        Ok(Operator {
            watcher,
            dispatcher,
            context,
            scope: self.scope,
        })
    }
}
