//! User-facing controller capability
//!
//! A [`Reconciler`] supplies the two callbacks the engine invokes: `reconcile`
//! for every meaningful change of a live object and `deleted` once an object
//! is gone. Both receive a [`Context`] carrying the store client and the
//! finalizer attach primitive.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::client::Client;
use crate::echo::EchoTracker;
use crate::finalizer::FinalizerRegistry;
use crate::object::Object;
use crate::sink::ErrorSink;
use crate::{Error, Result};

/// Business logic for one resource kind
///
/// Errors returned from either callback are reported to the error sink and
/// the object is presented again on its next event (or the next resync).
/// `NotFound` errors are treated as completion: the object went away.
#[async_trait]
pub trait Reconciler<K: Object>: Send + Sync + 'static {
    /// Converge real-world state with the object; never called while deleting
    async fn reconcile(&self, obj: K, ctx: &Context<K>) -> Result<()>;

    /// Called once after the object was removed from the store
    async fn deleted(&self, obj: K, ctx: &Context<K>) -> Result<()> {
        let _ = (obj, ctx);
        Ok(())
    }
}

/// Shared context for reconcile, finalize and deleted invocations
///
/// Holds the store client, the immutable finalizer registry, the echo
/// tracker recording the engine's own writes, and the error sink.
pub struct Context<K: Object> {
    client: Client<K>,
    finalizers: Arc<FinalizerRegistry<K>>,
    echo: Arc<EchoTracker>,
    sink: Arc<dyn ErrorSink>,
}

impl<K: Object> Context<K> {
    /// Assemble a context from its parts
    pub fn new(
        client: Client<K>,
        finalizers: Arc<FinalizerRegistry<K>>,
        echo: Arc<EchoTracker>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            client,
            finalizers,
            echo,
            sink,
        }
    }

    /// Store client for reads and writes made by user logic
    pub fn client(&self) -> &Client<K> {
        &self.client
    }

    /// Finalizers registered for this kind
    pub fn finalizers(&self) -> &FinalizerRegistry<K> {
        &self.finalizers
    }

    /// Echo records of the engine's own writes
    pub fn echo(&self) -> &EchoTracker {
        &self.echo
    }

    /// Sink receiving engine failures
    pub fn sink(&self) -> &dyn ErrorSink {
        self.sink.as_ref()
    }

    /// Ensure the registered finalizer `id` is on the object
    ///
    /// No write happens if it already is. Returns the current object so later
    /// logic in the same reconcile works on the stored version.
    pub async fn attach(&self, id: &str, obj: &K) -> Result<K> {
        self.finalizers
            .attach(&self.client, &self.echo, id, obj)
            .await
    }

    /// Attach every registered finalizer the object is missing
    pub async fn attach_all(&self, obj: &K) -> Result<K> {
        let mut current = obj.clone();
        for id in self.finalizers.missing(obj) {
            current = self.attach(&id, &current).await?;
        }
        Ok(current)
    }
}

/// Run a user callback, turning a panic into a callback failure
pub(crate) async fn guarded<T, F>(callback: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::callback(format!(
            "callback panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}
