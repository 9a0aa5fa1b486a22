//! Typed facade over the object store
//!
//! Every call is bounded by the configured operation timeout (a timeout
//! surfaces as a transient error). `update` applies a caller-supplied
//! mutation and, on a version conflict, re-reads the object and re-applies
//! the mutation exactly once before giving up with `Conflict`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::object::{Object, ObjectKey, ResourceVersion, WatchScope};
use crate::store::{EventStream, ObjectList, ObjectStore};
use crate::{Error, Result};

/// Outcome of [`Client::update`]
#[derive(Clone, Debug)]
pub enum Updated<K> {
    /// The mutation was written; carries the stored object
    Written(K),
    /// The mutation had nothing to change; carries the object it was checked against
    Unchanged(K),
}

impl<K> Updated<K> {
    /// True if this call produced a new version
    pub fn written(&self) -> bool {
        matches!(self, Updated::Written(_))
    }

    /// The resulting object
    pub fn object(&self) -> &K {
        match self {
            Updated::Written(obj) | Updated::Unchanged(obj) => obj,
        }
    }

    /// Take the resulting object
    pub fn into_object(self) -> K {
        match self {
            Updated::Written(obj) | Updated::Unchanged(obj) => obj,
        }
    }
}

/// Store client shared by the watcher, the finalizer engine and user logic
pub struct Client<K: Object> {
    store: Arc<dyn ObjectStore<K>>,
    timeout: Duration,
}

impl<K: Object> Clone for Client<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            timeout: self.timeout,
        }
    }
}

impl<K: Object> Client<K> {
    /// Wrap a store, bounding each operation by `timeout`
    pub fn new(store: Arc<dyn ObjectStore<K>>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient(
                operation,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }

    /// List every object in scope, with the snapshot version
    pub async fn list(&self, scope: &WatchScope) -> Result<ObjectList<K>> {
        self.timed("list", self.store.list(scope)).await
    }

    /// Read one object
    pub async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.timed("get", self.store.get(key)).await
    }

    /// Create an object
    pub async fn create(&self, obj: &K) -> Result<K> {
        self.timed("create", self.store.create(obj)).await
    }

    /// Write an object as-is, guarded by its resourceVersion (no retry)
    pub async fn replace(&self, obj: &K) -> Result<K> {
        self.timed("update", self.store.update(obj)).await
    }

    /// Apply `mutate` to `current` and write the result
    ///
    /// `mutate` returns whether it changed anything; when it did not, no
    /// write happens and the (possibly re-read) object comes back as
    /// [`Updated::Unchanged`]. On a conflict the object is re-read and
    /// `mutate` re-applied once; a second conflict is returned to the caller.
    pub async fn update<F>(&self, current: &K, mutate: F) -> Result<Updated<K>>
    where
        F: Fn(&mut K) -> bool + Send + Sync,
    {
        let mut desired = current.clone();
        if !mutate(&mut desired) {
            return Ok(Updated::Unchanged(desired));
        }

        match self.replace(&desired).await {
            Ok(written) => Ok(Updated::Written(written)),
            Err(e) if e.is_conflict() => {
                let key = ObjectKey::of(current);
                debug!(%key, error = %e, "update conflicted, re-applying on fresh read");
                let mut fresh = self.get(&key).await?;
                if !mutate(&mut fresh) {
                    return Ok(Updated::Unchanged(fresh));
                }
                self.replace(&fresh).await.map(Updated::Written)
            }
            Err(e) => Err(e),
        }
    }

    /// Request deletion of an object
    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.timed("delete", self.store.delete(key)).await
    }

    /// Open a watch stream resuming after `version`
    ///
    /// Only opening the stream is bounded by the timeout; the stream itself
    /// lives until the store ends it.
    pub async fn watch(&self, scope: &WatchScope, version: &ResourceVersion) -> Result<EventStream<K>> {
        self.timed("watch", self.store.watch(scope, version)).await
    }
}
