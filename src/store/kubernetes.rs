//! Object store backed by a Kubernetes API server
//!
//! Maps the store contract onto kube-rs: `update` is a `replace` carrying the
//! object's resourceVersion, watches resume from a resourceVersion, and API
//! status codes are translated into the engine's error taxonomy.

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::{future, StreamExt};
use kube::api::{
    Api, DeleteParams, ListParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams,
};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use tracing::trace;

use super::{EventStream, ObjectList, ObjectStore, WatchEvent};
use crate::object::{Object, ObjectKey, ResourceVersion, WatchScope};
use crate::{Error, Result};

/// Server-side timeout for a single watch request; the watcher reconnects after it
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Translate a kube error into a store outcome (pure function)
fn map_kube_error(err: kube::Error, operation: &str, key: Option<&ObjectKey>) -> Error {
    match (err, key) {
        (kube::Error::Api(ae), Some(key)) if ae.code == 404 => Error::not_found(key.clone()),
        (kube::Error::Api(ae), Some(key)) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::AlreadyExists { key: key.clone() }
        }
        (kube::Error::Api(ae), Some(key)) if ae.code == 409 => Error::conflict(key.clone(), ae.message),
        (kube::Error::Api(ae), _) if ae.code == 410 => Error::Expired {
            version: ae.message,
        },
        (other, _) => Error::transient(operation, other.to_string()),
    }
}

/// Store implementation over `kube::Api<K>` for namespaced resources
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Object + Resource<Scope = NamespaceResourceScope>,
{
    /// Create a store using the given kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn scoped_api(&self, scope: &WatchScope) -> Api<K> {
        match scope {
            WatchScope::All => Api::all(self.client.clone()),
            WatchScope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<K> {
        match &key.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Object + Resource<Scope = NamespaceResourceScope>,
{
    async fn list(&self, scope: &WatchScope) -> Result<ObjectList<K>> {
        let list = self
            .scoped_api(scope)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, "list", None))?;
        let version = list
            .metadata
            .resource_version
            .ok_or_else(|| Error::transient("list", "list response carried no resourceVersion"))?;
        Ok(ObjectList {
            items: list.items,
            version: ResourceVersion::new(version),
        })
    }

    async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.api_for(key)
            .get(&key.name)
            .await
            .map_err(|e| map_kube_error(e, "get", Some(key)))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.api_for(&key)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(e, "create", Some(&key)))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.api_for(&key)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(e, "update", Some(&key)))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.api_for(key)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e, "delete", Some(key)))
    }

    async fn watch(
        &self,
        scope: &WatchScope,
        version: &ResourceVersion,
    ) -> Result<EventStream<K>> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self
            .scoped_api(scope)
            .watch(&params, version.as_str())
            .await
            .map_err(|e| map_kube_error(e, "watch", None))?;

        let resume = version.clone();
        let events = stream.filter_map(move |event| {
            let mapped = match event {
                Ok(KubeWatchEvent::Added(obj)) => Some(Ok(WatchEvent::Added(obj))),
                Ok(KubeWatchEvent::Modified(obj)) => Some(Ok(WatchEvent::Modified(obj))),
                Ok(KubeWatchEvent::Deleted(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                Ok(KubeWatchEvent::Bookmark(bookmark)) => {
                    trace!(version = %bookmark.metadata.resource_version, "watch bookmark");
                    None
                }
                Ok(KubeWatchEvent::Error(ae)) if ae.code == 410 => Some(Err(Error::Expired {
                    version: resume.to_string(),
                })),
                Ok(KubeWatchEvent::Error(ae)) => Some(Err(Error::transient("watch", ae.message))),
                Err(e) => Some(Err(map_kube_error(e, "watch", None))),
            };
            future::ready(mapped)
        });

        Ok(events.boxed())
    }
}
