//! In-process object store
//!
//! Implements the full store contract without an API server: a global
//! revision counter stamps every write, updates are guarded by
//! resourceVersion, deletion of an object with finalizers only sets the
//! deletion marker, and the object is removed once its finalizer set is
//! emptied. Watches replay retained history from a resume point and fail
//! with `Expired` once that history has been compacted away.
//!
//! Fault injection hooks (`disconnect_watches`, `set_watch_outage`,
//! `compact`) let tests drive the watcher through reconnects and relists.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{EventStream, ObjectList, ObjectStore, WatchEvent};
use crate::object::{is_deleting, Object, ObjectKey, ResourceVersion, WatchScope};
use crate::{Error, Result};

/// Default number of events retained for watch resumption
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

struct Subscriber<K> {
    scope: WatchScope,
    tx: mpsc::UnboundedSender<Result<WatchEvent<K>>>,
}

struct State<K> {
    revision: u64,
    /// Oldest revision a watch may resume from
    compacted: u64,
    objects: BTreeMap<ObjectKey, K>,
    history: VecDeque<(u64, WatchEvent<K>)>,
    history_limit: usize,
    subscribers: Vec<Subscriber<K>>,
    watch_outage: bool,
    updates: u64,
}

impl<K: Object> State<K> {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn publish(&mut self, revision: u64, event: WatchEvent<K>) {
        let key = event.key();
        self.subscribers.retain(|sub| {
            !sub.scope.contains(&key) || sub.tx.send(Ok(event.clone())).is_ok()
        });

        self.history.push_back((revision, event));
        while self.history.len() > self.history_limit {
            if let Some((rev, _)) = self.history.pop_front() {
                self.compacted = rev;
            }
        }
    }
}

/// Versioned, watchable in-memory object store
pub struct MemoryStore<K: Object> {
    state: Mutex<State<K>>,
}

impl<K: Object> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl<K: Object> MemoryStore<K> {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store retaining at most `limit` events for resumption
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(State {
                revision: 0,
                compacted: 0,
                objects: BTreeMap::new(),
                history: VecDeque::new(),
                history_limit: limit,
                subscribers: Vec::new(),
                watch_outage: false,
                updates: 0,
            }),
        }
    }

    /// Number of successful `update` calls so far
    pub fn update_count(&self) -> u64 {
        self.state.lock().updates
    }

    /// Current store revision
    pub fn revision(&self) -> ResourceVersion {
        ResourceVersion::from(self.state.lock().revision)
    }

    /// End every open watch stream, as a dropped connection would
    pub fn disconnect_watches(&self) {
        let mut state = self.state.lock();
        debug!(count = state.subscribers.len(), "disconnecting watches");
        state.subscribers.clear();
    }

    /// Simulate the watch endpoint becoming unreachable (or reachable again)
    ///
    /// While the outage lasts, open streams receive a transient error and
    /// end, and new watches are refused.
    pub fn set_watch_outage(&self, outage: bool) {
        let mut state = self.state.lock();
        state.watch_outage = outage;
        if outage {
            for sub in state.subscribers.drain(..) {
                let _ = sub
                    .tx
                    .send(Err(Error::transient("watch", "connection reset by peer")));
            }
        }
    }

    /// Drop all retained history; older resume points become `Expired`
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.compacted = state.revision;
    }
}

fn stamp<K: Object>(obj: &mut K, revision: u64) {
    obj.meta_mut().resource_version = Some(revision.to_string());
}

#[async_trait]
impl<K: Object> ObjectStore<K> for MemoryStore<K> {
    async fn list(&self, scope: &WatchScope) -> Result<ObjectList<K>> {
        let state = self.state.lock();
        let items = state
            .objects
            .iter()
            .filter(|(key, _)| scope.contains(key))
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(ObjectList {
            items,
            version: ResourceVersion::from(state.revision),
        })
    }

    async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.state
            .lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key.clone()))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        if obj.meta().name.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::configuration_for(
                "metadata.name",
                "object has no name",
            ));
        }

        let key = ObjectKey::of(obj);
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists { key });
        }

        let revision = state.next_revision();
        let mut stored = obj.clone();
        stamp(&mut stored, revision);
        let meta = stored.meta_mut();
        meta.uid = Some(format!("uid-{revision}"));
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.deletion_timestamp = None;

        state.objects.insert(key, stored.clone());
        state.publish(revision, WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut state = self.state.lock();
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::not_found(key.clone()))?;

        if let Some(expected) = obj.resource_version() {
            let actual = current.resource_version().unwrap_or_default();
            if expected != actual {
                return Err(Error::conflict(
                    key,
                    format!("resourceVersion {expected} is stale, current is {actual}"),
                ));
            }
        }

        // Store-owned metadata cannot be changed through update
        let mut stored = obj.clone();
        let current_meta = current.meta().clone();
        let meta = stored.meta_mut();
        meta.uid = current_meta.uid;
        meta.creation_timestamp = current_meta.creation_timestamp;
        meta.deletion_timestamp = current_meta.deletion_timestamp;

        let revision = state.next_revision();
        stamp(&mut stored, revision);
        state.updates += 1;

        if is_deleting(&stored) && stored.finalizers().is_empty() {
            debug!(%key, "finalizers drained, removing object");
            state.objects.remove(&key);
            state.publish(revision, WatchEvent::Deleted(stored.clone()));
        } else {
            state.objects.insert(key, stored.clone());
            state.publish(revision, WatchEvent::Modified(stored.clone()));
        }
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state.lock();
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key.clone()))?;

        if current.finalizers().is_empty() {
            let revision = state.next_revision();
            let mut removed = current;
            stamp(&mut removed, revision);
            state.objects.remove(key);
            state.publish(revision, WatchEvent::Deleted(removed));
            return Ok(());
        }

        if is_deleting(&current) {
            return Ok(());
        }

        let revision = state.next_revision();
        let mut marked = current;
        marked.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        stamp(&mut marked, revision);
        state.objects.insert(key.clone(), marked.clone());
        state.publish(revision, WatchEvent::Modified(marked));
        Ok(())
    }

    async fn watch(
        &self,
        scope: &WatchScope,
        version: &ResourceVersion,
    ) -> Result<EventStream<K>> {
        let mut state = self.state.lock();
        if state.watch_outage {
            return Err(Error::transient("watch", "store unreachable"));
        }

        let from: u64 = version.as_str().parse().map_err(|_| Error::Expired {
            version: version.to_string(),
        })?;
        if from < state.compacted {
            return Err(Error::Expired {
                version: version.to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (rev, event) in state.history.iter() {
            if *rev > from && scope.contains(&event.key()) {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        state.subscribers.push(Subscriber {
            scope: scope.clone(),
            tx,
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
