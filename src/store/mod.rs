//! The object store the engine reconciles against
//!
//! The store is an external collaborator: a versioned, watchable collection
//! of namespaced objects. [`ObjectStore`] is the contract the engine needs
//! from it; [`KubeStore`] talks to a real API server and [`MemoryStore`]
//! implements the same semantics in-process.

mod kubernetes;
mod memory;

pub use self::kubernetes::KubeStore;
pub use self::memory::MemoryStore;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::object::{Object, ObjectKey, ResourceVersion, WatchScope};
use crate::Result;

/// Stream of watch events, terminated by the store on disconnect
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Kind of change a watch event reports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Object appeared (or was first seen)
    Added,
    /// Object changed
    Modified,
    /// Object was removed from the store
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => f.write_str("Added"),
            EventType::Modified => f.write_str("Modified"),
            EventType::Deleted => f.write_str("Deleted"),
        }
    }
}

/// A single change observed on a watch: event kind plus object snapshot
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    /// Object appeared
    Added(K),
    /// Object changed
    Modified(K),
    /// Object was removed; carries the last state
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The kind of change
    pub fn event_type(&self) -> EventType {
        match self {
            WatchEvent::Added(_) => EventType::Added,
            WatchEvent::Modified(_) => EventType::Modified,
            WatchEvent::Deleted(_) => EventType::Deleted,
        }
    }

    /// The object snapshot carried by the event
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    /// Consume the event, returning its snapshot
    pub fn into_object(self) -> K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

impl<K: Object> WatchEvent<K> {
    /// Identity of the object the event is about
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(self.object())
    }

    /// Version carried by the event's snapshot
    pub fn version(&self) -> Option<ResourceVersion> {
        ResourceVersion::of(self.object())
    }
}

/// Result of a full list: the objects plus the store version they reflect
#[derive(Clone, Debug)]
pub struct ObjectList<K> {
    /// Objects in the listed scope, ordered by identity
    pub items: Vec<K>,
    /// Store version of the snapshot; watching from here misses nothing
    pub version: ResourceVersion,
}

/// Operations the engine needs from the object store
///
/// `update` uses the object's own resourceVersion as the expected version and
/// fails with [`Error::Conflict`](crate::Error::Conflict) when it is stale.
/// `get`, `update` and `delete` fail with
/// [`Error::NotFound`](crate::Error::NotFound) for unknown identities.
/// `watch` fails with [`Error::Expired`](crate::Error::Expired) when the
/// resume point is older than the store retains.
#[async_trait]
pub trait ObjectStore<K: Object>: Send + Sync {
    /// List every object in scope
    async fn list(&self, scope: &WatchScope) -> Result<ObjectList<K>>;

    /// Read one object
    async fn get(&self, key: &ObjectKey) -> Result<K>;

    /// Create an object, returning it with its assigned version
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object, guarded by its resourceVersion
    async fn update(&self, obj: &K) -> Result<K>;

    /// Request deletion of an object
    ///
    /// Objects with finalizers are only marked for deletion; they are
    /// removed once their finalizer set becomes empty.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Stream every change in scope made after `version`
    async fn watch(&self, scope: &WatchScope, version: &ResourceVersion)
        -> Result<EventStream<K>>;
}
