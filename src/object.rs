//! Tracked object identity, version tokens and bookkeeping helpers
//!
//! The engine never owns objects: it works on snapshots handed out by the
//! store. Everything here is a pure function over those snapshots.

use std::fmt;

use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Bound for resource types the engine can reconcile
///
/// Any kube `Resource` with a static type (derived CRDs, k8s-openapi types)
/// that can round-trip through serde qualifies.
pub trait Object:
    Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Identity of a tracked object: (kind, namespace, name)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Resource kind (e.g. "Workspace")
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Key for a named object of kind `K`
    pub fn for_kind<K: Object>(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self::new(K::kind(&()), namespace, name)
    }

    /// Key of an object snapshot
    pub fn of<K: Object>(obj: &K) -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Opaque per-object version token assigned by the store
///
/// Kubernetes treats resourceVersion as opaque, but every real store (etcd
/// revisions, the in-memory store) hands out numeric, monotonically
/// increasing values. Ordering falls back to equality when either side is
/// not numeric.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Wrap a raw version string
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Version of an object snapshot, if the store assigned one
    pub fn of<K: Object>(obj: &K) -> Option<Self> {
        obj.resource_version().map(Self)
    }

    /// Raw version string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// True if `self` is the same as or newer than `other`
    pub fn covers(&self, other: &ResourceVersion) -> bool {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a >= b,
            _ => self == other,
        }
    }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scope of a list/watch: one namespace or every namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WatchScope {
    /// All namespaces (and cluster-scoped objects)
    All,
    /// A single namespace
    Namespace(String),
}

impl WatchScope {
    /// Scope limited to one namespace
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self::Namespace(ns.into())
    }

    /// Whether an identity falls inside this scope
    pub fn contains(&self, key: &ObjectKey) -> bool {
        match self {
            WatchScope::All => true,
            WatchScope::Namespace(ns) => key.namespace.as_deref() == Some(ns.as_str()),
        }
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchScope::All => f.write_str("*"),
            WatchScope::Namespace(ns) => f.write_str(ns),
        }
    }
}

/// Metadata fields owned by the store or the engine's finalizer bookkeeping
const BOOKKEEPING_FIELDS: &[&str] = &[
    "resourceVersion",
    "finalizers",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "generation",
    "managedFields",
];

/// Returns true once an external actor has requested deletion
pub fn is_deleting<K: Object>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// The part of an object user logic observes as meaningful
///
/// Serializes the object and strips the bookkeeping metadata, so two
/// snapshots that differ only by version, finalizer set or deletion marker
/// compare equal. Spec, status, labels and annotations all stay.
pub fn meaningful_payload<K: Object>(obj: &K) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(meta) = value
        .get_mut("metadata")
        .and_then(serde_json::Value::as_object_mut)
    {
        for field in BOOKKEEPING_FIELDS {
            meta.remove(*field);
        }
    }
    Ok(value)
}
