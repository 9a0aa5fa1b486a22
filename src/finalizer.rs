//! Finalizer registry and the attach/drain protocol
//!
//! Finalizers are registered once per resource kind at startup, in order.
//! The registry is immutable afterwards and shared read-only by the
//! dispatcher and every reconcile context.
//!
//! Attach adds an identifier to an object's finalizer set at the position
//! dictated by registration order, so the resulting set always follows
//! registration order no matter in which order reconcile logic attaches.
//! Drain removes exactly one registered identifier per call, after its
//! callback succeeded. Identifiers this registry does not know are never
//! touched.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::client::{Client, Updated};
use crate::controller::guarded;
use crate::echo::EchoTracker;
use crate::object::{Object, ObjectKey, ResourceVersion};
use crate::{Error, Result};

/// Longest accepted finalizer identifier (a qualified Kubernetes name)
pub const MAX_IDENTIFIER_LEN: usize = 253;

/// A teardown step run before an object marked for deletion may disappear
#[async_trait]
pub trait Finalizer<K: Object>: Send + Sync {
    /// Release whatever the object holds; an error keeps the finalizer in place
    async fn finalize(&self, obj: &K) -> Result<()>;
}

/// Finalizer backed by an async closure, see [`finalizer_fn`]
pub struct FnFinalizer<F> {
    f: F,
}

/// Adapt an async closure into a [`Finalizer`]
///
/// ```ignore
/// let cleanup = finalizer_fn(|ws: Workspace| async move {
///     release_storage(&ws.spec.owner).await
/// });
/// ```
pub fn finalizer_fn<K, F, Fut>(f: F) -> FnFinalizer<F>
where
    K: Object,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnFinalizer { f }
}

#[async_trait]
impl<K, F, Fut> Finalizer<K> for FnFinalizer<F>
where
    K: Object,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn finalize(&self, obj: &K) -> Result<()> {
        (self.f)(obj.clone()).await
    }
}

struct Registration<K: Object> {
    id: String,
    finalizer: Arc<dyn Finalizer<K>>,
}

/// Result of one drain step
pub enum DrainOutcome<K> {
    /// The finalizer ran and its identifier was removed
    ///
    /// `object` is the written object, or `None` if it vanished meanwhile.
    Drained {
        /// Identifier that was drained
        finalizer: String,
        /// Object after removal of the identifier
        object: Option<K>,
    },
    /// The finalizer or the removal write failed; the identifier stays
    Failed {
        /// Identifier whose drain failed
        finalizer: String,
        /// What failed
        error: Error,
    },
    /// Only identifiers unknown to this registry remain
    Blocked {
        /// The foreign identifiers still present
        foreign: Vec<String>,
    },
    /// Nothing left to drain
    Empty,
}

/// Ordered, immutable mapping from finalizer identifier to callback
pub struct FinalizerRegistry<K: Object> {
    entries: Vec<Registration<K>>,
}

impl<K: Object> Default for FinalizerRegistry<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: Object> FinalizerRegistry<K> {
    /// Create a builder collecting registrations in order
    pub fn builder() -> FinalizerRegistryBuilder<K> {
        FinalizerRegistryBuilder::default()
    }

    /// Registered identifiers in registration order
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    /// Registration index of an identifier
    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// True if the identifier is registered for this kind
    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Number of registered finalizers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no finalizer is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered identifiers missing from the object's finalizer set
    pub fn missing(&self, obj: &K) -> Vec<String> {
        let present = obj.finalizers();
        self.identifiers()
            .filter(|id| !present.iter().any(|p| p == id))
            .map(str::to_string)
            .collect()
    }

    /// First identifier in `present` that this registry can drain
    pub fn next_to_drain<'a>(&self, present: &'a [String]) -> Option<&'a str> {
        present
            .iter()
            .map(String::as_str)
            .find(|id| self.contains(id))
    }

    /// Index at which `id` goes into `present` to follow registration order
    ///
    /// Placed before the first registered identifier that was registered
    /// later; foreign identifiers keep their positions (pure function).
    fn insertion_index(&self, present: &[String], id: &str) -> usize {
        let Some(rank) = self.position(id) else {
            return present.len();
        };
        present
            .iter()
            .position(|p| self.position(p).is_some_and(|other| other > rank))
            .unwrap_or(present.len())
    }

    /// Ensure `id` is in the object's finalizer set
    ///
    /// Returns the object unchanged without a write if the identifier is
    /// already present. Otherwise writes the object with the identifier
    /// inserted, records the write with the echo tracker and returns the
    /// stored object. A conflict retry that finds the identifier already
    /// attached by another writer records nothing.
    pub async fn attach(
        &self,
        client: &Client<K>,
        echo: &EchoTracker,
        id: &str,
        obj: &K,
    ) -> Result<K> {
        if !self.contains(id) {
            return Err(Error::configuration_for(
                id,
                format!("finalizer is not registered for {}", K::kind(&())),
            ));
        }
        if obj.finalizers().iter().any(|f| f == id) {
            return Ok(obj.clone());
        }

        let key = ObjectKey::of(obj);
        let updated = client
            .update(obj, |o| {
                let present = o.finalizers();
                if present.iter().any(|f| f == id) {
                    return false;
                }
                let index = self.insertion_index(present, id);
                o.finalizers_mut().insert(index, id.to_string());
                true
            })
            .await?;

        if updated.written() {
            if let Some(version) = ResourceVersion::of(updated.object()) {
                echo.record_self_write(&key, version);
            }
            debug!(%key, finalizer = id, "finalizer attached");
        } else {
            debug!(%key, finalizer = id, "finalizer attached by another writer");
        }
        Ok(updated.into_object())
    }

    /// Run and remove the first registered finalizer in the object's set
    pub async fn drain_one(&self, client: &Client<K>, echo: &EchoTracker, obj: &K) -> DrainOutcome<K> {
        let present = obj.finalizers();
        let Some(id) = self.next_to_drain(present) else {
            return if present.is_empty() {
                DrainOutcome::Empty
            } else {
                DrainOutcome::Blocked {
                    foreign: present.to_vec(),
                }
            };
        };
        let Some(registration) = self.entries.iter().find(|e| e.id == id) else {
            return DrainOutcome::Empty;
        };
        let id = registration.id.clone();
        let key = ObjectKey::of(obj);

        debug!(%key, finalizer = %id, "running finalizer");
        if let Err(error) = guarded(registration.finalizer.finalize(obj)).await {
            return DrainOutcome::Failed {
                finalizer: id,
                error,
            };
        }

        let removal = client
            .update(obj, |o| {
                let before = o.finalizers().len();
                o.finalizers_mut().retain(|f| *f != id);
                o.finalizers().len() != before
            })
            .await;

        match removal {
            Ok(Updated::Written(updated)) => {
                if let Some(version) = ResourceVersion::of(&updated) {
                    echo.record_self_write(&key, version);
                }
                info!(%key, finalizer = %id, "finalizer drained");
                DrainOutcome::Drained {
                    finalizer: id,
                    object: Some(updated),
                }
            }
            Ok(Updated::Unchanged(current)) => {
                debug!(%key, finalizer = %id, "finalizer already removed by another writer");
                DrainOutcome::Drained {
                    finalizer: id,
                    object: Some(current),
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(%key, finalizer = %id, "object vanished while draining");
                DrainOutcome::Drained {
                    finalizer: id,
                    object: None,
                }
            }
            Err(error) => DrainOutcome::Failed {
                finalizer: id,
                error,
            },
        }
    }
}

/// Builder for [`FinalizerRegistry`]; validation happens in [`build`](Self::build)
pub struct FinalizerRegistryBuilder<K: Object> {
    entries: Vec<Registration<K>>,
}

impl<K: Object> Default for FinalizerRegistryBuilder<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: Object> FinalizerRegistryBuilder<K> {
    /// Register a finalizer; order of calls is drain order
    pub fn register(mut self, id: impl Into<String>, finalizer: impl Finalizer<K> + 'static) -> Self {
        self.entries.push(Registration {
            id: id.into(),
            finalizer: Arc::new(finalizer),
        });
        self
    }

    /// Validate identifiers and freeze the registry
    pub fn build(self) -> Result<FinalizerRegistry<K>> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            validate_identifier(&entry.id)?;
            if !seen.insert(entry.id.as_str()) {
                return Err(Error::configuration_for(
                    &entry.id,
                    format!("finalizer registered twice for {}", K::kind(&())),
                ));
            }
        }
        Ok(FinalizerRegistry {
            entries: self.entries,
        })
    }
}

/// Check that an identifier can live in metadata.finalizers
fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::configuration_for(id, "finalizer identifier is empty"));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::configuration_for(
            id,
            format!("finalizer identifier exceeds {MAX_IDENTIFIER_LEN} characters"),
        ));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(Error::configuration_for(
            id,
            "finalizer identifier contains whitespace",
        ));
    }
    Ok(())
}
