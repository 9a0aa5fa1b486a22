//! Echo tracking for the engine's own writes
//!
//! Every write the engine performs comes back on the watch stream it is
//! reading. The tracker remembers, per identity:
//!
//! - the version produced by the engine's last write (cleared once an event
//!   at or past that version is observed),
//! - the meaningful payload last handed to user reconcile logic,
//! - the last deletion-path version that was successfully drained.
//!
//! An event whose meaningful payload equals the last handed payload is an
//! echo: it carries only bookkeeping changes (finalizers, deletion marker,
//! version) and must not trigger another reconcile. Raw watch subscribers
//! still see it; suppression happens only in the dispatcher.
//!
//! Each record is mutated only by the task processing that identity.

use dashmap::DashMap;
use serde_json::Value;

use crate::object::{ObjectKey, ResourceVersion};

/// How an observed event relates to what user logic has already seen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Echo {
    /// The event carries the engine's own last write and nothing meaningful changed
    OwnWrite,
    /// Nothing meaningful changed since the last reconcile (e.g. a resync)
    Unchanged,
    /// The meaningful payload differs from what was last handed out
    Changed,
}

impl Echo {
    /// True unless the event must be dispatched to reconcile logic
    pub fn is_suppressed(self) -> bool {
        !matches!(self, Echo::Changed)
    }
}

#[derive(Debug, Default)]
struct EchoRecord {
    self_write: Option<ResourceVersion>,
    handed: Option<Value>,
    settled: Option<ResourceVersion>,
}

/// Per-identity echo records
#[derive(Debug, Default)]
pub struct EchoTracker {
    records: DashMap<ObjectKey, EchoRecord>,
}

impl EchoTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the version produced by a write the engine just performed
    pub fn record_self_write(&self, key: &ObjectKey, version: ResourceVersion) {
        self.records.entry(key.clone()).or_default().self_write = Some(version);
    }

    /// Version of the engine's last unobserved write, if any
    pub fn pending_self_write(&self, key: &ObjectKey) -> Option<ResourceVersion> {
        self.records.get(key).and_then(|r| r.self_write.clone())
    }

    /// True if the engine already wrote a version newer than `version`
    ///
    /// A deletion-path event older than our pending write shows finalizers
    /// the engine has since removed and must not be drained again.
    pub fn is_superseded(&self, key: &ObjectKey, version: &ResourceVersion) -> bool {
        self.records
            .get(key)
            .and_then(|r| {
                r.self_write
                    .as_ref()
                    .map(|written| written != version && written.covers(version))
            })
            .unwrap_or(false)
    }

    /// Classify an incoming non-deleting event
    ///
    /// Clears the pending self-write once the event's version reaches it.
    pub fn observe(&self, key: &ObjectKey, version: Option<&ResourceVersion>, payload: &Value) -> Echo {
        let Some(mut record) = self.records.get_mut(key) else {
            return Echo::Changed;
        };

        let own = match (record.self_write.clone(), version) {
            (Some(written), Some(seen)) if seen.covers(&written) => {
                record.self_write = None;
                *seen == written
            }
            _ => false,
        };

        match &record.handed {
            Some(handed) if handed == payload && own => Echo::OwnWrite,
            Some(handed) if handed == payload => Echo::Unchanged,
            _ => Echo::Changed,
        }
    }

    /// True if the event is an echo and must not be reconciled
    pub fn should_suppress(
        &self,
        key: &ObjectKey,
        version: Option<&ResourceVersion>,
        payload: &Value,
    ) -> bool {
        self.observe(key, version, payload).is_suppressed()
    }

    /// Remember the payload handed to reconcile logic
    pub fn mark_handled(&self, key: &ObjectKey, payload: Value) {
        self.records.entry(key.clone()).or_default().handed = Some(payload);
    }

    /// Forget the handed payload so the next presentation is dispatched again
    pub fn clear_handled(&self, key: &ObjectKey) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.handed = None;
        }
    }

    /// Record that the deletion-path event at `version` was drained
    pub fn settle(&self, key: &ObjectKey, version: ResourceVersion) {
        self.records.entry(key.clone()).or_default().settled = Some(version);
    }

    /// True if a deletion-path event at `version` was already drained
    pub fn is_settled(&self, key: &ObjectKey, version: &ResourceVersion) -> bool {
        self.records
            .get(key)
            .and_then(|r| r.settled.as_ref().map(|settled| settled.covers(version)))
            .unwrap_or(false)
    }

    /// Drop everything known about an identity (terminal)
    pub fn forget(&self, key: &ObjectKey) {
        self.records.remove(key);
    }

    /// Number of identities with a record
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no identity has a record
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
