//! Tether - reconciliation and finalizer-lifecycle engine for Kubernetes-style operators
//!
//! Tether consumes the watch stream of one resource kind, decides for every
//! event whether user logic must run, and drives an ordered, restart-safe
//! finalizer drain before an object marked for deletion may disappear.
//!
//! # Architecture
//!
//! ```text
//! store -> watcher -> dispatcher -> Reconciler::{reconcile, deleted}
//!            |            |-> finalizer drain (one step per event)
//!            |            '-> echo tracker (suppresses the engine's own writes)
//!            '-> raw subscribers
//! ```
//!
//! Callbacks write back through the store client; those writes reappear on
//! the watch stream and are recognized as echoes.
//!
//! # Modules
//!
//! - [`object`] - Object identity, version tokens and meaningful payload
//! - [`store`] - Store contract plus in-memory and Kubernetes implementations
//! - [`client`] - Typed store facade with timeouts and single conflict retry
//! - [`watcher`] - Reconnecting list/watch with resync and fan-out
//! - [`echo`] - Echo tracking of the engine's own writes
//! - [`finalizer`] - Finalizer registry, attach and drain
//! - [`controller`] - The `Reconciler` capability and its `Context`
//! - [`dispatcher`] - Per-identity sequential event dispatch
//! - [`operator`] - Builder wiring everything for one kind
//! - [`sink`] - Failure reporting
//! - [`config`] - Engine configuration
//! - [`retry`] - Exponential backoff with jitter
//! - [`telemetry`] - Logging setup
//! - [`crd`] - The demo `Workspace` resource
//! - [`error`] - Error types for the engine

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod dispatcher;
pub mod echo;
pub mod error;
pub mod finalizer;
pub mod object;
pub mod operator;
pub mod retry;
pub mod sink;
pub mod store;
pub mod telemetry;
pub mod watcher;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
