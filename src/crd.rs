//! Workspace Custom Resource Definition
//!
//! A small namespaced resource used by the demo operator binary and the
//! engine's test suites. A Workspace represents storage provisioned for an
//! owner that must be released before the resource goes away.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Workspace
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tether.dev",
    version = "v1alpha1",
    kind = "Workspace",
    plural = "workspaces",
    shortname = "ws",
    status = "WorkspaceStatus",
    namespaced,
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// User owning the workspace
    pub owner: String,

    /// Days to keep data after the workspace is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

impl WorkspaceSpec {
    /// Spec for the given owner with default retention
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            retention_days: None,
        }
    }
}

/// Observed state of a Workspace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    /// Lifecycle phase reported by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl WorkspaceStatus {
    /// Status reporting a provisioned workspace
    pub fn ready() -> Self {
        Self {
            phase: Some("Ready".to_string()),
        }
    }
}
