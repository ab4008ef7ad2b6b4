//! The cluster control-plane API as seen by the orchestrator.
//!
//! [`ClusterApi`] is the seam between the pipeline/teardown logic and the
//! real cluster. [`crate::kubectl::Kubectl`] implements it by shelling out to
//! kubectl; tests use an in-memory fake.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::config::ReadinessConfig;
use crate::error::Result;

/// Identifies the resources whose condition a readiness probe checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSelector {
    pub namespace: String,
    pub kind: String,
    pub label_selector: String,
    pub condition: String,
}

impl ResourceSelector {
    pub fn pods(namespace: impl Into<String>, label_selector: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: "pod".to_string(),
            label_selector: label_selector.into(),
            condition: "Ready".to_string(),
        }
    }

    pub fn from_config(namespace: &str, cfg: &ReadinessConfig) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: cfg.kind.clone(),
            label_selector: cfg.selector.clone(),
            condition: cfg.condition.clone(),
        }
    }
}

impl fmt::Display for ResourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -l {} -n {} ({})",
            self.kind, self.label_selector, self.namespace, self.condition
        )
    }
}

/// Result of submitting a set of manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The API server accepted the set; holds the `kind/name` of each object.
    Accepted(Vec<String>),
    /// The API server (or client-side validation) refused the set.
    Rejected(String),
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fails with [`crate::StackError::ClusterUnreachable`] when the API
    /// server cannot be reached with the current context.
    async fn cluster_reachable(&self) -> Result<()>;

    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    async fn create_namespace(&self, namespace: &str) -> Result<()>;

    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    /// Apply a file, directory or URL of manifests. `namespace` is the default
    /// for objects that do not set one.
    async fn apply_resource_set(
        &self,
        source: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<ApplyOutcome>;

    /// `kind/name` of every `kind` object in `namespace` matching `label_selector`.
    async fn get_resources_by_selector(
        &self,
        namespace: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<String>>;

    /// Delete one object, given as `kind/name`. Deleting an absent object is
    /// not an error.
    async fn delete_resource(&self, namespace: &str, resource: &str) -> Result<()>;

    /// True when at least one object matches and every match reports the
    /// selector's condition as `True`.
    async fn resource_condition_true(&self, selector: &ResourceSelector) -> Result<bool>;

    /// Number of user-owned objects left in `namespace`, ignoring the ones the
    /// control plane creates in every namespace.
    async fn resource_count(&self, namespace: &str) -> Result<usize>;
}
