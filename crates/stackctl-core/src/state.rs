use crate::cluster::ClusterApi;
use crate::error::Result;
use crate::release::{ReleaseManager, ReleaseStatus};

/// Deployment facts, always read live from the cluster. Nothing here is
/// cached or persisted, so every invocation starts from the cluster's view.
pub struct DeploymentState<'a> {
    cluster: &'a dyn ClusterApi,
    releases: &'a dyn ReleaseManager,
}

impl<'a> DeploymentState<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, releases: &'a dyn ReleaseManager) -> Self {
        Self { cluster, releases }
    }

    /// True for a release in any status, including one stuck mid-install.
    pub async fn exists(&self, release: &str, namespace: &str) -> Result<bool> {
        Ok(self.release_status(release, namespace).await?.is_some())
    }

    pub async fn release_status(
        &self,
        release: &str,
        namespace: &str,
    ) -> Result<Option<ReleaseStatus>> {
        Ok(self
            .releases
            .find(release, namespace)
            .await?
            .map(|r| r.status))
    }

    /// Zero when the namespace is gone or holds only implicit objects.
    pub async fn resource_count(&self, namespace: &str) -> Result<usize> {
        if !self.cluster.namespace_exists(namespace).await? {
            return Ok(0);
        }
        self.cluster.resource_count(namespace).await
    }
}
