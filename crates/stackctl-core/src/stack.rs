//! The concrete deployment pipeline built from `stack.yaml`:
//! provision → ingress → datastore → app → expose.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ApplyOutcome, ClusterApi};
use crate::config::{Config, Environment, ReadinessConfig};
use crate::error::{Result, StackError};
use crate::pipeline::{Pipeline, Stage, StageAction, StageContext};
use crate::provision::Provisioner;
use crate::readiness::ReadinessSpec;
use crate::release::{ReleaseManager, ReleaseRequest, ReleaseStatus};

pub const PROVISION: &str = "provision";
pub const INGRESS: &str = "ingress";
pub const DATASTORE: &str = "datastore";
pub const APP: &str = "app";
pub const EXPOSE: &str = "expose";

/// The external systems every stage talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterApi>,
    pub releases: Arc<dyn ReleaseManager>,
    pub provisioner: Arc<dyn Provisioner>,
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub environment: Environment,
    /// Values overlay for `environment`, already checked to exist.
    pub values: PathBuf,
    pub upgrade: bool,
    /// Replaces every stage's readiness timeout when set.
    pub timeout: Option<Duration>,
}

/// Build the full five-stage pipeline for `cfg`.
pub fn deploy_pipeline(
    cfg: &Config,
    opts: &DeployOptions,
    collab: &Collaborators,
) -> Result<Pipeline> {
    let readiness = |namespace: &str, rc: Option<&ReadinessConfig>| {
        rc.map(|rc| {
            let mut spec = ReadinessSpec::from_config(namespace, rc, cfg.poll_interval);
            if let Some(t) = opts.timeout {
                spec.timeout = t;
            }
            spec
        })
    };

    let ingress_ns = cfg
        .ingress
        .as_ref()
        .map(|i| i.namespace.clone())
        .unwrap_or_else(|| cfg.namespace.clone());

    let stages = vec![
        Stage::new(
            PROVISION,
            Arc::new(ProvisionAction {
                provisioner: Arc::clone(&collab.provisioner),
                cluster: Arc::clone(&collab.cluster),
                environment: opts.environment,
                cluster_name: cfg.cluster.name.clone(),
                cluster_config: cfg.cluster.config.as_ref().map(|p| cfg.resolve_path(p)),
                namespace: cfg.namespace.clone(),
            }),
        ),
        Stage::new(
            INGRESS,
            Arc::new(ApplyAction {
                stage: INGRESS,
                cluster: Arc::clone(&collab.cluster),
                source: cfg.ingress.as_ref().map(|i| cfg.resolve_source(&i.manifests)),
                namespace: ingress_ns.clone(),
            }),
        )
        .with_readiness(readiness(
            &ingress_ns,
            cfg.ingress.as_ref().and_then(|i| i.readiness.as_ref()),
        )),
        Stage::new(
            DATASTORE,
            Arc::new(ApplyAction {
                stage: DATASTORE,
                cluster: Arc::clone(&collab.cluster),
                source: cfg.datastore.manifests.as_deref().map(|m| cfg.resolve_source(m)),
                namespace: cfg.namespace.clone(),
            }),
        )
        .with_readiness(readiness(&cfg.namespace, cfg.datastore.readiness.as_ref())),
        Stage::new(
            APP,
            Arc::new(ReleaseAction {
                releases: Arc::clone(&collab.releases),
                request: ReleaseRequest {
                    name: cfg.release.clone(),
                    chart: cfg.chart_ref(),
                    values: opts.values.clone(),
                    namespace: cfg.namespace.clone(),
                    dry_run: false,
                },
                upgrade: opts.upgrade,
            }),
        )
        .with_readiness(readiness(&cfg.namespace, cfg.app.readiness.as_ref())),
        Stage::new(
            EXPOSE,
            Arc::new(ApplyAction {
                stage: EXPOSE,
                cluster: Arc::clone(&collab.cluster),
                source: cfg.expose.manifests.as_deref().map(|m| cfg.resolve_source(m)),
                namespace: cfg.namespace.clone(),
            }),
        )
        .with_readiness(readiness(&cfg.namespace, cfg.expose.readiness.as_ref())),
    ];

    Pipeline::chain(stages)
}

/// The cluster-level prefix of the pipeline used by `setup`.
pub fn setup_pipeline(
    cfg: &Config,
    opts: &DeployOptions,
    collab: &Collaborators,
) -> Result<Pipeline> {
    Ok(deploy_pipeline(cfg, opts, collab)?.truncate_after(INGRESS))
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Ensure the cluster exists (local only), answers, and has the namespace.
struct ProvisionAction {
    provisioner: Arc<dyn Provisioner>,
    cluster: Arc<dyn ClusterApi>,
    environment: Environment,
    cluster_name: String,
    cluster_config: Option<PathBuf>,
    namespace: String,
}

#[async_trait]
impl StageAction for ProvisionAction {
    async fn run(&self, ctx: &StageContext) -> Result<()> {
        if self.environment.provisions_cluster() {
            if self.provisioner.exists(&self.cluster_name).await? {
                tracing::info!(cluster = %self.cluster_name, "cluster already exists");
            } else if ctx.dry_run {
                return Err(StackError::ClusterMissing(self.cluster_name.clone()));
            } else {
                self.provisioner
                    .create(&self.cluster_name, self.cluster_config.as_deref())
                    .await?;
                tracing::info!(cluster = %self.cluster_name, "cluster created");
            }
        }

        self.cluster.cluster_reachable().await?;

        if self.cluster.namespace_exists(&self.namespace).await? {
            tracing::debug!(namespace = %self.namespace, "namespace exists");
        } else if ctx.dry_run {
            tracing::info!(namespace = %self.namespace, "dry run: would create namespace");
        } else {
            self.cluster.create_namespace(&self.namespace).await?;
            tracing::info!(namespace = %self.namespace, "namespace created");
        }
        Ok(())
    }
}

/// `kubectl apply` a manifest source; a stage without one is a no-op.
struct ApplyAction {
    stage: &'static str,
    cluster: Arc<dyn ClusterApi>,
    source: Option<String>,
    namespace: String,
}

#[async_trait]
impl StageAction for ApplyAction {
    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let Some(source) = &self.source else {
            tracing::info!(stage = self.stage, "no manifests configured");
            return Ok(());
        };
        match self
            .cluster
            .apply_resource_set(source, Some(&self.namespace), ctx.dry_run)
            .await?
        {
            ApplyOutcome::Accepted(objects) => {
                tracing::info!(
                    stage = self.stage,
                    objects = objects.len(),
                    %source,
                    "manifests applied"
                );
                Ok(())
            }
            ApplyOutcome::Rejected(reason) => Err(StackError::Rejected(reason)),
        }
    }
}

/// Install the release, or upgrade it when asked to. A deployed release
/// without `--upgrade` is left alone so re-running deploy changes nothing.
/// A release left pending or failed by an interrupted run is repaired first.
struct ReleaseAction {
    releases: Arc<dyn ReleaseManager>,
    request: ReleaseRequest,
    upgrade: bool,
}

#[async_trait]
impl StageAction for ReleaseAction {
    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let req = ReleaseRequest {
            dry_run: ctx.dry_run,
            ..self.request.clone()
        };
        let current = self
            .releases
            .find(&req.name, &req.namespace)
            .await?
            .map(|r| r.status);

        match current {
            None => {
                self.releases.install(&req).await?;
                tracing::info!(
                    release = %req.name,
                    values = %req.values.display(),
                    "release installed"
                );
            }
            Some(ReleaseStatus::Deployed) if !self.upgrade => {
                tracing::info!(
                    release = %req.name,
                    "release already installed; pass --upgrade to roll out changes"
                );
            }
            Some(ReleaseStatus::Deployed) => {
                self.releases.upgrade(&req).await?;
                tracing::info!(
                    release = %req.name,
                    values = %req.values.display(),
                    "release upgraded"
                );
            }
            Some(ReleaseStatus::PendingInstall) => {
                tracing::warn!(
                    release = %req.name,
                    "release stuck in pending-install; reinstalling"
                );
                if ctx.dry_run {
                    tracing::info!(release = %req.name, "dry run: would uninstall and reinstall");
                    return Ok(());
                }
                self.releases.uninstall(&req.name, &req.namespace).await?;
                self.releases.install(&req).await?;
                tracing::info!(release = %req.name, "release reinstalled");
            }
            Some(ReleaseStatus::PendingChange) => {
                tracing::warn!(
                    release = %req.name,
                    "release stuck mid-upgrade; rolling back first"
                );
                if ctx.dry_run {
                    tracing::info!(release = %req.name, "dry run: would roll back and upgrade");
                    return Ok(());
                }
                self.releases.rollback(&req.name, &req.namespace).await?;
                self.releases.upgrade(&req).await?;
                tracing::info!(release = %req.name, "release recovered");
            }
            Some(status @ (ReleaseStatus::Failed | ReleaseStatus::Other)) => {
                tracing::warn!(
                    release = %req.name,
                    ?status,
                    "release not deployed; upgrading in place"
                );
                self.releases.upgrade(&req).await?;
                tracing::info!(release = %req.name, "release recovered");
            }
        }
        Ok(())
    }
}
