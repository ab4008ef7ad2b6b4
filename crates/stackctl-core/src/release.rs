//! The declarative release manager: installs a chart plus a values overlay as
//! a named release. [`Helm`] is the production implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::exec;
use crate::tools::Tool;

/// Everything needed to install or upgrade a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub name: String,
    pub chart: String,
    /// Environment overlay; passed through untouched.
    pub values: PathBuf,
    pub namespace: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    Removed,
    NotFound,
}

/// Where a release's latest revision stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    /// The first install never finished; nothing was ever deployed.
    PendingInstall,
    /// An upgrade or rollback never finished and still holds the release.
    PendingChange,
    Other,
}

impl ReleaseStatus {
    pub fn from_helm(status: &str) -> Self {
        match status {
            "deployed" => ReleaseStatus::Deployed,
            "failed" => ReleaseStatus::Failed,
            "pending-install" => ReleaseStatus::PendingInstall,
            "pending-upgrade" | "pending-rollback" => ReleaseStatus::PendingChange,
            _ => ReleaseStatus::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub name: String,
    pub status: ReleaseStatus,
}

#[async_trait]
pub trait ReleaseManager: Send + Sync {
    async fn install(&self, req: &ReleaseRequest) -> Result<()>;

    /// Upgrade in place, installing when no deployed revision exists.
    async fn upgrade(&self, req: &ReleaseRequest) -> Result<()>;

    /// Return to the last deployed revision.
    async fn rollback(&self, name: &str, namespace: &str) -> Result<()>;

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<UninstallOutcome>;

    /// Every release in `namespace`, whatever its status.
    async fn list(&self, namespace: &str) -> Result<Vec<ReleaseInfo>>;

    async fn find(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>> {
        Ok(self
            .list(namespace)
            .await?
            .into_iter()
            .find(|r| r.name == name))
    }
}

/// [`ReleaseManager`] backed by the `helm` binary.
#[derive(Debug, Clone)]
pub struct Helm {
    binary: PathBuf,
    kube_context: Option<String>,
}

impl Helm {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            kube_context: None,
        }
    }

    pub fn with_kube_context(mut self, context: impl Into<String>) -> Self {
        self.kube_context = Some(context.into());
        self
    }

    pub fn locate() -> Result<Self> {
        Ok(Self::new(Tool::Helm.locate()?))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = Vec::new();
        if let Some(ctx) = &self.kube_context {
            args.push("--kube-context".to_string());
            args.push(ctx.clone());
        }
        args.extend(rest.into_iter().map(Into::into));
        args
    }
}

fn release_args(verb: &str, req: &ReleaseRequest) -> Vec<String> {
    let mut args = vec![
        verb.to_string(),
        req.name.clone(),
        req.chart.clone(),
        "--namespace".to_string(),
        req.namespace.clone(),
        "--values".to_string(),
        req.values.to_string_lossy().into_owned(),
    ];
    if verb == "upgrade" {
        args.push("--install".to_string());
    }
    if req.dry_run {
        args.push("--dry-run".to_string());
    }
    args
}

#[derive(Deserialize)]
struct ListedRelease {
    name: String,
    status: String,
}

fn parse_list(stdout: &str) -> Result<Vec<ReleaseInfo>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let listed: Vec<ListedRelease> = serde_json::from_str(stdout)?;
    Ok(listed
        .into_iter()
        .map(|r| ReleaseInfo {
            status: ReleaseStatus::from_helm(&r.status),
            name: r.name,
        })
        .collect())
}

#[async_trait]
impl ReleaseManager for Helm {
    async fn install(&self, req: &ReleaseRequest) -> Result<()> {
        exec::run(&self.binary, self.args(release_args("install", req))).await?;
        Ok(())
    }

    async fn upgrade(&self, req: &ReleaseRequest) -> Result<()> {
        exec::run(&self.binary, self.args(release_args("upgrade", req))).await?;
        Ok(())
    }

    async fn rollback(&self, name: &str, namespace: &str) -> Result<()> {
        exec::run(
            &self.binary,
            self.args(["rollback", name, "--namespace", namespace, "--wait"]),
        )
        .await?;
        Ok(())
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<UninstallOutcome> {
        let out = exec::output(
            &self.binary,
            self.args(["uninstall", name, "--namespace", namespace]),
        )
        .await?;
        if out.status.success() {
            return Ok(UninstallOutcome::Removed);
        }
        if is_not_found(&String::from_utf8_lossy(&out.stderr)) {
            return Ok(UninstallOutcome::NotFound);
        }
        Err(exec::failure(&self.binary, &out))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<ReleaseInfo>> {
        // --all includes pending and failed releases, which still hold the name.
        let out = exec::run(
            &self.binary,
            self.args(["list", "--namespace", namespace, "--all", "--output", "json"]),
        )
        .await?;
        parse_list(&out)
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found")
}
