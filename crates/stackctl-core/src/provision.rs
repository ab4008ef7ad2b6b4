//! Local cluster provisioning. Only the `local` environment owns its cluster;
//! [`Kind`] creates and deletes it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::exec;
use crate::tools::Tool;

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn create(&self, name: &str, config: Option<&Path>) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// kube context name the provisioned cluster registers under.
    fn context_for(&self, name: &str) -> String;
}

/// [`Provisioner`] backed by the `kind` binary.
#[derive(Debug, Clone)]
pub struct Kind {
    binary: PathBuf,
}

impl Kind {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn locate() -> Result<Self> {
        Ok(Self::new(Tool::Kind.locate()?))
    }
}

#[async_trait]
impl Provisioner for Kind {
    async fn exists(&self, name: &str) -> Result<bool> {
        let out = exec::run(&self.binary, ["get", "clusters"]).await?;
        Ok(exec::lines(&out).iter().any(|c| c == name))
    }

    async fn create(&self, name: &str, config: Option<&Path>) -> Result<()> {
        let mut args = vec![
            "create".to_string(),
            "cluster".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if let Some(cfg) = config {
            args.push("--config".to_string());
            args.push(cfg.to_string_lossy().into_owned());
        }
        tracing::info!(cluster = name, "creating kind cluster (this can take a minute)");
        exec::run(&self.binary, args).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        exec::run(&self.binary, ["delete", "cluster", "--name", name]).await?;
        Ok(())
    }

    fn context_for(&self, name: &str) -> String {
        format!("kind-{name}")
    }
}
