//! Detection of the external CLIs each command needs.
//!
//! Missing tools are a prerequisite error: they are reported before any stage
//! runs, with an install hint per tool.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::config::Environment;
use crate::error::{Result, StackError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Kubectl,
    Helm,
    Kind,
}

impl Tool {
    pub fn binary(&self) -> &'static str {
        match self {
            Tool::Kubectl => "kubectl",
            Tool::Helm => "helm",
            Tool::Kind => "kind",
        }
    }

    fn install_hint(&self) -> &'static str {
        match self {
            Tool::Kubectl => "Install it: https://kubernetes.io/docs/tasks/tools/",
            Tool::Helm => "Install it: https://helm.sh/docs/intro/install/",
            Tool::Kind => "Install it: https://kind.sigs.k8s.io/docs/user/quick-start/#installation",
        }
    }

    /// Locate this tool on PATH.
    pub fn locate(&self) -> Result<PathBuf> {
        which::which(self.binary()).map_err(|_| self.not_found())
    }

    /// Locate this tool in the directories of `search_path` only.
    pub fn locate_in(&self, search_path: &OsStr) -> Result<PathBuf> {
        which::which_in(self.binary(), Some(search_path), Path::new("/"))
            .map_err(|_| self.not_found())
    }

    fn not_found(&self) -> StackError {
        StackError::ToolNotFound {
            tool: self.binary().to_string(),
            hint: self.install_hint().to_string(),
        }
    }
}

/// Tools needed to deploy into `env`. kind is only needed where the cluster is
/// provisioned locally.
pub fn required_for_deploy(env: Environment) -> Vec<Tool> {
    let mut tools = vec![Tool::Kubectl, Tool::Helm];
    if env.provisions_cluster() {
        tools.push(Tool::Kind);
    }
    tools
}

/// Tools needed by `cleanup`. kind is only needed when the cluster goes too.
pub fn required_for_cleanup(remove_cluster: bool) -> Vec<Tool> {
    if remove_cluster {
        vec![Tool::Kubectl, Tool::Helm, Tool::Kind]
    } else {
        vec![Tool::Kubectl, Tool::Helm]
    }
}

/// Check every tool in `tools`, reporting the first one missing.
pub fn require(tools: &[Tool]) -> Result<()> {
    for tool in tools {
        let path = tool.locate()?;
        tracing::debug!(tool = tool.binary(), path = %path.display(), "found tool");
    }
    Ok(())
}
