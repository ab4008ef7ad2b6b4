use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("no stack.yaml found: pass --config or run from a directory containing one")]
    ConfigNotFound,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid name '{0}': must be a lowercase DNS label (a-z, 0-9, '-')")]
    InvalidName(String),

    #[error("required tool '{tool}' not found on PATH\n{hint}")]
    ToolNotFound { tool: String, hint: String },

    #[error("cluster is unreachable (context: {context})\n{detail}")]
    ClusterUnreachable { context: String, detail: String },

    #[error("values overlay for environment '{environment}' not found: {}", path.display())]
    OverlayMissing {
        environment: String,
        path: PathBuf,
    },

    #[error("cluster '{0}' does not exist; run 'stackctl setup' first")]
    ClusterMissing(String),

    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    #[error("'{program}' failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{selector} not ready after {timeout}")]
    NotReady { selector: String, timeout: String },

    #[error("resource set rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StackError>;
