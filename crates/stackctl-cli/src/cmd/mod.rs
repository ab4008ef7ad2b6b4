pub mod cleanup;
pub mod deploy;
pub mod forward;
pub mod setup;
pub mod status;

use anyhow::{bail, Context, Result};
use stackctl_core::config::{Config, Environment, WarnLevel};
use stackctl_core::kubectl::Kubectl;
use stackctl_core::pipeline::{PipelineReport, ReadinessOutcome};
use stackctl_core::provision::{Kind, Provisioner};
use stackctl_core::release::Helm;
use stackctl_core::rollout::{self, Opened};
use stackctl_core::session::{KubectlPortForward, SessionManager};
use stackctl_core::stack::Collaborators;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::output::print_table;
use crate::root;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Load and validate the stack config. Warnings are logged; errors refuse to
/// proceed.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = root::resolve_config(explicit)?;
    let cfg = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    let mut errors = Vec::new();
    for warning in cfg.validate() {
        match warning.level {
            WarnLevel::Warning => tracing::warn!("{}", warning.message),
            WarnLevel::Error => errors.push(warning.message),
        }
    }
    if !errors.is_empty() {
        bail!(
            "invalid config {}:\n  {}",
            path.display(),
            errors.join("\n  ")
        );
    }
    Ok(cfg)
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Live clients for one environment.
pub struct Clients {
    pub collab: Collaborators,
    pub kubectl: Kubectl,
    /// kube context every call is pinned to; `None` means the current one.
    pub context: Option<String>,
}

impl Clients {
    /// The local environment targets the provisioned cluster's context;
    /// staging and production use whatever context is current.
    pub fn connect(cfg: &Config, env: Environment) -> Result<Self> {
        // kind is only invoked for the local cluster; callers check for it
        // with the rest of their prerequisites.
        let kind = Kind::locate().unwrap_or_else(|_| Kind::new(PathBuf::from("kind")));
        let context = env
            .provisions_cluster()
            .then(|| kind.context_for(&cfg.cluster.name));

        let mut kubectl = Kubectl::locate()?;
        let mut helm = Helm::locate()?;
        if let Some(ctx) = &context {
            kubectl = kubectl.with_context(ctx.clone());
            helm = helm.with_kube_context(ctx.clone());
        }

        Ok(Self {
            collab: Collaborators {
                cluster: Arc::new(kubectl.clone()),
                releases: Arc::new(helm),
                provisioner: Arc::new(kind),
            },
            kubectl,
            context,
        })
    }

    pub fn sessions(&self) -> SessionManager {
        SessionManager::new(Box::new(KubectlPortForward::new(
            self.kubectl.binary().to_path_buf(),
            self.context.clone(),
        )))
    }
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Resolves on Ctrl-C. A failure to install the handler never resolves.
pub async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Open every configured forward and keep them up until Ctrl-C. Sessions are
/// closed on every exit path, including an interrupt mid-open.
pub async fn hold_forwards(cfg: &Config, sessions: &mut SessionManager) -> Result<()> {
    if cfg.forwards.is_empty() {
        println!("No forwards configured.");
        return Ok(());
    }
    match rollout::open_forwards(cfg, sessions, interrupted()).await? {
        Opened::All => keep_open(sessions).await,
        Opened::Cancelled => Ok(()),
    }
}

/// Print the open sessions and wait for Ctrl-C, then close them all.
pub async fn keep_open(sessions: &mut SessionManager) -> Result<()> {
    for session in sessions.sessions() {
        println!(
            "{:<16} {}  -> {}",
            session.label,
            session.url(),
            session.target.resource
        );
    }
    println!("Press Ctrl-C to stop forwarding.");

    let result = wait_for_interrupt(sessions).await;
    let closed = sessions.close_all().await;
    tracing::info!(closed, "sessions closed");
    result
}

async fn wait_for_interrupt(sessions: &mut SessionManager) -> Result<()> {
    let mut check = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                return res.context("waiting for Ctrl-C");
            }
            _ = check.tick() => {
                for label in sessions.reap_exited() {
                    tracing::warn!(
                        label = %label,
                        "port-forward exited; run 'stackctl forward' to reopen it"
                    );
                }
                if sessions.is_empty() {
                    bail!("every port-forward has exited");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

pub fn print_pipeline_report(report: &PipelineReport) {
    let rows = report
        .stages
        .iter()
        .map(|s| {
            let readiness = match &s.readiness {
                ReadinessOutcome::NotRequired => "-".to_string(),
                ReadinessOutcome::Skipped => "skipped (dry run)".to_string(),
                ReadinessOutcome::Ready { waited_ms } => format!("ready ({}s)", waited_ms / 1000),
                ReadinessOutcome::TimedOut { waited_ms } => {
                    format!("NOT READY after {}s", waited_ms / 1000)
                }
            };
            vec![s.name.clone(), readiness]
        })
        .collect();
    print_table(&["STAGE", "READINESS"], rows);

    let timed_out: Vec<&str> = report.timed_out().collect();
    if !timed_out.is_empty() {
        println!(
            "\nwarning: {} did not become ready; the stack may still be starting",
            timed_out.join(", ")
        );
    }
}
