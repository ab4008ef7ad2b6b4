//! Deploy, then expose. Forwards open only after every pipeline stage has
//! finished, and an interrupted rollout never leaves a session running.

use std::future::Future;

use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::pipeline::{Pipeline, PipelineFailure, PipelineReport, StageContext};
use crate::session::{ForwardTarget, SessionError, SessionManager};

#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error(transparent)]
    Pipeline(#[from] PipelineFailure),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug)]
pub enum Rollout {
    /// Every stage finished. Sessions are open if forwarding was requested.
    Complete(PipelineReport),
    /// Cancelled. Completed stages stay in place; no session is left open.
    /// The report is present when cancellation came while opening forwards.
    Interrupted(Option<PipelineReport>),
}

/// How far [`open_forwards`] got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    All,
    Cancelled,
}

/// Open a session for every configured forward, in config order. On a failed
/// open or when `cancel` completes, every session opened so far is closed.
pub async fn open_forwards<F>(
    cfg: &Config,
    sessions: &mut SessionManager,
    cancel: F,
) -> Result<Opened, SessionError>
where
    F: Future<Output = ()>,
{
    let outcome = tokio::select! {
        res = open_each(cfg, sessions) => Some(res),
        _ = cancel => None,
    };

    match outcome {
        Some(Ok(())) => Ok(Opened::All),
        Some(Err(e)) => {
            let closed = sessions.close_all().await;
            tracing::debug!(closed, "closed sessions after a failed forward");
            Err(e)
        }
        None => {
            let closed = sessions.close_all().await;
            tracing::info!(closed, "forwarding interrupted; sessions closed");
            Ok(Opened::Cancelled)
        }
    }
}

async fn open_each(cfg: &Config, sessions: &mut SessionManager) -> Result<(), SessionError> {
    for fwd in &cfg.forwards {
        let target = ForwardTarget {
            namespace: cfg.forward_namespace(fwd).to_string(),
            resource: fwd.target.clone(),
        };
        sessions
            .open(&fwd.label, &target, fwd.local_port, fwd.remote_port)
            .await?;
    }
    Ok(())
}

/// Run `pipeline`, then open the configured forwards when `forward` is set
/// and this is not a dry run. `cancel` is honoured in both phases.
pub async fn deploy_and_expose<F>(
    cfg: &Config,
    pipeline: &Pipeline,
    cluster: &dyn ClusterApi,
    ctx: &StageContext,
    forward: bool,
    sessions: &mut SessionManager,
    cancel: F,
) -> Result<Rollout, RolloutError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(cancel);

    let report = tokio::select! {
        res = pipeline.run(cluster, ctx) => res?,
        _ = &mut cancel => {
            tracing::warn!("rollout interrupted; completed stages are left in place");
            return Ok(Rollout::Interrupted(None));
        }
    };

    if ctx.dry_run || !forward || cfg.forwards.is_empty() {
        return Ok(Rollout::Complete(report));
    }

    match open_forwards(cfg, sessions, &mut cancel).await? {
        Opened::All => Ok(Rollout::Complete(report)),
        Opened::Cancelled => Ok(Rollout::Interrupted(Some(report))),
    }
}
