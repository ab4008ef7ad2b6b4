//! The dependency sequencer: a strictly ordered list of stages, each run only
//! after its predecessor's action returned and its readiness wait finished.
//!
//! Actions must be idempotent. A failed action halts the pipeline without
//! rolling anything back; re-running the whole pipeline is the recovery path.
//! A readiness timeout is recorded as a warning and the pipeline moves on,
//! unless the stage's policy is [`TimeoutPolicy::Abort`].

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cluster::ClusterApi;
use crate::config::{format_duration, TimeoutPolicy};
use crate::error::{Result, StackError};
use crate::readiness::{wait_until_ready, Readiness, ReadinessSpec};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Per-run switches handed to every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageContext {
    pub dry_run: bool,
}

#[async_trait]
pub trait StageAction: Send + Sync {
    async fn run(&self, ctx: &StageContext) -> Result<()>;
}

pub struct Stage {
    pub name: String,
    /// Name of the stage that must complete first; `None` only for the head.
    pub precondition: Option<String>,
    pub action: Arc<dyn StageAction>,
    pub readiness: Option<ReadinessSpec>,
}

impl Stage {
    pub fn new(name: impl Into<String>, action: Arc<dyn StageAction>) -> Self {
        Self {
            name: name.into(),
            precondition: None,
            action,
            readiness: None,
        }
    }

    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.precondition = Some(predecessor.into());
        self
    }

    pub fn with_readiness(mut self, spec: Option<ReadinessSpec>) -> Self {
        self.readiness = spec;
        self
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("precondition", &self.precondition)
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    NotRequired,
    /// Dry runs never wait.
    Skipped,
    Ready { waited_ms: u64 },
    TimedOut { waited_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub name: String,
    pub readiness: ReadinessOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageOutcome>,
}

impl PipelineReport {
    /// True when some stage finished without its readiness condition holding.
    pub fn has_warnings(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s.readiness, ReadinessOutcome::TimedOut { .. }))
    }

    pub fn timed_out(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().filter_map(|s| match s.readiness {
            ReadinessOutcome::TimedOut { .. } => Some(s.name.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("stage '{at}' failed")]
pub struct PipelineFailure {
    pub at: String,
    #[source]
    pub cause: StackError,
    /// Stages that completed before the failure; they are left in place.
    pub completed: Vec<StageOutcome>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Validate that `stages` form a single chain: unique names, the head has
    /// no precondition, and every other stage names the one before it.
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut prev: Option<&str> = None;
        for stage in &stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(StackError::InvalidConfig(format!(
                    "duplicate stage '{}'",
                    stage.name
                )));
            }
            if stage.precondition.as_deref() != prev {
                return Err(StackError::InvalidConfig(format!(
                    "stage '{}' must run after {}, not {}",
                    stage.name,
                    prev.map(|p| format!("'{p}'")).unwrap_or_else(|| "nothing".into()),
                    stage
                        .precondition
                        .as_deref()
                        .map(|p| format!("'{p}'"))
                        .unwrap_or_else(|| "nothing".into()),
                )));
            }
            prev = Some(stage.name.as_str());
        }
        Ok(Self { stages })
    }

    /// Chain `stages` in the order given, filling in each precondition.
    pub fn chain(stages: Vec<Stage>) -> Result<Self> {
        let mut prev: Option<String> = None;
        let linked = stages
            .into_iter()
            .map(|mut s| {
                s.precondition = prev.replace(s.name.clone());
                s
            })
            .collect();
        Self::new(linked)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Keep only the stages up to and including `last`.
    pub fn truncate_after(mut self, last: &str) -> Self {
        if let Some(idx) = self.stages.iter().position(|s| s.name == last) {
            self.stages.truncate(idx + 1);
        }
        self
    }

    pub async fn run(
        &self,
        cluster: &dyn ClusterApi,
        ctx: &StageContext,
    ) -> std::result::Result<PipelineReport, PipelineFailure> {
        let mut report = PipelineReport::default();

        for stage in &self.stages {
            tracing::info!(stage = %stage.name, "stage started");
            let started = Instant::now();

            if let Err(cause) = stage.action.run(ctx).await {
                tracing::error!(stage = %stage.name, error = %cause, "stage failed");
                return Err(PipelineFailure {
                    at: stage.name.clone(),
                    cause,
                    completed: report.stages,
                });
            }

            let readiness = match &stage.readiness {
                None => ReadinessOutcome::NotRequired,
                Some(_) if ctx.dry_run => ReadinessOutcome::Skipped,
                Some(spec) => {
                    tracing::info!(
                        stage = %stage.name,
                        selector = %spec.selector,
                        timeout = %format_duration(spec.timeout),
                        "waiting for readiness"
                    );
                    match wait_until_ready(cluster, spec).await {
                        Readiness::Ready { elapsed, .. } => ReadinessOutcome::Ready {
                            waited_ms: as_millis(elapsed),
                        },
                        Readiness::TimedOut { elapsed, .. } => {
                            if spec.on_timeout == TimeoutPolicy::Abort {
                                tracing::error!(stage = %stage.name, "readiness timed out");
                                return Err(PipelineFailure {
                                    at: stage.name.clone(),
                                    cause: StackError::NotReady {
                                        selector: spec.selector.to_string(),
                                        timeout: format_duration(spec.timeout),
                                    },
                                    completed: report.stages,
                                });
                            }
                            tracing::warn!(
                                stage = %stage.name,
                                selector = %spec.selector,
                                "not ready after {}; continuing",
                                format_duration(spec.timeout)
                            );
                            ReadinessOutcome::TimedOut {
                                waited_ms: as_millis(elapsed),
                            }
                        }
                    }
                }
            };

            tracing::info!(
                stage = %stage.name,
                took_ms = as_millis(started.elapsed()),
                "stage complete"
            );
            report.stages.push(StageOutcome {
                name: stage.name.clone(),
                readiness,
            });
        }

        Ok(report)
    }
}

fn as_millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
