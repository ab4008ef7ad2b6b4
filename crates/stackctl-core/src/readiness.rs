//! Readiness probing: poll a cluster condition at a fixed interval until it
//! holds or a wall-clock deadline passes.
//!
//! There is no backoff and no retry budget; the deadline is the only bound.
//! A timeout is an outcome, not an error, so callers decide whether to carry
//! on. Dropping the future returned by [`wait_until_ready`] cancels the wait.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::cluster::{ClusterApi, ResourceSelector};
use crate::config::{ReadinessConfig, TimeoutPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessSpec {
    pub selector: ResourceSelector,
    pub timeout: Duration,
    pub poll_interval: Duration,
    #[serde(skip)]
    pub on_timeout: TimeoutPolicy,
}

impl ReadinessSpec {
    pub fn new(selector: ResourceSelector, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            selector,
            timeout,
            poll_interval,
            on_timeout: TimeoutPolicy::Warn,
        }
    }

    pub fn from_config(namespace: &str, cfg: &ReadinessConfig, poll_interval: Duration) -> Self {
        Self {
            selector: ResourceSelector::from_config(namespace, cfg),
            timeout: cfg.timeout,
            poll_interval,
            on_timeout: cfg.on_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Readiness {
    Ready {
        #[serde(with = "millis")]
        elapsed: Duration,
        polls: u32,
    },
    TimedOut {
        #[serde(with = "millis")]
        elapsed: Duration,
        polls: u32,
    },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

/// Poll `spec.selector` every `spec.poll_interval` until its condition holds
/// or `spec.timeout` elapses.
///
/// The last sleep is clamped to the time remaining, so a condition that never
/// holds yields [`Readiness::TimedOut`] no earlier than the timeout and less
/// than one poll interval after it. A poll whose query fails counts as not
/// ready. A timeout too large to represent as an instant never expires.
pub async fn wait_until_ready(cluster: &dyn ClusterApi, spec: &ReadinessSpec) -> Readiness {
    let start = Instant::now();
    let deadline = start.checked_add(spec.timeout);
    let mut polls = 0u32;

    loop {
        polls += 1;
        match cluster.resource_condition_true(&spec.selector).await {
            Ok(true) => {
                return Readiness::Ready {
                    elapsed: start.elapsed(),
                    polls,
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(selector = %spec.selector, error = %e, "readiness poll failed")
            }
        }

        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => {
                return Readiness::TimedOut {
                    elapsed: now - start,
                    polls,
                };
            }
            Some(deadline) => spec.poll_interval.min(deadline - now),
            None => spec.poll_interval,
        };
        tokio::time::sleep(pause).await;
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
