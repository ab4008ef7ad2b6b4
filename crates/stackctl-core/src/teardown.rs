//! Reverse-order removal of what a deployment created.
//!
//! Sessions are always stopped first. Removing the cluster ends the teardown
//! early since everything else lives inside it. Otherwise the release, then
//! (optionally) persistent data, then the namespace, which is only deleted
//! when nothing is left in it.

use serde::Serialize;
use std::fmt;

use crate::config::Config;
use crate::session::SessionManager;
use crate::stack::Collaborators;
use crate::release::UninstallOutcome;
use crate::state::DeploymentState;

const PVC_KIND: &str = "persistentvolumeclaim";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    StopSessions,
    RemoveCluster,
    RemoveRelease,
    RemovePersistentData,
    RemoveNamespace,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TeardownStep::StopSessions => "stop sessions",
            TeardownStep::RemoveCluster => "remove cluster",
            TeardownStep::RemoveRelease => "remove release",
            TeardownStep::RemovePersistentData => "remove persistent data",
            TeardownStep::RemoveNamespace => "remove namespace",
        };
        f.write_str(s)
    }
}

/// What the user asked `cleanup` to do. `remove_cluster` supersedes the
/// per-resource steps.
#[derive(Debug, Clone, Copy)]
pub struct TeardownPlan {
    pub remove_release: bool,
    pub remove_persistent_data: bool,
    pub remove_cluster: bool,
    pub force: bool,
}

impl Default for TeardownPlan {
    fn default() -> Self {
        Self {
            remove_release: true,
            remove_persistent_data: false,
            remove_cluster: false,
            force: false,
        }
    }
}

impl TeardownPlan {
    /// Destructive steps ask first unless forced. Stopping sessions and
    /// removing an already-empty namespace never ask.
    pub fn requires_confirmation(&self, step: TeardownStep) -> bool {
        if self.force {
            return false;
        }
        matches!(
            step,
            TeardownStep::RemoveCluster
                | TeardownStep::RemoveRelease
                | TeardownStep::RemovePersistentData
        )
    }
}

/// Asks the operator a yes/no question.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Done,
    Skipped,
    Declined,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: TeardownStep,
    pub status: StepStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub steps: Vec<StepRecord>,
}

impl TeardownReport {
    /// False only when a step that actually ran failed.
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.status != StepStatus::Failed)
    }

    pub fn status_of(&self, step: TeardownStep) -> Option<StepStatus> {
        self.steps.iter().find(|s| s.step == step).map(|s| s.status)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed)
    }

    fn record(&mut self, step: TeardownStep, status: StepStatus, detail: impl Into<String>) {
        let detail = detail.into();
        match status {
            StepStatus::Failed => tracing::error!(%step, "{detail}"),
            StepStatus::Declined => tracing::warn!(%step, "{detail}"),
            _ => tracing::info!(%step, ?status, "{detail}"),
        }
        self.steps.push(StepRecord {
            step,
            status,
            detail,
        });
    }
}

pub struct Teardown<'a> {
    cfg: &'a Config,
    collab: &'a Collaborators,
}

impl<'a> Teardown<'a> {
    pub fn new(cfg: &'a Config, collab: &'a Collaborators) -> Self {
        Self { cfg, collab }
    }

    pub async fn run(
        &self,
        plan: &TeardownPlan,
        sessions: &mut SessionManager,
        confirm: &dyn Confirm,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();

        let closed = sessions.close_all().await;
        sessions.release_ports(&self.cfg.forward_ports()).await;
        report.record(
            TeardownStep::StopSessions,
            StepStatus::Done,
            format!("{closed} tracked session(s) stopped"),
        );

        if plan.remove_cluster {
            self.remove_cluster(plan, confirm, &mut report).await;
            for step in [
                TeardownStep::RemoveRelease,
                TeardownStep::RemovePersistentData,
                TeardownStep::RemoveNamespace,
            ] {
                report.record(step, StepStatus::Skipped, "cluster removal requested");
            }
            return report;
        }

        self.remove_release(plan, confirm, &mut report).await;
        self.remove_persistent_data(plan, confirm, &mut report).await;
        self.remove_namespace(&mut report).await;
        report
    }

    async fn remove_cluster(
        &self,
        plan: &TeardownPlan,
        confirm: &dyn Confirm,
        report: &mut TeardownReport,
    ) {
        let step = TeardownStep::RemoveCluster;
        let name = &self.cfg.cluster.name;
        let provisioner = &self.collab.provisioner;

        match provisioner.exists(name).await {
            Ok(false) => {
                report.record(step, StepStatus::Skipped, format!("cluster '{name}' not found"));
                return;
            }
            Err(e) => {
                report.record(step, StepStatus::Failed, e.to_string());
                return;
            }
            Ok(true) => {}
        }

        if plan.requires_confirmation(step)
            && !confirm.confirm(&format!("Delete cluster '{name}' and everything in it?"))
        {
            report.record(step, StepStatus::Declined, "declined");
            return;
        }

        match provisioner.delete(name).await {
            Ok(()) => report.record(step, StepStatus::Done, format!("cluster '{name}' deleted")),
            Err(e) => report.record(step, StepStatus::Failed, e.to_string()),
        }
    }

    async fn remove_release(
        &self,
        plan: &TeardownPlan,
        confirm: &dyn Confirm,
        report: &mut TeardownReport,
    ) {
        let step = TeardownStep::RemoveRelease;
        if !plan.remove_release {
            report.record(step, StepStatus::Skipped, "not requested");
            return;
        }
        let release = &self.cfg.release;
        let namespace = &self.cfg.namespace;
        let state = DeploymentState::new(
            self.collab.cluster.as_ref(),
            self.collab.releases.as_ref(),
        );

        match state.exists(release, namespace).await {
            Ok(false) => {
                let detail = format!("release '{release}' not installed");
                report.record(step, StepStatus::Skipped, detail);
                return;
            }
            Err(e) => {
                report.record(step, StepStatus::Failed, e.to_string());
                return;
            }
            Ok(true) => {}
        }

        if plan.requires_confirmation(step)
            && !confirm.confirm(&format!("Uninstall release '{release}' from '{namespace}'?"))
        {
            report.record(step, StepStatus::Declined, "declined");
            return;
        }

        match self.collab.releases.uninstall(release, namespace).await {
            Ok(UninstallOutcome::Removed) => {
                let detail = format!("release '{release}' uninstalled");
                report.record(step, StepStatus::Done, detail)
            }
            Ok(UninstallOutcome::NotFound) => {
                let detail = format!("release '{release}' already gone");
                report.record(step, StepStatus::Skipped, detail)
            }
            Err(e) => report.record(step, StepStatus::Failed, e.to_string()),
        }
    }

    async fn remove_persistent_data(
        &self,
        plan: &TeardownPlan,
        confirm: &dyn Confirm,
        report: &mut TeardownReport,
    ) {
        let step = TeardownStep::RemovePersistentData;
        if !plan.remove_persistent_data {
            report.record(step, StepStatus::Skipped, "not requested (pass --remove-pvc)");
            return;
        }

        let namespace = &self.cfg.namespace;
        let selector = self.cfg.persistent_data_selector();
        let cluster = &self.collab.cluster;

        let claims = match cluster.namespace_exists(namespace).await {
            Ok(false) => Vec::new(),
            Ok(true) => match cluster
                .get_resources_by_selector(namespace, PVC_KIND, &selector)
                .await
            {
                Ok(claims) => claims,
                Err(e) => {
                    report.record(step, StepStatus::Failed, e.to_string());
                    return;
                }
            },
            Err(e) => {
                report.record(step, StepStatus::Failed, e.to_string());
                return;
            }
        };

        if claims.is_empty() {
            report.record(step, StepStatus::Skipped, format!("no claims match {selector}"));
            return;
        }

        if plan.requires_confirmation(step)
            && !confirm.confirm(&format!(
                "Delete {} persistent volume claim(s) in '{namespace}'? Data will be lost.",
                claims.len()
            ))
        {
            report.record(step, StepStatus::Declined, "declined");
            return;
        }

        let mut errors = Vec::new();
        for claim in &claims {
            if let Err(e) = cluster.delete_resource(namespace, claim).await {
                errors.push(format!("{claim}: {e}"));
            }
        }
        if errors.is_empty() {
            report.record(
                step,
                StepStatus::Done,
                format!("{} claim(s) deleted", claims.len()),
            );
        } else {
            report.record(step, StepStatus::Failed, errors.join("; "));
        }
    }

    async fn remove_namespace(&self, report: &mut TeardownReport) {
        let step = TeardownStep::RemoveNamespace;
        let namespace = &self.cfg.namespace;
        let cluster = &self.collab.cluster;

        match cluster.namespace_exists(namespace).await {
            Ok(false) => {
                let detail = format!("namespace '{namespace}' not found");
                report.record(step, StepStatus::Skipped, detail);
                return;
            }
            Err(e) => {
                report.record(step, StepStatus::Failed, e.to_string());
                return;
            }
            Ok(true) => {}
        }

        let state = DeploymentState::new(cluster.as_ref(), self.collab.releases.as_ref());
        match state.resource_count(namespace).await {
            Ok(0) => match cluster.delete_namespace(namespace).await {
                Ok(()) => {
                    let detail = format!("namespace '{namespace}' deleted");
                    report.record(step, StepStatus::Done, detail)
                }
                Err(e) => report.record(step, StepStatus::Failed, e.to_string()),
            },
            Ok(n) => {
                tracing::warn!(
                    namespace = %namespace,
                    remaining = n,
                    "namespace not empty; leaving it in place"
                );
                report.record(
                    step,
                    StepStatus::Skipped,
                    format!("namespace '{namespace}' still holds {n} resource(s)"),
                );
            }
            Err(e) => report.record(step, StepStatus::Failed, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE;
    use crate::release::ReleaseStatus;
    use crate::session::{ForwardTarget, Launcher};
    use crate::testing::{FakeCluster, FakeProvisioner, FakeReleases};
    use std::cell::RefCell;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::process::Command;

    const STACK: &str = r#"
release: shop
namespace: shop
chart: ./chart
cluster:
  name: shop-local
environments:
  local: values/local.yaml
forwards:
  - label: kibana
    target: svc/kibana
    local_port: 5601
    remote_port: 5601
"#;

    struct NoLaunch;

    impl Launcher for NoLaunch {
        fn command(&self, _t: &ForwardTarget, _l: u16, _r: u16) -> Command {
            Command::new("true")
        }

        fn ready_marker(&self) -> Option<&str> {
            None
        }
    }

    /// Answers prompts from a script and remembers what was asked.
    struct Scripted {
        answer: bool,
        asked: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn answering(answer: bool) -> Self {
            Self {
                answer,
                asked: RefCell::new(Vec::new()),
            }
        }

        fn asked(&self) -> usize {
            self.asked.borrow().len()
        }
    }

    impl Confirm for Scripted {
        fn confirm(&self, prompt: &str) -> bool {
            self.asked.borrow_mut().push(prompt.to_string());
            self.answer
        }
    }

    struct Harness {
        _dir: TempDir,
        cfg: Config,
        cluster: Arc<FakeCluster>,
        releases: Arc<FakeReleases>,
        provisioner: Arc<FakeProvisioner>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join(CONFIG_FILE);
            std::fs::write(&path, STACK).unwrap();
            let cfg = Config::load(&path).unwrap();
            let cluster = Arc::new(FakeCluster::new());
            Self {
                _dir: dir,
                cfg,
                releases: Arc::new(FakeReleases::linked(Arc::clone(&cluster))),
                cluster,
                provisioner: Arc::new(FakeProvisioner::new()),
            }
        }

        fn deployed() -> Self {
            let h = Self::new();
            h.provisioner.preexisting("shop-local");
            h.releases.preinstall("shop", "shop");
            h
        }

        async fn run(&self, plan: TeardownPlan, confirm: &dyn Confirm) -> TeardownReport {
            let collab = Collaborators {
                cluster: self.cluster.clone(),
                releases: self.releases.clone(),
                provisioner: self.provisioner.clone(),
            };
            let mut sessions = SessionManager::new(Box::new(NoLaunch)).reclaim_os_ports(false);
            Teardown::new(&self.cfg, &collab)
                .run(&plan, &mut sessions, confirm)
                .await
        }
    }

    fn forced() -> TeardownPlan {
        TeardownPlan {
            force: true,
            ..TeardownPlan::default()
        }
    }

    #[test]
    fn confirmation_predicate() {
        let plan = TeardownPlan::default();
        assert!(!plan.requires_confirmation(TeardownStep::StopSessions));
        assert!(plan.requires_confirmation(TeardownStep::RemoveCluster));
        assert!(plan.requires_confirmation(TeardownStep::RemoveRelease));
        assert!(plan.requires_confirmation(TeardownStep::RemovePersistentData));
        assert!(!plan.requires_confirmation(TeardownStep::RemoveNamespace));

        let plan = forced();
        assert!(!plan.requires_confirmation(TeardownStep::RemoveCluster));
        assert!(!plan.requires_confirmation(TeardownStep::RemoveRelease));
    }

    #[tokio::test]
    async fn cleanup_removes_release_then_empty_namespace() {
        let h = Harness::deployed();
        let confirm = Scripted::answering(true);
        let report = h.run(TeardownPlan::default(), &confirm).await;

        assert!(report.succeeded());
        assert_eq!(report.status_of(TeardownStep::StopSessions), Some(StepStatus::Done));
        assert_eq!(report.status_of(TeardownStep::RemoveRelease), Some(StepStatus::Done));
        assert_eq!(
            report.status_of(TeardownStep::RemovePersistentData),
            Some(StepStatus::Skipped)
        );
        assert_eq!(report.status_of(TeardownStep::RemoveNamespace), Some(StepStatus::Done));
        assert_eq!(confirm.asked(), 1);
        assert!(!h.cluster.has_namespace("shop"));
    }

    #[tokio::test]
    async fn namespace_with_leftovers_is_never_deleted() {
        let h = Harness::deployed();
        h.cluster.add_resource("shop", "configmap/operator-notes");
        let report = h.run(forced(), &Scripted::answering(true)).await;

        assert!(report.succeeded());
        assert_eq!(
            report.status_of(TeardownStep::RemoveNamespace),
            Some(StepStatus::Skipped)
        );
        assert!(h.cluster.has_namespace("shop"));
        assert!(!h.cluster.deleted().contains(&"namespace/shop".to_string()));
    }

    #[tokio::test]
    async fn remove_cluster_force_skips_the_rest() {
        let h = Harness::deployed();
        let confirm = Scripted::answering(false);
        let plan = TeardownPlan {
            remove_cluster: true,
            remove_persistent_data: true,
            force: true,
            ..TeardownPlan::default()
        };
        let report = h.run(plan, &confirm).await;

        assert!(report.succeeded());
        let steps: Vec<(TeardownStep, StepStatus)> =
            report.steps.iter().map(|s| (s.step, s.status)).collect();
        assert_eq!(
            steps,
            vec![
                (TeardownStep::StopSessions, StepStatus::Done),
                (TeardownStep::RemoveCluster, StepStatus::Done),
                (TeardownStep::RemoveRelease, StepStatus::Skipped),
                (TeardownStep::RemovePersistentData, StepStatus::Skipped),
                (TeardownStep::RemoveNamespace, StepStatus::Skipped),
            ]
        );
        assert_eq!(confirm.asked(), 0);
        assert_eq!(h.provisioner.deletes(), 1);
        assert!(h.releases.calls().is_empty());
    }

    #[tokio::test]
    async fn declined_release_removal_is_not_a_failure() {
        let h = Harness::deployed();
        let report = h.run(TeardownPlan::default(), &Scripted::answering(false)).await;

        assert!(report.succeeded());
        assert_eq!(
            report.status_of(TeardownStep::RemoveRelease),
            Some(StepStatus::Declined)
        );
        // The release is still there, so the namespace stays.
        assert_eq!(
            report.status_of(TeardownStep::RemoveNamespace),
            Some(StepStatus::Skipped)
        );
        assert_eq!(h.releases.installed("shop"), vec!["shop".to_string()]);
    }

    #[tokio::test]
    async fn kept_release_keeps_its_namespace() {
        let h = Harness::deployed();
        let plan = TeardownPlan {
            remove_release: false,
            force: true,
            ..TeardownPlan::default()
        };
        let report = h.run(plan, &Scripted::answering(true)).await;

        assert!(report.succeeded());
        assert_eq!(report.status_of(TeardownStep::RemoveRelease), Some(StepStatus::Skipped));
        assert_eq!(
            report.status_of(TeardownStep::RemoveNamespace),
            Some(StepStatus::Skipped)
        );
        assert!(h.releases.calls().is_empty());
        assert!(h.cluster.has_namespace("shop"));
    }

    #[tokio::test]
    async fn release_stuck_mid_install_is_removed() {
        let h = Harness::new();
        h.releases.preinstall_with_status("shop", "shop", ReleaseStatus::PendingInstall);
        let report = h.run(TeardownPlan::default(), &Scripted::answering(true)).await;

        assert!(report.succeeded());
        assert_eq!(report.status_of(TeardownStep::RemoveRelease), Some(StepStatus::Done));
        assert_eq!(h.releases.calls(), vec!["uninstall shop"]);
        assert!(h.releases.installed("shop").is_empty());
    }

    #[tokio::test]
    async fn missing_release_and_namespace_are_skipped() {
        let h = Harness::new();
        let confirm = Scripted::answering(true);
        let report = h.run(TeardownPlan::default(), &confirm).await;

        assert!(report.succeeded());
        assert_eq!(report.status_of(TeardownStep::RemoveRelease), Some(StepStatus::Skipped));
        assert_eq!(
            report.status_of(TeardownStep::RemoveNamespace),
            Some(StepStatus::Skipped)
        );
        assert_eq!(confirm.asked(), 0);
    }

    #[tokio::test]
    async fn pvc_failure_is_recorded_and_later_steps_still_run() {
        let h = Harness::deployed();
        h.cluster.add_resource("shop", "persistentvolumeclaim/data-es-0");
        h.cluster.add_resource("shop", "persistentvolumeclaim/data-pg-0");
        h.cluster.fail_delete("persistentvolumeclaim/data-es-0");
        let plan = TeardownPlan {
            remove_persistent_data: true,
            force: true,
            ..TeardownPlan::default()
        };
        let report = h.run(plan, &Scripted::answering(true)).await;

        assert!(!report.succeeded());
        assert_eq!(
            report.status_of(TeardownStep::RemovePersistentData),
            Some(StepStatus::Failed)
        );
        assert!(h
            .cluster
            .deleted()
            .contains(&"shop:persistentvolumeclaim/data-pg-0".to_string()));
        // One claim survived, so the namespace re-check keeps it.
        assert_eq!(
            report.status_of(TeardownStep::RemoveNamespace),
            Some(StepStatus::Skipped)
        );
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test]
    async fn failed_uninstall_does_not_stop_pvc_removal() {
        let h = Harness::deployed();
        h.cluster.add_resource("shop", "persistentvolumeclaim/data-pg-0");
        h.releases.fail_uninstall();
        let plan = TeardownPlan {
            remove_persistent_data: true,
            force: true,
            ..TeardownPlan::default()
        };
        let report = h.run(plan, &Scripted::answering(true)).await;

        assert!(!report.succeeded());
        assert_eq!(report.status_of(TeardownStep::RemoveRelease), Some(StepStatus::Failed));
        assert_eq!(
            report.status_of(TeardownStep::RemovePersistentData),
            Some(StepStatus::Done)
        );
    }

    #[tokio::test]
    async fn declined_cluster_removal_leaves_cluster() {
        let h = Harness::deployed();
        let plan = TeardownPlan {
            remove_cluster: true,
            ..TeardownPlan::default()
        };
        let report = h.run(plan, &Scripted::answering(false)).await;

        assert!(report.succeeded());
        assert_eq!(
            report.status_of(TeardownStep::RemoveCluster),
            Some(StepStatus::Declined)
        );
        assert!(h.provisioner.exists_now("shop-local"));
    }

    #[tokio::test]
    async fn failed_cluster_delete_fails_the_report() {
        let h = Harness::deployed();
        h.provisioner.fail_delete();
        let plan = TeardownPlan {
            remove_cluster: true,
            force: true,
            ..TeardownPlan::default()
        };
        let report = h.run(plan, &Scripted::answering(true)).await;
        assert!(!report.succeeded());
        assert_eq!(report.status_of(TeardownStep::RemoveCluster), Some(StepStatus::Failed));
    }
}
