//! In-memory stand-ins for the cluster, the release manager and the
//! provisioner, shared by the unit tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::cluster::{ApplyOutcome, ClusterApi, ResourceSelector};
use crate::error::{Result, StackError};
use crate::provision::Provisioner;
use crate::release::{
    ReleaseInfo, ReleaseManager, ReleaseRequest, ReleaseStatus, UninstallOutcome,
};

fn command_failed(program: &str, stderr: &str) -> StackError {
    StackError::CommandFailed {
        program: program.to_string(),
        status: "exit 1".to_string(),
        stderr: stderr.to_string(),
    }
}

// ---------------------------------------------------------------------------
// FakeCluster
// ---------------------------------------------------------------------------

struct ClusterState {
    reachable: bool,
    namespaces: BTreeMap<String, BTreeSet<String>>,
    ready_after: HashMap<String, u32>,
    polls: HashMap<String, u32>,
    rejects: Vec<(String, String)>,
    failing_deletes: HashSet<String>,
    deleted: Vec<String>,
}

pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                reachable: true,
                namespaces: BTreeMap::new(),
                ready_after: HashMap::new(),
                polls: HashMap::new(),
                rejects: Vec::new(),
                failing_deletes: HashSet::new(),
                deleted: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// The condition for `label_selector` holds from the `polls`-th probe on.
    pub fn ready_after(&self, label_selector: &str, polls: u32) {
        self.lock().ready_after.insert(label_selector.to_string(), polls);
    }

    pub fn polls(&self, label_selector: &str) -> u32 {
        self.lock().polls.get(label_selector).copied().unwrap_or(0)
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.lock().namespaces.entry(namespace.to_string()).or_default();
    }

    pub fn add_resource(&self, namespace: &str, resource: &str) {
        self.lock()
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(resource.to_string());
    }

    pub fn remove_resource(&self, namespace: &str, resource: &str) {
        if let Some(set) = self.lock().namespaces.get_mut(namespace) {
            set.remove(resource);
        }
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.lock().namespaces.contains_key(namespace)
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.lock().namespaces.clone()
    }

    /// Reject any apply whose source contains `pattern`.
    pub fn reject_apply(&self, pattern: &str, reason: &str) {
        self.lock()
            .rejects
            .push((pattern.to_string(), reason.to_string()));
    }

    pub fn fail_delete(&self, resource: &str) {
        self.lock().failing_deletes.insert(resource.to_string());
    }

    /// Everything deleted so far, as `namespace/<ns>` or `<ns>:<kind/name>`.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.lock().reachable {
            Ok(())
        } else {
            Err(StackError::ClusterUnreachable {
                context: "fake".to_string(),
                detail: "connection refused".to_string(),
            })
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn cluster_reachable(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        self.check_reachable()?;
        Ok(self.has_namespace(namespace))
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        self.check_reachable()?;
        self.add_namespace(namespace);
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.check_reachable()?;
        let mut st = self.lock();
        st.namespaces.remove(namespace);
        st.deleted.push(format!("namespace/{namespace}"));
        Ok(())
    }

    async fn apply_resource_set(
        &self,
        source: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<ApplyOutcome> {
        self.check_reachable()?;
        let mut st = self.lock();
        if let Some((_, reason)) = st.rejects.iter().find(|(p, _)| source.contains(p.as_str())) {
            return Ok(ApplyOutcome::Rejected(reason.clone()));
        }
        let name = Path::new(source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.to_string());
        let object = format!("applied/{name}");
        if !dry_run {
            st.namespaces
                .entry(namespace.unwrap_or("default").to_string())
                .or_default()
                .insert(object.clone());
        }
        Ok(ApplyOutcome::Accepted(vec![object]))
    }

    async fn get_resources_by_selector(
        &self,
        namespace: &str,
        kind: &str,
        _label_selector: &str,
    ) -> Result<Vec<String>> {
        self.check_reachable()?;
        let prefix = format!("{kind}/");
        Ok(self
            .lock()
            .namespaces
            .get(namespace)
            .map(|set| set.iter().filter(|r| r.starts_with(&prefix)).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_resource(&self, namespace: &str, resource: &str) -> Result<()> {
        self.check_reachable()?;
        let mut st = self.lock();
        if st.failing_deletes.contains(resource) {
            return Err(command_failed("kubectl", "admission webhook denied the request"));
        }
        if let Some(set) = st.namespaces.get_mut(namespace) {
            set.remove(resource);
        }
        st.deleted.push(format!("{namespace}:{resource}"));
        Ok(())
    }

    async fn resource_condition_true(&self, selector: &ResourceSelector) -> Result<bool> {
        self.check_reachable()?;
        let mut st = self.lock();
        let polls = st
            .polls
            .entry(selector.label_selector.clone())
            .or_insert(0);
        *polls += 1;
        let polls = *polls;
        Ok(st
            .ready_after
            .get(&selector.label_selector)
            .is_some_and(|n| polls >= *n))
    }

    async fn resource_count(&self, namespace: &str) -> Result<usize> {
        self.check_reachable()?;
        Ok(self.lock().namespaces.get(namespace).map_or(0, BTreeSet::len))
    }
}

// ---------------------------------------------------------------------------
// FakeReleases
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ReleaseState {
    installed: BTreeMap<String, BTreeMap<String, ReleaseStatus>>,
    calls: Vec<String>,
    fail_uninstall: bool,
}

/// Installing a release adds `release/<name>` to the linked cluster (if
/// any); uninstalling removes it. Installing over a name that is still held,
/// in any status, fails the way helm does.
#[derive(Default)]
pub struct FakeReleases {
    state: Mutex<ReleaseState>,
    cluster: Option<Arc<FakeCluster>>,
}

impl FakeReleases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked(cluster: Arc<FakeCluster>) -> Self {
        Self {
            state: Mutex::default(),
            cluster: Some(cluster),
        }
    }

    pub fn preinstall(&self, name: &str, namespace: &str) {
        self.preinstall_with_status(name, namespace, ReleaseStatus::Deployed);
    }

    pub fn preinstall_with_status(&self, name: &str, namespace: &str, status: ReleaseStatus) {
        self.state
            .lock()
            .unwrap()
            .installed
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string(), status);
        if let Some(c) = &self.cluster {
            c.add_resource(namespace, &format!("release/{name}"));
        }
    }

    pub fn installed(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .installed
            .get(namespace)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn status(&self, name: &str, namespace: &str) -> Option<ReleaseStatus> {
        self.state
            .lock()
            .unwrap()
            .installed
            .get(namespace)
            .and_then(|s| s.get(name).copied())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_uninstall(&self) {
        self.state.lock().unwrap().fail_uninstall = true;
    }

    fn apply(&self, verb: &str, req: &ReleaseRequest) {
        let mut st = self.state.lock().unwrap();
        if req.dry_run {
            st.calls.push(format!("{verb} {} (dry run)", req.name));
            return;
        }
        st.calls.push(format!("{verb} {}", req.name));
        st.installed
            .entry(req.namespace.clone())
            .or_default()
            .insert(req.name.clone(), ReleaseStatus::Deployed);
        drop(st);
        if let Some(c) = &self.cluster {
            c.add_resource(&req.namespace, &format!("release/{}", req.name));
        }
    }
}

#[async_trait]
impl ReleaseManager for FakeReleases {
    async fn install(&self, req: &ReleaseRequest) -> Result<()> {
        if self.status(&req.name, &req.namespace).is_some() {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(format!("install {} (name in use)", req.name));
            return Err(command_failed(
                "helm",
                "INSTALLATION FAILED: cannot re-use a name that is still in use",
            ));
        }
        self.apply("install", req);
        Ok(())
    }

    async fn upgrade(&self, req: &ReleaseRequest) -> Result<()> {
        if self.status(&req.name, &req.namespace) == Some(ReleaseStatus::PendingChange) {
            return Err(command_failed(
                "helm",
                "UPGRADE FAILED: another operation (install/upgrade/rollback) is in progress",
            ));
        }
        self.apply("upgrade", req);
        Ok(())
    }

    async fn rollback(&self, name: &str, namespace: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("rollback {name}"));
        match st.installed.get_mut(namespace).and_then(|s| s.get_mut(name)) {
            Some(status) => {
                *status = ReleaseStatus::Deployed;
                Ok(())
            }
            None => Err(command_failed("helm", "release: not found")),
        }
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<UninstallOutcome> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("uninstall {name}"));
        if st.fail_uninstall {
            return Err(command_failed("helm", "Kubernetes cluster unreachable"));
        }
        let removed = st
            .installed
            .get_mut(namespace)
            .is_some_and(|set| set.remove(name).is_some());
        drop(st);
        if !removed {
            return Ok(UninstallOutcome::NotFound);
        }
        if let Some(c) = &self.cluster {
            c.remove_resource(namespace, &format!("release/{name}"));
        }
        Ok(UninstallOutcome::Removed)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<ReleaseInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .installed
            .get(namespace)
            .map(|s| {
                s.iter()
                    .map(|(name, status)| ReleaseInfo {
                        name: name.clone(),
                        status: *status,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// FakeProvisioner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProvisionerState {
    clusters: BTreeSet<String>,
    creates: u32,
    deletes: u32,
    fail_delete: bool,
}

#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<ProvisionerState>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preexisting(&self, name: &str) {
        self.state.lock().unwrap().clusters.insert(name.to_string());
    }

    pub fn exists_now(&self, name: &str) -> bool {
        self.state.lock().unwrap().clusters.contains(name)
    }

    pub fn creates(&self) -> u32 {
        self.state.lock().unwrap().creates
    }

    pub fn deletes(&self) -> u32 {
        self.state.lock().unwrap().deletes
    }

    pub fn fail_delete(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.exists_now(name))
    }

    async fn create(&self, name: &str, _config: Option<&Path>) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.creates += 1;
        st.clusters.insert(name.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_delete {
            return Err(command_failed("kind", "failed to delete nodes"));
        }
        st.deletes += 1;
        st.clusters.remove(name);
        Ok(())
    }

    fn context_for(&self, name: &str) -> String {
        format!("fake-{name}")
    }
}
