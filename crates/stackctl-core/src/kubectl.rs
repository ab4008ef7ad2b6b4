use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::cluster::{ApplyOutcome, ClusterApi, ResourceSelector};
use crate::error::{Result, StackError};
use crate::exec;
use crate::tools::Tool;

/// Objects the control plane creates in every namespace. They never count as
/// "left behind" when deciding whether a namespace is empty.
const IMPLICIT_OBJECTS: &[&str] = &[
    "configmap/kube-root-ca.crt",
    "serviceaccount/default",
];

/// Listable kinds that are noise for the emptiness check.
const IGNORED_KINDS: &[&str] = &["events", "events.events.k8s.io"];

/// [`ClusterApi`] backed by the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
    context: Option<String>,
}

impl Kubectl {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            context: None,
        }
    }

    /// Find kubectl on PATH.
    pub fn locate() -> Result<Self> {
        Ok(Self::new(Tool::Kubectl.locate()?))
    }

    /// Pin every call to a kube context instead of the current one.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(rest.len() + 2);
        if let Some(ctx) = &self.context {
            args.push("--context");
            args.push(ctx.as_str());
        }
        args.extend_from_slice(rest);
        args
    }

    async fn current_context(&self) -> String {
        if let Some(ctx) = &self.context {
            return ctx.clone();
        }
        exec::run(&self.binary, ["config", "current-context"])
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "<unset>".to_string())
    }

    async fn listable_kinds(&self) -> Result<Vec<String>> {
        let out = exec::run(
            &self.binary,
            self.args(&["api-resources", "--verbs=list", "--namespaced", "-o", "name"]),
        )
        .await?;
        Ok(filter_listable_kinds(&exec::lines(&out)))
    }
}

#[async_trait]
impl ClusterApi for Kubectl {
    async fn cluster_reachable(&self) -> Result<()> {
        let out = exec::output(
            &self.binary,
            self.args(&["cluster-info", "--request-timeout=10s"]),
        )
        .await?;
        if out.status.success() {
            return Ok(());
        }
        let detail = String::from_utf8_lossy(&out.stderr)
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("kubectl cluster-info failed")
            .to_string();
        Err(StackError::ClusterUnreachable {
            context: self.current_context().await,
            detail,
        })
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let out = exec::run(
            &self.binary,
            self.args(&["get", "namespace", namespace, "-o", "name", "--ignore-not-found"]),
        )
        .await?;
        Ok(!out.trim().is_empty())
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        let out = exec::output(&self.binary, self.args(&["create", "namespace", namespace])).await?;
        if out.status.success() {
            return Ok(());
        }
        // Lost a race with another creator; the namespace is there either way.
        if String::from_utf8_lossy(&out.stderr).contains("AlreadyExists") {
            return Ok(());
        }
        Err(exec::failure(&self.binary, &out))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        exec::run(
            &self.binary,
            self.args(&["delete", "namespace", namespace, "--ignore-not-found", "--wait=true"]),
        )
        .await?;
        Ok(())
    }

    async fn apply_resource_set(
        &self,
        source: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<ApplyOutcome> {
        let mut rest = vec!["apply", "-f", source, "-o", "name"];
        if Path::new(source).is_dir() {
            rest.push("--recursive");
        }
        if let Some(ns) = namespace {
            rest.push("-n");
            rest.push(ns);
        }
        if dry_run {
            rest.push("--dry-run=client");
        }
        let out = exec::output(&self.binary, self.args(&rest)).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Ok(ApplyOutcome::Rejected(stderr));
        }
        let applied = exec::lines(&String::from_utf8_lossy(&out.stdout));
        Ok(ApplyOutcome::Accepted(applied))
    }

    async fn get_resources_by_selector(
        &self,
        namespace: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<String>> {
        let out = exec::run(
            &self.binary,
            self.args(&["get", kind, "-n", namespace, "-l", label_selector, "-o", "name"]),
        )
        .await?;
        Ok(exec::lines(&out))
    }

    async fn delete_resource(&self, namespace: &str, resource: &str) -> Result<()> {
        exec::run(
            &self.binary,
            self.args(&["delete", resource, "-n", namespace, "--ignore-not-found"]),
        )
        .await?;
        Ok(())
    }

    async fn resource_condition_true(&self, selector: &ResourceSelector) -> Result<bool> {
        let out = exec::run(
            &self.binary,
            self.args(&[
                "get",
                &selector.kind,
                "-n",
                &selector.namespace,
                "-l",
                &selector.label_selector,
                "-o",
                "json",
            ]),
        )
        .await?;
        let list: Value = serde_json::from_str(&out)?;
        Ok(conditions_true(&list, &selector.condition))
    }

    async fn resource_count(&self, namespace: &str) -> Result<usize> {
        let kinds = self.listable_kinds().await?.join(",");
        let out = exec::run(
            &self.binary,
            self.args(&["get", &kinds, "-n", namespace, "-o", "name", "--ignore-not-found"]),
        )
        .await?;
        Ok(count_user_resources(&exec::lines(&out)))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Evaluate a `kubectl get -o json` list: true when it has at least one item
/// and every item has `status.conditions[type == condition].status == "True"`.
pub fn conditions_true(list: &Value, condition: &str) -> bool {
    let Some(items) = list.get("items").and_then(Value::as_array) else {
        return false;
    };
    if items.is_empty() {
        return false;
    }
    items.iter().all(|item| {
        item.pointer("/status/conditions")
            .and_then(Value::as_array)
            .map(|conds| {
                conds.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some(condition)
                        && c.get("status").and_then(Value::as_str) == Some("True")
                })
            })
            .unwrap_or(false)
    })
}

pub fn filter_listable_kinds(kinds: &[String]) -> Vec<String> {
    kinds
        .iter()
        .filter(|k| !IGNORED_KINDS.contains(&k.as_str()))
        .cloned()
        .collect()
}

/// Count `kind/name` lines, skipping the objects every namespace starts with.
pub fn count_user_resources(names: &[String]) -> usize {
    names
        .iter()
        .filter(|n| !IMPLICIT_OBJECTS.contains(&n.as_str()))
        .count()
}
