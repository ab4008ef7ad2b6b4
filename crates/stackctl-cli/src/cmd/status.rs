use anyhow::Result;
use serde::Serialize;
use stackctl_core::config::{Config, Environment};
use stackctl_core::state::DeploymentState;
use stackctl_core::tools;
use std::path::Path;

use super::{load_config, runtime, Clients};
use crate::output::{print_json, print_table};

#[derive(Serialize)]
struct StatusReport {
    environment: Environment,
    context: Option<String>,
    reachable: bool,
    release: String,
    namespace: String,
    /// `None` when the cluster could not be asked.
    installed: Option<bool>,
    resource_count: Option<usize>,
    forwards: Vec<ForwardRow>,
}

#[derive(Serialize)]
struct ForwardRow {
    label: String,
    target: String,
    namespace: String,
    local_port: u16,
    remote_port: u16,
}

pub fn run(config: Option<&Path>, environment: Environment, json: bool) -> Result<()> {
    let cfg = load_config(config)?;
    tools::require(&tools::required_for_deploy(environment))?;
    let clients = Clients::connect(&cfg, environment)?;

    let report = runtime()?.block_on(async {
        let cluster = clients.collab.cluster.as_ref();
        let mut report = StatusReport {
            environment,
            context: clients.context.clone(),
            reachable: false,
            release: cfg.release.clone(),
            namespace: cfg.namespace.clone(),
            installed: None,
            resource_count: None,
            forwards: forward_rows(&cfg),
        };

        if let Err(e) = cluster.cluster_reachable().await {
            tracing::warn!("{e}");
            return Ok::<_, anyhow::Error>(report);
        }
        report.reachable = true;

        let state = DeploymentState::new(cluster, clients.collab.releases.as_ref());
        report.installed = Some(state.exists(&cfg.release, &cfg.namespace).await?);
        report.resource_count = Some(state.resource_count(&cfg.namespace).await?);
        Ok(report)
    })?;

    if json {
        return print_json(&report);
    }

    let unknown = || "unknown".to_string();
    print_table(
        &["FIELD", "VALUE"],
        vec![
            vec!["environment".into(), report.environment.to_string()],
            vec![
                "context".into(),
                report.context.clone().unwrap_or_else(|| "(current)".into()),
            ],
            vec![
                "cluster".into(),
                (if report.reachable { "reachable" } else { "unreachable" }).to_string(),
            ],
            vec![
                "release".into(),
                match report.installed {
                    Some(true) => format!("{} (installed)", report.release),
                    Some(false) => format!("{} (not installed)", report.release),
                    None => unknown(),
                },
            ],
            vec![
                "namespace".into(),
                match report.resource_count {
                    Some(n) => format!("{} ({n} resources)", report.namespace),
                    None => unknown(),
                },
            ],
        ],
    );

    if !report.forwards.is_empty() {
        println!();
        let rows = report
            .forwards
            .iter()
            .map(|f| {
                vec![
                    f.label.clone(),
                    format!("localhost:{}", f.local_port),
                    format!("{}:{}", f.target, f.remote_port),
                    f.namespace.clone(),
                ]
            })
            .collect();
        print_table(&["FORWARD", "LOCAL", "TARGET", "NAMESPACE"], rows);
    }
    Ok(())
}

fn forward_rows(cfg: &Config) -> Vec<ForwardRow> {
    cfg.forwards
        .iter()
        .map(|f| ForwardRow {
            label: f.label.clone(),
            target: f.target.clone(),
            namespace: cfg.forward_namespace(f).to_string(),
            local_port: f.local_port,
            remote_port: f.remote_port,
        })
        .collect()
}
