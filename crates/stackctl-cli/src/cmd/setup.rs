use anyhow::Result;
use stackctl_core::config::Environment;
use stackctl_core::pipeline::StageContext;
use stackctl_core::stack::{self, DeployOptions};
use stackctl_core::tools;
use std::path::{Path, PathBuf};

use super::{load_config, print_pipeline_report, runtime, Clients};

/// Provision the cluster (local only) and install the ingress controller.
pub fn run(config: Option<&Path>, environment: Environment) -> Result<()> {
    let cfg = load_config(config)?;
    tools::require(&tools::required_for_deploy(environment))?;

    let clients = Clients::connect(&cfg, environment)?;
    let opts = DeployOptions {
        environment,
        // The app stage is not part of setup, so no overlay is read.
        values: PathBuf::new(),
        upgrade: false,
        timeout: None,
    };
    let pipeline = stack::setup_pipeline(&cfg, &opts, &clients.collab)?;

    runtime()?.block_on(async {
        if !environment.provisions_cluster() {
            clients.collab.cluster.cluster_reachable().await?;
        }
        let ctx = StageContext { dry_run: false };
        let report = tokio::select! {
            res = pipeline.run(clients.collab.cluster.as_ref(), &ctx) => res?,
            _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted"),
        };
        print_pipeline_report(&report);
        println!("\nCluster '{}' is ready for 'stackctl deploy'.", cfg.cluster.name);
        Ok(())
    })
}
