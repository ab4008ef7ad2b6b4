use anyhow::{bail, Context, Result};
use stackctl_core::config::{parse_duration, Environment};
use stackctl_core::pipeline::StageContext;
use stackctl_core::rollout::{deploy_and_expose, Rollout};
use stackctl_core::stack::{self, DeployOptions};
use stackctl_core::tools;
use std::path::Path;

use super::{interrupted, keep_open, load_config, print_pipeline_report, runtime, Clients};

pub struct DeployArgs {
    pub environment: Environment,
    pub dry_run: bool,
    pub upgrade: bool,
    pub timeout: Option<String>,
    pub no_forward: bool,
}

pub fn run(config: Option<&Path>, args: DeployArgs) -> Result<()> {
    let cfg = load_config(config)?;
    let env = args.environment;

    // Prerequisites, all before the first stage.
    tools::require(&tools::required_for_deploy(env))?;
    let values = cfg.overlay_path(env)?;
    let timeout = args
        .timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .context("--timeout")?;

    let clients = Clients::connect(&cfg, env)?;
    let opts = DeployOptions {
        environment: env,
        values,
        upgrade: args.upgrade,
        timeout,
    };
    let pipeline = stack::deploy_pipeline(&cfg, &opts, &clients.collab)?;

    runtime()?.block_on(async {
        if !env.provisions_cluster() {
            clients.collab.cluster.cluster_reachable().await?;
        }

        let ctx = StageContext {
            dry_run: args.dry_run,
        };
        let mut sessions = clients.sessions();
        let rollout = deploy_and_expose(
            &cfg,
            &pipeline,
            clients.collab.cluster.as_ref(),
            &ctx,
            !args.no_forward,
            &mut sessions,
            interrupted(),
        )
        .await?;

        let report = match rollout {
            Rollout::Complete(report) => report,
            Rollout::Interrupted(report) => {
                if let Some(report) = &report {
                    print_pipeline_report(report);
                }
                bail!("interrupted; completed stages are left in place");
            }
        };
        print_pipeline_report(&report);

        if args.dry_run {
            println!("\nDry run complete; nothing was changed.");
            return Ok(());
        }
        println!("\nDeployed '{}' to {env} (namespace '{}').", cfg.release, cfg.namespace);
        if sessions.is_empty() {
            return Ok(());
        }
        println!();
        keep_open(&mut sessions).await
    })
}
