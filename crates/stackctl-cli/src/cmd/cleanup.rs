use anyhow::{bail, Result};
use dialoguer::theme::ColorfulTheme;
use stackctl_core::config::Environment;
use stackctl_core::teardown::{Confirm, StepStatus, Teardown, TeardownPlan};
use stackctl_core::tools;
use std::path::Path;

use super::{load_config, runtime, Clients};
use crate::output::{print_json, print_table};

pub struct CleanupArgs {
    pub environment: Environment,
    pub remove_cluster: bool,
    pub remove_pvc: bool,
    pub force: bool,
}

/// Terminal yes/no prompt. Anything that cannot prompt (no TTY) declines.
struct Prompt;

impl Confirm for Prompt {
    fn confirm(&self, prompt: &str) -> bool {
        match dialoguer::Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "cannot prompt; treating as declined (pass --force to skip prompts)"
                );
                false
            }
        }
    }
}

pub fn run(config: Option<&Path>, args: CleanupArgs, json: bool) -> Result<()> {
    let cfg = load_config(config)?;
    if args.remove_cluster && !args.environment.provisions_cluster() {
        bail!(
            "--remove-cluster only applies to the local environment; \
             {} clusters are not managed by stackctl",
            args.environment
        );
    }
    tools::require(&tools::required_for_cleanup(args.remove_cluster))?;
    let clients = Clients::connect(&cfg, args.environment)?;

    let plan = TeardownPlan {
        remove_release: true,
        remove_cluster: args.remove_cluster,
        remove_persistent_data: args.remove_pvc,
        force: args.force,
    };

    let report = runtime()?.block_on(async {
        if !plan.remove_cluster {
            clients.collab.cluster.cluster_reachable().await?;
        }
        let mut sessions = clients.sessions();
        let report = Teardown::new(&cfg, &clients.collab)
            .run(&plan, &mut sessions, &Prompt)
            .await;
        Ok::<_, anyhow::Error>(report)
    })?;

    if json {
        print_json(&report)?;
    } else {
        let rows = report
            .steps
            .iter()
            .map(|s| {
                let status = match s.status {
                    StepStatus::Done => "done",
                    StepStatus::Skipped => "skipped",
                    StepStatus::Declined => "declined",
                    StepStatus::Failed => "FAILED",
                };
                vec![s.step.to_string(), status.to_string(), s.detail.clone()]
            })
            .collect();
        print_table(&["STEP", "STATUS", "DETAIL"], rows);
    }

    if !report.succeeded() {
        let failed: Vec<String> = report.failures().map(|s| s.step.to_string()).collect();
        bail!("cleanup incomplete: {} failed", failed.join(", "));
    }
    Ok(())
}
