use anyhow::Result;
use stackctl_core::config::Environment;
use stackctl_core::tools;
use std::path::Path;

use super::{hold_forwards, load_config, runtime, Clients};

/// Open the configured forwards against an existing deployment.
pub fn run(config: Option<&Path>, environment: Environment) -> Result<()> {
    let cfg = load_config(config)?;
    tools::require(&tools::required_for_deploy(environment))?;
    let clients = Clients::connect(&cfg, environment)?;

    runtime()?.block_on(async {
        clients.collab.cluster.cluster_reachable().await?;
        let mut sessions = clients.sessions();
        hold_forwards(&cfg, &mut sessions).await
    })
}
