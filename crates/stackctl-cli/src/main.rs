mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{cleanup::CleanupArgs, deploy::DeployArgs};
use stackctl_core::config::Environment;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "stackctl",
    about = "Bring up, expose and tear down a multi-service stack on Kubernetes",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to stack.yaml (default: search upward from the current directory)
    #[arg(long, global = true, env = "STACKCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Target environment: local, staging or production
    #[arg(long, short = 'e', global = true, default_value = "local")]
    environment: Environment,

    /// Output as JSON (status, cleanup)
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the cluster (local only) and install the ingress controller
    Setup,

    /// Run the full pipeline, then forward the configured ports until Ctrl-C
    Deploy {
        /// Validate every stage without changing the cluster
        #[arg(long)]
        dry_run: bool,

        /// Upgrade the release if it is already installed
        #[arg(long)]
        upgrade: bool,

        /// Override every readiness timeout (e.g. 90s, 5m)
        #[arg(long, value_name = "DURATION")]
        timeout: Option<String>,

        /// Don't open port-forwards after deploying
        #[arg(long)]
        no_forward: bool,
    },

    /// Stop forwards and remove the release, data, namespace or cluster
    Cleanup {
        /// Delete the whole local cluster instead of individual resources
        #[arg(long)]
        remove_cluster: bool,

        /// Also delete persistent volume claims (data is lost)
        #[arg(long = "remove-pvc")]
        remove_pvc: bool,

        /// Don't ask before destructive steps
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Show release presence, namespace contents and configured forwards
    Status,

    /// Open the configured port-forwards without deploying
    Forward,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Setup
        | Commands::Deploy { .. }
        | Commands::Cleanup { .. }
        | Commands::Forward => tracing::Level::INFO,
        Commands::Status => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let config = cli.config.as_deref();
    let env = cli.environment;

    let result = match cli.command {
        Commands::Setup => cmd::setup::run(config, env),
        Commands::Deploy {
            dry_run,
            upgrade,
            timeout,
            no_forward,
        } => cmd::deploy::run(
            config,
            DeployArgs {
                environment: env,
                dry_run,
                upgrade,
                timeout,
                no_forward,
            },
        ),
        Commands::Cleanup {
            remove_cluster,
            remove_pvc,
            force,
        } => cmd::cleanup::run(
            config,
            CleanupArgs {
                environment: env,
                remove_cluster,
                remove_pvc,
                force,
            },
            cli.json,
        ),
        Commands::Status => cmd::status::run(config, env, cli.json),
        Commands::Forward => cmd::forward::run(config, env),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
