//! stackctl - provisioning orchestrator for the chat application stack.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stackctl::commands;

#[derive(Parser)]
#[command(name = "stackctl")]
#[command(about = "Provision and manage the chat application stack", long_about = None)]
#[command(version)]
struct Cli {
    /// Project identifier every resource name derives from (3+ characters)
    #[arg(long, global = true, default_value = "es-us")]
    project: String,

    /// Target region
    #[arg(long, global = true, default_value = "us-west-2")]
    region: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full ten-stage deployment
    Deploy {
        /// Where to write the deployment summary
        #[arg(long, default_value = "deployment-summary.json")]
        output: PathBuf,
    },

    /// Re-run only the instance bootstrap against an existing deployment
    Bootstrap {
        /// Summary written by a previous deploy
        #[arg(long, default_value = "deployment-summary.json")]
        summary: PathBuf,

        /// Target this instance instead of the recorded or name-resolved one
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// Audit subnet placement and the instance's exposure
    VerifySubnets,

    /// Delete every deployment resource in reverse order
    Teardown,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stackctl=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Deploy { output } => commands::deploy(&cli.project, &cli.region, &output).await,
        Commands::Bootstrap {
            summary,
            instance_id,
        } => commands::bootstrap(&cli.project, &cli.region, &summary, instance_id.as_deref()).await,
        Commands::VerifySubnets => commands::verify_subnets(&cli.project, &cli.region).await,
        Commands::Teardown => commands::teardown(&cli.project, &cli.region).await,
    }
}
