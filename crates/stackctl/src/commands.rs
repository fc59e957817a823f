//! Command handlers for the stackctl binary.
//!
//! Each handler builds the provider and context, delegates to the library,
//! and renders the outcome for a human operator. Exit status is carried by
//! the returned `Result`.

use crate::provider::CliCloud;
use crate::sequencer::Sequencer;
use crate::verify::{self, Placement};
use crate::teardown;
use anyhow::{bail, Context, Result};
use owo_colors::OwoColorize;
use stack_common::{DeploymentSummary, ProjectContext};
use std::path::Path;

async fn build_context(project: &str, region: &str, cloud: &CliCloud) -> Result<ProjectContext> {
    let account_id = cloud
        .caller_account()
        .await
        .context("could not resolve the target account; are credentials configured?")?;
    ProjectContext::new(project, region, account_id)
}

pub async fn deploy(project: &str, region: &str, output: &Path) -> Result<()> {
    let cloud = CliCloud::new(region);
    let ctx = build_context(project, region, &cloud).await?;
    println!(
        "{} {} {} {}",
        "Deploying".bold(),
        ctx.project.cyan(),
        "into".bold(),
        ctx.region.cyan()
    );

    let summary = Sequencer::new(&cloud, ctx).deploy().await?;
    summary.write(output)?;

    println!("{}", "Deployment complete".green().bold());
    println!("  application url: {}", summary.sharing_url().cyan());
    println!("  load balancer:   {}", summary.load_balancer_endpoint);
    println!("  knowledge base:  {}", summary.knowledge_base_id);
    println!("  instance:        {}", summary.instance_id);
    println!("  summary:         {}", output.display());
    println!("  elapsed:         {}s", summary.elapsed_seconds);
    Ok(())
}

/// Re-run only the instance bootstrap. Targets the explicit instance id
/// when given, otherwise the instance a previous run recorded in its
/// summary, otherwise the instance found under the derived name.
pub async fn bootstrap(
    project: &str,
    region: &str,
    summary_path: &Path,
    instance_id: Option<&str>,
) -> Result<()> {
    let cloud = CliCloud::new(region);
    let ctx = build_context(project, region, &cloud).await?;
    let summary = if summary_path.exists() {
        let summary = DeploymentSummary::read(summary_path)?;
        if summary.project != ctx.project || summary.region != ctx.region {
            bail!(
                "summary at {} describes {}/{}, not {}/{}",
                summary_path.display(),
                summary.project,
                summary.region,
                ctx.project,
                ctx.region
            );
        }
        Some(summary)
    } else {
        None
    };
    let bootstrapped = Sequencer::new(&cloud, ctx)
        .bootstrap_only(instance_id, summary.as_ref())
        .await?;
    println!("{} {}", "Bootstrap complete on".green().bold(), bootstrapped);
    Ok(())
}

pub async fn verify_subnets(project: &str, region: &str) -> Result<()> {
    let cloud = CliCloud::new(region);
    let ctx = build_context(project, region, &cloud).await?;
    let report = verify::audit_subnets(&cloud, &ctx).await?;
    for finding in &report.findings {
        let tier = if finding.expected_public {
            "public"
        } else {
            "private"
        };
        match finding.placement {
            Placement::Correct => {
                println!("{} {} ({tier})", "ok       ".green(), finding.name)
            }
            Placement::Misplaced => {
                println!("{} {} ({tier})", "misplaced".red().bold(), finding.name)
            }
            Placement::Missing => {
                println!("{} {} ({tier})", "missing  ".yellow(), finding.name)
            }
        }
    }
    if !report.is_clean() {
        bail!("subnet audit found problems");
    }
    println!("{}", "Subnet placement is correct".green().bold());
    Ok(())
}

pub async fn teardown(project: &str, region: &str) -> Result<()> {
    let cloud = CliCloud::new(region);
    let ctx = build_context(project, region, &cloud).await?;
    println!(
        "{} {} {} {}",
        "Tearing down".bold(),
        ctx.project.cyan(),
        "in".bold(),
        ctx.region.cyan()
    );
    let report = teardown::run(&cloud, &ctx).await?;
    for name in &report.deleted {
        println!("{} {}", "deleted".red(), name);
    }
    println!(
        "{} ({} deleted, {} already absent)",
        "Teardown complete".green().bold(),
        report.deleted.len(),
        report.skipped.len()
    );
    Ok(())
}
