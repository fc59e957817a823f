//! Teardown: deletes every deployment resource in reverse dependency
//! order. Resources that are already gone are reported as skipped, never
//! as failures, so teardown is as re-runnable as deployment.

use crate::network::ENDPOINT_SERVICES;
use crate::poller::{self, PollOutcome};
use crate::provider::CloudProvider;
use crate::registry::Registry;
use stack_common::{ErrorClass, ProjectContext, ProviderError, ResourceKind, ResourceState};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
}

async fn delete_named(
    provider: &dyn CloudProvider,
    registry: &Registry<'_>,
    report: &mut TeardownReport,
    kind: ResourceKind,
    name: String,
) -> Result<(), ProviderError> {
    match registry.resolve(kind, &name).await? {
        Some(handle) => match provider.delete(kind, &handle.id).await {
            Ok(()) => {
                info!(%kind, name, "deleted");
                report.deleted.push(name);
            }
            Err(err) if err.is(ErrorClass::NotFound) => {
                report.skipped.push(name);
            }
            Err(err) => return Err(err),
        },
        None => {
            report.skipped.push(name);
        }
    }
    Ok(())
}

/// Delete the NAT gateway, wait for it to disappear, and release the
/// elastic address it held. The address stays attached until the gateway
/// is fully gone, so releasing without the wait fails on the real cloud.
async fn delete_nat_gateway(
    provider: &dyn CloudProvider,
    registry: &Registry<'_>,
    report: &mut TeardownReport,
    ctx: &ProjectContext,
) -> Result<(), ProviderError> {
    let name = ctx.nat_gateway_name();
    let nat = match registry.resolve(ResourceKind::NatGateway, &name).await? {
        Some(nat) => nat,
        None => {
            report.skipped.push(name);
            return Ok(());
        }
    };
    let allocation = provider.nat_gateway_allocation(&nat.id).await?;
    match provider.delete(ResourceKind::NatGateway, &nat.id).await {
        Ok(()) => {
            let nat_id = nat.id.as_str();
            let what = format!("nat-gateway {nat_id} removal");
            poller::await_ready(&what, poller::NAT_GATEWAY, || async move {
                Ok(
                    match provider
                        .resource_state(ResourceKind::NatGateway, nat_id)
                        .await?
                    {
                        ResourceState::Absent | ResourceState::Failed => PollOutcome::Ready(()),
                        ResourceState::Creating | ResourceState::Ready => PollOutcome::Pending,
                    },
                )
            })
            .await?;
            info!(name, "deleted");
            report.deleted.push(name);
        }
        Err(err) if err.is(ErrorClass::NotFound) => report.skipped.push(name),
        Err(err) => return Err(err),
    }
    if let Some(allocation) = allocation {
        match provider.release_address(&allocation).await {
            Ok(()) => report.deleted.push(allocation),
            Err(err) if err.is(ErrorClass::NotFound) => report.skipped.push(allocation),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub async fn run(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
) -> Result<TeardownReport, ProviderError> {
    let registry = Registry::new(provider);
    let mut report = TeardownReport::default();

    let mut targets: Vec<(ResourceKind, String)> = vec![
        (ResourceKind::Instance, ctx.instance_name()),
        (ResourceKind::Distribution, ctx.distribution_comment()),
        (ResourceKind::LoadBalancer, ctx.load_balancer_name()),
        (ResourceKind::TargetGroup, ctx.target_group_name()),
        (ResourceKind::KnowledgeBase, ctx.knowledge_base_name()),
        (ResourceKind::Collection, ctx.collection_name()),
        (ResourceKind::SearchPolicy, ctx.data_policy_name()),
        (ResourceKind::SearchPolicy, ctx.network_policy_name()),
        (ResourceKind::SearchPolicy, ctx.encryption_policy_name()),
    ];
    for service in ENDPOINT_SERVICES {
        targets.push((ResourceKind::VpcEndpoint, ctx.service_endpoint_name(service)));
    }
    for (kind, name) in targets {
        delete_named(provider, &registry, &mut report, kind, name).await?;
    }

    delete_nat_gateway(provider, &registry, &mut report, ctx).await?;

    let mut targets: Vec<(ResourceKind, String)> = Vec::new();
    for i in 0..2 {
        targets.push((ResourceKind::Subnet, ctx.public_subnet_name(i)));
        targets.push((ResourceKind::Subnet, ctx.private_subnet_name(i)));
    }
    targets.extend([
        (ResourceKind::RouteTable, ctx.public_route_table_name()),
        (ResourceKind::RouteTable, ctx.private_route_table_name()),
        (ResourceKind::SecurityGroup, ctx.app_security_group_name()),
        (ResourceKind::SecurityGroup, ctx.edge_security_group_name()),
        (
            ResourceKind::SecurityGroup,
            ctx.endpoint_security_group_name(),
        ),
        (ResourceKind::InternetGateway, ctx.internet_gateway_name()),
        (ResourceKind::Vpc, ctx.vpc_name()),
        (ResourceKind::Secret, ctx.weather_secret_name()),
        (ResourceKind::Secret, ctx.search_secret_name()),
    ]);
    for (kind, name) in targets {
        delete_named(provider, &registry, &mut report, kind, name).await?;
    }

    // The instance profile wraps the compute role and must go first.
    let profile = ctx.instance_profile_name();
    let compute_role = ctx.role_name("compute");
    match provider
        .delete_instance_profile(&profile, &compute_role)
        .await
    {
        Ok(()) => report.deleted.push(profile),
        Err(err) if err.is(ErrorClass::NotFound) => report.skipped.push(profile),
        Err(err) => return Err(err),
    }
    for logical in ["knowledge-base", "agent", "compute", "log-pipeline", "memory"] {
        let name = ctx.role_name(logical);
        match registry.resolve(ResourceKind::Role, &name).await? {
            Some(_) => match provider.delete(ResourceKind::Role, &name).await {
                Ok(()) => report.deleted.push(name),
                Err(err) if err.is(ErrorClass::NotFound) => report.skipped.push(name),
                Err(err) => return Err(err),
            },
            None => report.skipped.push(name),
        }
    }

    // The bucket goes last; it may hold content an operator wants until the
    // very end.
    let bucket = ctx.bucket_name();
    match registry.resolve(ResourceKind::Bucket, &bucket).await? {
        Some(handle) => match provider.delete(ResourceKind::Bucket, &handle.id).await {
            Ok(()) => report.deleted.push(bucket),
            Err(err) if err.is(ErrorClass::NotFound) => report.skipped.push(bucket),
            Err(err) => {
                warn!(error = %err, "bucket deletion failed; it may not be empty");
                return Err(err);
            }
        },
        None => report.skipped.push(bucket),
    }

    info!(
        deleted = report.deleted.len(),
        skipped = report.skipped.len(),
        "teardown complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;
    use crate::sequencer::Sequencer;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_deploy_removes_everything() {
        let cloud = FakeCloud::new();
        Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        let report = run(&cloud, &ctx()).await.unwrap();
        assert!(report.deleted.len() > 15, "deleted: {:?}", report.deleted);
        assert!(cloud
            .lookup(ResourceKind::Vpc, "vpc-for-es-us")
            .await
            .unwrap()
            .is_none());
        assert!(cloud
            .lookup(ResourceKind::Bucket, "storage-for-es-us-123456789012-us-west-2")
            .await
            .unwrap()
            .is_none());
        assert!(cloud
            .lookup(ResourceKind::RouteTable, "public-rt-es-us")
            .await
            .unwrap()
            .is_none());
        assert!(cloud
            .lookup(ResourceKind::RouteTable, "private-rt-es-us")
            .await
            .unwrap()
            .is_none());
        // The elastic address the NAT gateway held went with it.
        assert!(cloud
            .mutation_log()
            .iter()
            .any(|m| m.starts_with("release_address")));
    }

    #[tokio::test]
    async fn test_teardown_of_empty_account_only_skips() {
        let cloud = FakeCloud::new();
        let report = run(&cloud, &ctx()).await.unwrap();
        assert!(report.deleted.is_empty());
        assert!(!report.skipped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_rerunnable() {
        let cloud = FakeCloud::new();
        Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        run(&cloud, &ctx()).await.unwrap();
        let second = run(&cloud, &ctx()).await.unwrap();
        assert!(second.deleted.is_empty());
    }
}
