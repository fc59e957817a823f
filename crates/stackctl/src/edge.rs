//! Edge stages: the load balancer, the CDN distribution in front of it,
//! the compute instance, and the final binding that wires traffic through.
//!
//! The distribution stamps a shared-secret header onto every request it
//! forwards; the listener only routes requests carrying that header, so
//! the load balancer cannot be reached around the CDN even though it is
//! internet-facing.

use crate::bootstrap;
use crate::conflict::{create_or_reuse, Provenance};
use crate::network::{NetworkOutputs, APP_PORT, EDGE_PORT, SUBNET_PAIRS};
use crate::poller::{self, PollOutcome};
use crate::provider::{CloudProvider, DistributionSpec, InstanceSpec};
use stack_common::{
    ProjectContext, ProviderError, ResourceHandle, ResourceKind, StageError, StageId,
};
use tracing::info;

pub const INSTANCE_TYPE: &str = "t3.medium";

/// Path prefixes the CDN serves from the bucket origin.
const STATIC_PATTERNS: [&str; 2] = ["/images/*", "/docs/*"];

#[derive(Debug)]
pub struct LoadBalancerOutputs {
    pub load_balancer: ResourceHandle,
    pub target_group: ResourceHandle,
    /// DNS name the distribution forwards to.
    pub domain: String,
}

#[derive(Debug)]
pub struct DistributionOutputs {
    pub distribution: ResourceHandle,
    pub domain: String,
}

pub async fn provision_load_balancer(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
    network: &NetworkOutputs,
) -> Result<LoadBalancerOutputs, StageError> {
    let stage = StageId::LoadBalancer;
    let lb_wrap = |e| StageError::new(stage, ResourceKind::LoadBalancer, e);

    if network.public_subnets.len() < SUBNET_PAIRS {
        return Err(lb_wrap(ProviderError::precondition(format!(
            "insufficient public subnets: have {}, need {}; \
             run verify-subnets to audit placement",
            network.public_subnets.len(),
            SUBNET_PAIRS
        ))));
    }

    let lb_name = ctx.load_balancer_name();
    let public_ids: Vec<String> = network.public_subnets.iter().map(|s| s.id.clone()).collect();
    let (load_balancer, lb_provenance) =
        create_or_reuse(provider, ResourceKind::LoadBalancer, &lb_name, || {
            provider.create_load_balancer(&lb_name, &public_ids, &network.edge_security_group.id)
        })
        .await
        .map_err(lb_wrap)?;

    // The domain feeds the distribution's dynamic origin; a handle without
    // one is unusable downstream.
    let domain = load_balancer
        .endpoint
        .clone()
        .ok_or_else(|| lb_wrap(ProviderError::other("load balancer reported no domain name")))?;

    let tg_wrap = |e| StageError::new(stage, ResourceKind::TargetGroup, e);
    let tg_name = ctx.target_group_name();
    let (target_group, tg_provenance) =
        create_or_reuse(provider, ResourceKind::TargetGroup, &tg_name, || {
            provider.create_target_group(&tg_name, &network.vpc.id, APP_PORT)
        })
        .await
        .map_err(tg_wrap)?;

    // Listeners cannot be resolved by name; a fresh load balancer or
    // target group means the listener must be (re)established, and a fully
    // reused pair is still probed in case an earlier run died in between.
    let listener_wrap = |e| StageError::new(stage, ResourceKind::Listener, e);
    let needs_listener = lb_provenance == Provenance::Created
        || tg_provenance == Provenance::Created
        || !provider
            .listener_exists(&load_balancer.id)
            .await
            .map_err(listener_wrap)?;
    if needs_listener {
        provider
            .create_listener(
                &load_balancer.id,
                &target_group.id,
                EDGE_PORT,
                &ctx.custom_header(),
            )
            .await
            .map_err(listener_wrap)?;
    }

    info!(load_balancer = %load_balancer.id, "load balancer stage complete");
    Ok(LoadBalancerOutputs {
        load_balancer,
        target_group,
        domain,
    })
}

pub async fn provision_distribution(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
    bucket: &str,
    load_balancer_domain: &str,
) -> Result<DistributionOutputs, StageError> {
    let wrap = |e| StageError::new(StageId::Distribution, ResourceKind::Distribution, e);

    let comment = ctx.distribution_comment();
    let spec = DistributionSpec {
        comment: comment.clone(),
        load_balancer_domain: load_balancer_domain.to_string(),
        bucket_domain: format!("{bucket}.s3.{}.amazonaws.com", ctx.region),
        custom_header: ctx.custom_header(),
        static_patterns: STATIC_PATTERNS.iter().map(|p| p.to_string()).collect(),
    };
    let (distribution, _) =
        create_or_reuse(provider, ResourceKind::Distribution, &comment, || {
            provider.create_distribution(&spec)
        })
        .await
        .map_err(wrap)?;

    let domain = distribution
        .endpoint
        .clone()
        .ok_or_else(|| wrap(ProviderError::other("distribution reported no domain name")))?;

    info!(distribution = %distribution.id, "distribution stage complete");
    Ok(DistributionOutputs {
        distribution,
        domain,
    })
}

pub async fn provision_compute(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
    network: &NetworkOutputs,
    setup_script: &str,
) -> Result<(ResourceHandle, Provenance), StageError> {
    let wrap = |e| StageError::new(StageId::Compute, ResourceKind::Instance, e);

    let name = ctx.instance_name();
    let instance_name = name.clone();
    let subnet_id = network
        .private_subnets
        .first()
        .ok_or_else(|| {
            wrap(ProviderError::precondition(
                "no private subnet available for the instance; run verify-subnets",
            ))
        })?
        .id
        .clone();
    let security_group_id = network.app_security_group.id.clone();
    let instance_profile = ctx.instance_profile_name();
    let (instance, provenance) =
        create_or_reuse(provider, ResourceKind::Instance, &name, || async move {
            let image_id = provider.latest_image_id().await?;
            let spec = InstanceSpec {
                name: instance_name,
                image_id,
                instance_type: INSTANCE_TYPE.to_string(),
                subnet_id,
                security_group_id,
                instance_profile,
            };
            provider.run_instance(&spec).await
        })
        .await
        .map_err(wrap)?;

    if !instance.is_ready() {
        poller::await_state(provider, ResourceKind::Instance, &instance.id, poller::INSTANCE)
            .await
            .map_err(wrap)?;
    }

    // Placement checks. A public address or a public subnet means the
    // instance is exposed around the load balancer.
    if provider
        .instance_has_public_address(&instance.id)
        .await
        .map_err(wrap)?
    {
        return Err(wrap(ProviderError::precondition(format!(
            "instance {} has a public address; terminate it and re-run",
            instance.id
        ))));
    }
    let subnet = provider.instance_subnet(&instance.id).await.map_err(wrap)?;
    if !network.private_subnets.iter().any(|s| s.id == subnet) {
        return Err(wrap(ProviderError::precondition(format!(
            "instance {} sits in {subnet}, not a private subnet; \
             terminate it and re-run",
            instance.id
        ))));
    }

    if provenance == Provenance::Created {
        bootstrap::run(provider, &instance.id, setup_script).await?;
    }

    info!(instance = %instance.id, "compute stage complete");
    Ok((instance, provenance))
}

/// Final stage: put the instance behind the target group and wait until the
/// application answers through the CDN.
pub async fn bind_edge(
    provider: &dyn CloudProvider,
    target_group_id: &str,
    instance_id: &str,
    instance_provenance: Provenance,
    distribution_domain: &str,
) -> Result<(), StageError> {
    let wrap = |e| StageError::new(StageId::EdgeBinding, ResourceKind::TargetGroup, e);

    // A fresh instance always needs registering; a reused one is probed so
    // a run that died before registration still converges.
    let needs_registration = instance_provenance == Provenance::Created
        || !provider
            .target_registered(target_group_id, instance_id)
            .await
            .map_err(wrap)?;
    if needs_registration {
        provider
            .register_target(target_group_id, instance_id, APP_PORT)
            .await
            .map_err(wrap)?;
    }

    let url = format!("https://{distribution_domain}/");
    poller::await_ready(&format!("application at {url}"), poller::APP_HEALTH, || {
        let url = url.clone();
        async move {
            Ok(if provider.http_ready(&url).await? {
                PollOutcome::Ready(())
            } else {
                PollOutcome::Pending
            })
        }
    })
    .await
    .map_err(wrap)?;

    info!("edge binding complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network;
    use crate::provider::FakeCloud;
    use stack_common::ErrorClass;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    async fn built_network(cloud: &FakeCloud) -> NetworkOutputs {
        network::provision(cloud, &ctx()).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_balancer_spans_both_public_subnets() {
        let cloud = FakeCloud::new();
        let net = built_network(&cloud).await;
        let outputs = provision_load_balancer(&cloud, &ctx(), &net).await.unwrap();
        assert_eq!(outputs.load_balancer.name, "alb-for-es-us");
        assert_eq!(outputs.domain, "alb-for-es-us.elb.test");
        let log = cloud.mutation_log();
        assert!(log.iter().any(|m| m.starts_with("create_listener")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopted_pair_without_listener_gets_one() {
        let cloud = FakeCloud::new();
        let net = built_network(&cloud).await;
        // A run that died after creating the load balancer and target group
        // but before wiring the listener.
        cloud
            .create_load_balancer("alb-for-es-us", &["subnet-a".into()], "sg-1")
            .await
            .unwrap();
        cloud
            .create_target_group("tg-for-es-us", &net.vpc.id, APP_PORT)
            .await
            .unwrap();
        provision_load_balancer(&cloud, &ctx(), &net).await.unwrap();
        let log = cloud.mutation_log();
        assert_eq!(
            log.iter().filter(|m| m.starts_with("create_listener")).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_balancer_without_domain_is_an_error() {
        let cloud = FakeCloud::new();
        let net = built_network(&cloud).await;
        cloud.preload(ResourceHandle::ready(
            ResourceKind::LoadBalancer,
            "alb-for-es-us",
            "alb-broken",
        ));
        let err = provision_load_balancer(&cloud, &ctx(), &net).await.unwrap_err();
        assert_eq!(err.stage, StageId::LoadBalancer);
        assert!(err.source.message.contains("no domain name"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distribution_routes_images_and_docs_to_the_bucket() {
        let cloud = FakeCloud::new();
        provision_distribution(&cloud, &ctx(), "bucket", "lb.elb.test")
            .await
            .unwrap();
        assert!(cloud
            .mutation_log()
            .iter()
            .any(|m| m.ends_with("patterns=/images/*,/docs/*")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distribution_without_domain_is_an_error() {
        let cloud = FakeCloud::new();
        cloud.preload(ResourceHandle::ready(
            ResourceKind::Distribution,
            "distribution-for-es-us",
            "dist-broken",
        ));
        let err = provision_distribution(&cloud, &ctx(), "bucket", "lb.elb.test")
            .await
            .unwrap_err();
        assert_eq!(err.stage, StageId::Distribution);
        assert!(err.source.message.contains("no domain name"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_public_subnet_is_a_precondition_failure() {
        let cloud = FakeCloud::new();
        let mut net = built_network(&cloud).await;
        net.public_subnets.truncate(1);
        let err = provision_load_balancer(&cloud, &ctx(), &net).await.unwrap_err();
        assert_eq!(err.stage, StageId::LoadBalancer);
        assert!(err.source.is(ErrorClass::PreconditionViolated));
        assert!(err.source.message.contains("insufficient public subnets"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compute_rejects_instance_with_public_address() {
        let cloud = FakeCloud::new();
        let net = built_network(&cloud).await;
        // Simulate an instance someone launched by hand in the right name
        // but with a public address.
        let instance = cloud
            .run_instance(&InstanceSpec {
                name: "app-for-es-us".into(),
                image_id: "img".into(),
                instance_type: INSTANCE_TYPE.into(),
                subnet_id: net.private_subnets[0].id.clone(),
                security_group_id: net.app_security_group.id.clone(),
                instance_profile: "profile".into(),
            })
            .await
            .unwrap();
        cloud.give_instance_public_address(&instance.id);
        let err = provision_compute(&cloud, &ctx(), &net, "echo").await.unwrap_err();
        assert!(err.source.is(ErrorClass::PreconditionViolated));
        assert!(err.source.message.contains("public address"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compute_launches_into_private_subnet_and_bootstraps() {
        let cloud = FakeCloud::new();
        let net = built_network(&cloud).await;
        let (instance, provenance) =
            provision_compute(&cloud, &ctx(), &net, "echo ok").await.unwrap();
        assert_eq!(provenance, Provenance::Created);
        let log = cloud.mutation_log();
        assert!(log
            .iter()
            .any(|m| m.contains(&format!("run_instance app-for-es-us in {}", net.private_subnets[0].id))));
        assert!(log.iter().any(|m| m == &format!("send_command {}", instance.id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_edge_waits_for_health() {
        let cloud = FakeCloud::new();
        cloud.set_http_ready_after(3);
        bind_edge(&cloud, "tg-1", "i-1", Provenance::Created, "d.cdn.test")
            .await
            .unwrap();
        assert!(cloud
            .mutation_log()
            .iter()
            .any(|m| m.starts_with("register_target tg-1 i-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_edge_skips_registration_when_already_registered() {
        let cloud = FakeCloud::new();
        cloud.register_target("tg-1", "i-1", APP_PORT).await.unwrap();
        let before = cloud.mutation_count();
        bind_edge(&cloud, "tg-1", "i-1", Provenance::Reused, "d.cdn.test")
            .await
            .unwrap();
        assert_eq!(cloud.mutation_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_edge_registers_a_reused_but_unregistered_instance() {
        let cloud = FakeCloud::new();
        bind_edge(&cloud, "tg-1", "i-1", Provenance::Reused, "d.cdn.test")
            .await
            .unwrap();
        assert!(cloud
            .mutation_log()
            .iter()
            .any(|m| m.starts_with("register_target tg-1 i-1")));
    }
}
