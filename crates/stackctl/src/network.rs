//! Network stage: address space, subnet pairs, gateways, routing, security
//! groups, and the interface endpoints the private instance needs to reach
//! the command channel.
//!
//! Layout is fixed: two public and two private /24 subnets spread over the
//! first two availability zones, carved from one /16 block. Public subnets
//! take /24 indices 0 and 1, private subnets take 10 and 11, leaving room
//! for later growth in between.

use crate::conflict::{self, create_or_reuse, Provenance};
use crate::poller;
use crate::provider::{CloudProvider, IngressRule, IngressSource, RouteTarget};
use crate::registry::Registry;
use futures::future::try_join_all;
use stack_common::{
    AddressAllocation, CidrBlock, ProjectContext, ProviderError, ResourceHandle, ResourceKind,
    StageError, StageId,
};
use tracing::{info, warn};

/// Port the application process listens on.
pub const APP_PORT: u16 = 8501;
/// Port the load balancer accepts traffic on.
pub const EDGE_PORT: u16 = 80;
/// Number of public/private subnet pairs.
pub const SUBNET_PAIRS: usize = 2;
/// First /24 index used for private subnets.
const PRIVATE_SUBNET_BASE: u32 = 10;

/// Services the private instance reaches through interface endpoints: the
/// managed inference API plus the three command-channel services.
pub const ENDPOINT_SERVICES: [&str; 4] =
    ["bedrock-runtime", "ssm", "ssmmessages", "ec2messages"];

#[derive(Debug)]
pub struct NetworkOutputs {
    pub vpc: ResourceHandle,
    pub block: CidrBlock,
    pub public_subnets: Vec<ResourceHandle>,
    pub private_subnets: Vec<ResourceHandle>,
    pub edge_security_group: ResourceHandle,
    pub app_security_group: ResourceHandle,
}

pub async fn provision(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
) -> Result<NetworkOutputs, StageError> {
    let stage = StageId::Network;
    let registry = Registry::new(provider);

    let zones = provider
        .availability_zones()
        .await
        .map_err(|e| StageError::new(stage, ResourceKind::Subnet, e))?;
    if zones.len() < SUBNET_PAIRS {
        return Err(StageError::new(
            stage,
            ResourceKind::Subnet,
            ProviderError::precondition(format!(
                "region has {} availability zones but the layout needs {}; \
                 pick a region with more zones",
                zones.len(),
                SUBNET_PAIRS
            )),
        ));
    }

    // Address space: adopt the existing one (recovering its block) or claim
    // a candidate block and create it.
    let vpc_wrap = |e| StageError::new(stage, ResourceKind::Vpc, e);
    let vpc_name = ctx.vpc_name();
    let (vpc, block) = match registry
        .resolve(ResourceKind::Vpc, &vpc_name)
        .await
        .map_err(vpc_wrap)?
    {
        Some(existing) => {
            let block = provider
                .address_space_block(&existing.id)
                .await
                .map_err(vpc_wrap)?;
            info!(vpc = %existing.id, %block, "reusing address space");
            (existing, block)
        }
        None => conflict::create_address_space(provider, &vpc_name)
            .await
            .map_err(vpc_wrap)?,
    };

    // Subnet layout from the block, claimed locally to catch carving bugs.
    let subnet_wrap = |e| StageError::new(stage, ResourceKind::Subnet, e);
    let carve = |n: u32| {
        block
            .nth_subnet(n)
            .map_err(|e| subnet_wrap(ProviderError::other(e.to_string())))
    };
    let mut allocation = AddressAllocation::new();
    let mut wanted = Vec::new();
    for i in 0..SUBNET_PAIRS {
        let cidr = carve(i as u32)?;
        allocation
            .claim(cidr)
            .map_err(|e| subnet_wrap(ProviderError::other(e.to_string())))?;
        wanted.push((ctx.public_subnet_name(i), cidr, zones[i].clone(), true));
    }
    for i in 0..SUBNET_PAIRS {
        let cidr = carve(PRIVATE_SUBNET_BASE + i as u32)?;
        allocation
            .claim(cidr)
            .map_err(|e| subnet_wrap(ProviderError::other(e.to_string())))?;
        wanted.push((ctx.private_subnet_name(i), cidr, zones[i].clone(), false));
    }

    // Siblings are independent, so missing subnets are created concurrently.
    let vpc_id = vpc.id.clone();
    let creations = wanted.iter().map(|(name, cidr, zone, _)| {
        let vpc_id = vpc_id.clone();
        async move {
            create_or_reuse(provider, ResourceKind::Subnet, name, || {
                provider.create_subnet(name, &vpc_id, *cidr, zone)
            })
            .await
        }
    });
    let results = try_join_all(creations).await.map_err(subnet_wrap)?;

    let mut named_public = Vec::new();
    let mut named_private = Vec::new();
    for ((handle, provenance), (_, _, _, public)) in results.into_iter().zip(&wanted) {
        if provenance == Provenance::Created {
            poller::await_state(provider, ResourceKind::Subnet, &handle.id, poller::SUBNET)
                .await
                .map_err(subnet_wrap)?;
        }
        if *public {
            named_public.push(handle);
        } else {
            named_private.push(handle);
        }
    }

    // Internet gateway and public routing.
    let igw_wrap = |e| StageError::new(stage, ResourceKind::InternetGateway, e);
    let igw_name = ctx.internet_gateway_name();
    let (igw, _) = create_or_reuse(provider, ResourceKind::InternetGateway, &igw_name, || {
        provider.create_internet_gateway(&igw_name, &vpc.id)
    })
    .await
    .map_err(igw_wrap)?;

    // Re-route only when some public-named subnet actually lacks the
    // default route, so a converged re-run stays read-only.
    let mut public_routing_needed = false;
    for subnet in &named_public {
        if !provider
            .has_internet_route(&subnet.id)
            .await
            .map_err(igw_wrap)?
        {
            public_routing_needed = true;
        }
    }
    if public_routing_needed {
        let ids: Vec<String> = named_public.iter().map(|s| s.id.clone()).collect();
        provider
            .route_subnets(
                &ctx.public_route_table_name(),
                &vpc.id,
                &ids,
                RouteTarget::InternetGateway(igw.id.clone()),
            )
            .await
            .map_err(igw_wrap)?;
    }

    // Final classification goes by the route tables, not the names: a
    // reused subnet keeps whatever routing it actually has.
    let mut public_subnets = Vec::new();
    let mut private_subnets = Vec::new();
    for subnet in named_public.into_iter().chain(named_private) {
        if provider
            .has_internet_route(&subnet.id)
            .await
            .map_err(igw_wrap)?
        {
            public_subnets.push(subnet);
        } else {
            private_subnets.push(subnet);
        }
    }

    // NAT gateway. Creation is issued here; availability is only waited on
    // after the rest of the stage, since nothing below needs it ready.
    let nat_wrap = |e| StageError::new(stage, ResourceKind::NatGateway, e);
    let nat_host = public_subnets.first().ok_or_else(|| {
        StageError::new(
            stage,
            ResourceKind::NatGateway,
            ProviderError::precondition("no public subnet available to host the NAT gateway"),
        )
    })?;
    let nat_name = ctx.nat_gateway_name();
    let (nat, _) = create_or_reuse(provider, ResourceKind::NatGateway, &nat_name, || {
        provider.create_nat_gateway(&nat_name, &nat_host.id)
    })
    .await
    .map_err(nat_wrap)?;

    // Private routing is gated on the observed routes as well, so an
    // interrupted run converges on the next attempt.
    let mut private_routing_needed = false;
    for subnet in &private_subnets {
        if !provider
            .has_default_route(&subnet.id)
            .await
            .map_err(nat_wrap)?
        {
            private_routing_needed = true;
        }
    }
    if private_routing_needed {
        let ids: Vec<String> = private_subnets.iter().map(|s| s.id.clone()).collect();
        provider
            .route_subnets(
                &ctx.private_route_table_name(),
                &vpc.id,
                &ids,
                RouteTarget::NatGateway(nat.id.clone()),
            )
            .await
            .map_err(nat_wrap)?;
    }

    // Security groups. The application group only admits traffic that came
    // through the load balancer group.
    let sg_wrap = |e| StageError::new(stage, ResourceKind::SecurityGroup, e);
    let edge_name = ctx.edge_security_group_name();
    let edge_rules = [IngressRule {
        port: EDGE_PORT,
        source: IngressSource::Anywhere,
    }];
    let (edge_sg, _) = create_or_reuse(provider, ResourceKind::SecurityGroup, &edge_name, || {
        provider.create_security_group(&edge_name, &vpc.id, "load balancer ingress", &edge_rules)
    })
    .await
    .map_err(sg_wrap)?;

    let app_name = ctx.app_security_group_name();
    let app_rules = [IngressRule {
        port: APP_PORT,
        source: IngressSource::Group(edge_sg.id.clone()),
    }];
    let (app_sg, _) = create_or_reuse(provider, ResourceKind::SecurityGroup, &app_name, || {
        provider.create_security_group(
            &app_name,
            &vpc.id,
            "application ingress from the load balancer",
            &app_rules,
        )
    })
    .await
    .map_err(sg_wrap)?;

    let vpce_name = ctx.endpoint_security_group_name();
    let vpce_rules = [IngressRule {
        port: 443,
        source: IngressSource::Block(block),
    }];
    let (vpce_sg, _) = create_or_reuse(provider, ResourceKind::SecurityGroup, &vpce_name, || {
        provider.create_security_group(
            &vpce_name,
            &vpc.id,
            "interface endpoint ingress from inside the address space",
            &vpce_rules,
        )
    })
    .await
    .map_err(sg_wrap)?;

    // Interface endpoints so the private instance can reach the command
    // channel without internet egress.
    let vpce_wrap = |e| StageError::new(stage, ResourceKind::VpcEndpoint, e);
    let private_ids: Vec<String> = private_subnets.iter().map(|s| s.id.clone()).collect();
    for service in ENDPOINT_SERVICES {
        let name = ctx.service_endpoint_name(service);
        let (_, provenance) =
            create_or_reuse(provider, ResourceKind::VpcEndpoint, &name, || {
                provider.create_service_endpoint(
                    &name,
                    &vpc.id,
                    service,
                    &private_ids,
                    &vpce_sg.id,
                )
            })
            .await
            .map_err(vpce_wrap)?;
        if provenance == Provenance::Reused {
            warn!(endpoint = %name, "interface endpoint already present");
        }
    }

    // Everything else is in place; now block on the NAT gateway becoming
    // available.
    if !nat.is_ready() {
        poller::await_state(provider, ResourceKind::NatGateway, &nat.id, poller::NAT_GATEWAY)
            .await
            .map_err(nat_wrap)?;
    }

    info!(vpc = %vpc.id, %block, "network stage complete");
    Ok(NetworkOutputs {
        vpc,
        block,
        public_subnets,
        private_subnets,
        edge_security_group: edge_sg,
        app_security_group: app_sg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;
    use stack_common::ErrorClass;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_network_build() {
        let cloud = FakeCloud::new();
        let outputs = provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(outputs.block.to_string(), "10.20.0.0/16");
        assert_eq!(outputs.public_subnets.len(), 2);
        assert_eq!(outputs.private_subnets.len(), 2);
        let log = cloud.mutation_log();
        assert!(log.iter().any(|m| m.contains("public-subnet-for-es-us-1 10.20.0.0/24 zone-a")));
        assert!(log.iter().any(|m| m.contains("public-subnet-for-es-us-2 10.20.1.0/24 zone-b")));
        assert!(log.iter().any(|m| m.contains("private-subnet-for-es-us-1 10.20.10.0/24 zone-a")));
        assert!(log.iter().any(|m| m.contains("private-subnet-for-es-us-2 10.20.11.0/24 zone-b")));
        assert_eq!(
            log.iter().filter(|m| m.starts_with("create_service_endpoint")).count(),
            4
        );
        assert!(log.iter().any(|m| m.contains("create_service_endpoint vpce-bedrock-runtime-for-es-us")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_zone_region_is_a_precondition_failure() {
        let cloud = FakeCloud::new();
        cloud.set_zones(&["zone-a"]);
        let err = provision(&cloud, &ctx()).await.unwrap_err();
        assert_eq!(err.stage, StageId::Network);
        assert!(err.source.is(ErrorClass::PreconditionViolated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_when_preferred_block_is_claimed() {
        let cloud = FakeCloud::new();
        cloud.claim_block("10.20.0.0/16".parse().unwrap());
        let outputs = provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(outputs.block.to_string(), "10.21.0.0/16");
        let log = cloud.mutation_log();
        assert!(log.iter().any(|m| m.contains("public-subnet-for-es-us-1 10.21.0.0/24")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_makes_no_mutations() {
        let cloud = FakeCloud::new();
        provision(&cloud, &ctx()).await.unwrap();
        let before = cloud.mutation_count();
        provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(cloud.mutation_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_nat_gateway_is_waited_on() {
        let cloud = FakeCloud::new();
        // Pre-create everything up to the NAT so the countdown can target
        // its id before the provision run polls it.
        let nat = cloud.create_nat_gateway("nat-es-us", "subnet-x").await.unwrap();
        cloud.set_ready_after(ResourceKind::NatGateway, &nat.id, 4);
        let outputs = provision(&cloud, &ctx()).await;
        assert!(outputs.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_private_routing_survives_an_interrupted_nat_wait() {
        let cloud = FakeCloud::new();
        // A NAT gateway from an earlier run that stays pending past the
        // poll budget: the run fails, but only after the private route
        // table is already in place.
        let nat = cloud.create_nat_gateway("nat-es-us", "subnet-x").await.unwrap();
        cloud.set_ready_after(ResourceKind::NatGateway, &nat.id, 100);
        let first = provision(&cloud, &ctx()).await;
        assert!(first.is_err());
        let routed = |log: &[String]| {
            log.iter()
                .filter(|m| m.contains("route_subnets private-rt-es-us"))
                .count()
        };
        assert_eq!(routed(&cloud.mutation_log()), 1);

        // The next run converges: the NAT finishes activating and no route
        // table is created twice.
        let outputs = provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(outputs.private_subnets.len(), 2);
        assert_eq!(routed(&cloud.mutation_log()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_subnets_are_classified_by_their_routes() {
        let cloud = FakeCloud::new();
        provision(&cloud, &ctx()).await.unwrap();
        // Someone hand-routed a private-named subnet through the internet
        // gateway; the re-run trusts the route table over the name.
        let stray = cloud
            .resource(ResourceKind::Subnet, "private-subnet-for-es-us-1")
            .unwrap();
        cloud.mark_subnet_public(&stray.id);
        let outputs = provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(outputs.public_subnets.len(), 3);
        assert_eq!(outputs.private_subnets.len(), 1);
        assert!(outputs.public_subnets.iter().any(|s| s.id == stray.id));
    }
}
