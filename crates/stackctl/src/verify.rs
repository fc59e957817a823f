//! Placement audit: checks that every subnet the deployment names
//! actually routes the way its name claims, and that the instance sits in
//! a private subnet with no public address.
//!
//! Naming is the source of truth for classification, but routes are the
//! source of truth for behavior; this audit reports where the two disagree
//! so an operator can fix placement before traffic reaches the wrong tier.

use crate::network::SUBNET_PAIRS;
use crate::provider::CloudProvider;
use crate::registry::Registry;
use stack_common::{ProjectContext, ProviderError, ResourceKind};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Correct,
    /// Exists but routes opposite to what its name claims.
    Misplaced,
    Missing,
}

#[derive(Debug)]
pub struct Finding {
    pub name: String,
    pub expected_public: bool,
    pub placement: Placement,
}

#[derive(Debug)]
pub struct AuditReport {
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings
            .iter()
            .all(|f| f.placement == Placement::Correct)
    }
}

pub async fn audit_subnets(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
) -> Result<AuditReport, ProviderError> {
    let registry = Registry::new(provider);
    registry.expect(ResourceKind::Vpc, &ctx.vpc_name()).await?;

    let mut names = Vec::new();
    for i in 0..SUBNET_PAIRS {
        names.push((ctx.public_subnet_name(i), true));
    }
    for i in 0..SUBNET_PAIRS {
        names.push((ctx.private_subnet_name(i), false));
    }

    let mut findings = Vec::new();
    for (name, expected_public) in names {
        let placement = match registry.resolve(ResourceKind::Subnet, &name).await? {
            None => Placement::Missing,
            Some(subnet) => {
                let actually_public = provider.has_internet_route(&subnet.id).await?;
                if actually_public == expected_public {
                    Placement::Correct
                } else {
                    Placement::Misplaced
                }
            }
        };
        findings.push(Finding {
            name,
            expected_public,
            placement,
        });
    }

    // The instance must stay behind the load balancer. A public address or
    // an internet-routed subnet means it is reachable directly.
    let instance_name = ctx.instance_name();
    if let Some(instance) = registry.resolve(ResourceKind::Instance, &instance_name).await? {
        let exposed = provider.instance_has_public_address(&instance.id).await?
            || provider
                .has_internet_route(&provider.instance_subnet(&instance.id).await?)
                .await?;
        findings.push(Finding {
            name: instance_name,
            expected_public: false,
            placement: if exposed {
                Placement::Misplaced
            } else {
                Placement::Correct
            },
        });
    }

    let report = AuditReport { findings };
    info!(clean = report.is_clean(), "placement audit complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network;
    use crate::provider::FakeCloud;
    use crate::sequencer::Sequencer;
    use stack_common::ErrorClass;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshly_built_network_audits_clean() {
        let cloud = FakeCloud::new();
        network::provision(&cloud, &ctx()).await.unwrap();
        let report = audit_subnets(&cloud, &ctx()).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.findings.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_private_subnet_with_internet_route_is_misplaced() {
        let cloud = FakeCloud::new();
        let net = network::provision(&cloud, &ctx()).await.unwrap();
        cloud.mark_subnet_public(&net.private_subnets[0].id);
        let report = audit_subnets(&cloud, &ctx()).await.unwrap();
        assert!(!report.is_clean());
        let bad: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.placement == Placement::Misplaced)
            .collect();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].name, "private-subnet-for-es-us-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_deploy_audits_clean_including_the_instance() {
        let cloud = FakeCloud::new();
        let summary = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        let report = audit_subnets(&cloud, &ctx()).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.findings.len(), 5);

        cloud.give_instance_public_address(&summary.instance_id);
        let report = audit_subnets(&cloud, &ctx()).await.unwrap();
        assert!(!report.is_clean());
        let instance = report
            .findings
            .iter()
            .find(|f| f.name == "app-for-es-us")
            .unwrap();
        assert_eq!(instance.placement, Placement::Misplaced);
    }

    #[tokio::test]
    async fn test_missing_vpc_is_an_error() {
        let cloud = FakeCloud::new();
        let err = audit_subnets(&cloud, &ctx()).await.unwrap_err();
        assert!(err.is(ErrorClass::NotFound));
    }
}
