//! The deployment sequencer: runs the ten stages in plan order, halts on
//! the first failure, and produces the summary artifact on success.

use crate::provider::CloudProvider;
use crate::registry::Registry;
use crate::{bootstrap, edge, identity, knowledge_base, network, storage, vector_store};
use stack_common::{
    DeploymentPlan, DeploymentSummary, ProjectContext, ProviderError, ResourceKind, StageError,
    StageId, StageStatus,
};
use std::time::Instant;
use tracing::{error, info};

pub struct Sequencer<'a> {
    provider: &'a dyn CloudProvider,
    ctx: ProjectContext,
}

impl<'a> Sequencer<'a> {
    pub fn new(provider: &'a dyn CloudProvider, ctx: ProjectContext) -> Self {
        Self { provider, ctx }
    }

    /// Run the full plan. The first stage failure halts the run; everything
    /// already provisioned stays in place for the next attempt to adopt.
    pub async fn deploy(&self) -> Result<DeploymentSummary, StageError> {
        let started = Instant::now();
        let plan = DeploymentPlan::standard();
        let total = plan.len();
        let mut statuses = vec![StageStatus::Pending; total];

        let begin = |statuses: &mut Vec<StageStatus>, stage: StageId| {
            statuses[stage.index()] = StageStatus::Running;
            info!(stage = %stage, step = stage.index() + 1, total, "stage starting");
        };
        let finish = |statuses: &mut Vec<StageStatus>, stage: StageId| {
            statuses[stage.index()] = StageStatus::Done;
            info!(stage = %stage, "stage done");
        };
        macro_rules! run_stage {
            ($stage:expr, $future:expr) => {{
                begin(&mut statuses, $stage);
                match $future.await {
                    Ok(outputs) => {
                        finish(&mut statuses, $stage);
                        outputs
                    }
                    Err(err) => {
                        statuses[$stage.index()] = StageStatus::Failed;
                        error!(stage = %$stage, error = %err, "stage failed, halting");
                        return Err(err);
                    }
                }
            }};
        }

        let provider = self.provider;
        let ctx = &self.ctx;

        let storage = run_stage!(StageId::Bucket, storage::provision(provider, ctx));
        let roles = run_stage!(StageId::Identity, identity::provision(provider, ctx));
        let _secrets = run_stage!(StageId::Secrets, identity::provision_secrets(provider, ctx));

        let principals = vec![
            roles.knowledge_base_role.id.clone(),
            roles.compute_role.id.clone(),
        ];
        let vector = run_stage!(
            StageId::VectorStore,
            vector_store::provision(provider, ctx, &principals)
        );
        let net = run_stage!(StageId::Network, network::provision(provider, ctx));
        let kb = run_stage!(
            StageId::KnowledgeBase,
            knowledge_base::provision(
                provider,
                ctx,
                &storage.bucket.name,
                &roles.knowledge_base_role.id,
                &vector.collection.id,
                &vector.index_name,
            )
        );
        let lb = run_stage!(
            StageId::LoadBalancer,
            edge::provision_load_balancer(provider, ctx, &net)
        );
        let distribution = run_stage!(
            StageId::Distribution,
            edge::provision_distribution(provider, ctx, &storage.bucket.name, &lb.domain)
        );

        let script = bootstrap::render_setup_script(
            ctx,
            &storage.bucket.name,
            &kb.knowledge_base.id,
            vector.collection.endpoint.as_deref().unwrap_or_default(),
        );
        let (instance, instance_provenance) = run_stage!(
            StageId::Compute,
            edge::provision_compute(provider, ctx, &net, &script)
        );
        run_stage!(
            StageId::EdgeBinding,
            edge::bind_edge(
                provider,
                &lb.target_group.id,
                &instance.id,
                instance_provenance,
                &distribution.domain,
            )
        );

        let summary = DeploymentSummary {
            generated_at: chrono::Utc::now(),
            project: ctx.project.clone(),
            account_id: ctx.account_id.clone(),
            region: ctx.region.clone(),
            bucket: storage.bucket.name,
            vpc_id: net.vpc.id,
            public_subnet_ids: net.public_subnets.iter().map(|s| s.id.clone()).collect(),
            private_subnet_ids: net.private_subnets.iter().map(|s| s.id.clone()).collect(),
            load_balancer_endpoint: lb.domain,
            distribution_domain: distribution.domain,
            instance_id: instance.id,
            collection_endpoint: vector.collection.endpoint.unwrap_or_default(),
            knowledge_base_id: kb.knowledge_base.id,
            elapsed_seconds: started.elapsed().as_secs(),
        };
        info!(
            elapsed = summary.elapsed_seconds,
            url = %summary.sharing_url(),
            "deployment complete"
        );
        Ok(summary)
    }

    /// Re-run only the instance bootstrap against an existing deployment.
    ///
    /// The target comes from the explicit id when given, then the summary,
    /// then a lookup by the derived instance name. The script's environment
    /// is taken from the summary when present and re-resolved from the
    /// provider otherwise. Returns the instance id that was bootstrapped.
    pub async fn bootstrap_only(
        &self,
        instance_id: Option<&str>,
        summary: Option<&DeploymentSummary>,
    ) -> Result<String, StageError> {
        let wrap = |e| StageError::new(StageId::Compute, ResourceKind::Instance, e);
        let registry = Registry::new(self.provider);

        let instance_id = match (instance_id, summary) {
            (Some(id), _) => id.to_string(),
            (None, Some(summary)) => summary.instance_id.clone(),
            (None, None) => {
                registry
                    .expect(ResourceKind::Instance, &self.ctx.instance_name())
                    .await
                    .map_err(wrap)?
                    .id
            }
        };

        let (bucket, knowledge_base_id, collection_endpoint) = match summary {
            Some(summary) => (
                summary.bucket.clone(),
                summary.knowledge_base_id.clone(),
                summary.collection_endpoint.clone(),
            ),
            None => {
                let kb = registry
                    .expect(ResourceKind::KnowledgeBase, &self.ctx.knowledge_base_name())
                    .await
                    .map_err(|e| {
                        StageError::new(StageId::KnowledgeBase, ResourceKind::KnowledgeBase, e)
                    })?;
                let collection = self
                    .provider
                    .collection_status(&self.ctx.collection_name())
                    .await
                    .map_err(|e| {
                        StageError::new(StageId::VectorStore, ResourceKind::Collection, e)
                    })?;
                let endpoint = collection.endpoint.ok_or_else(|| {
                    StageError::new(
                        StageId::VectorStore,
                        ResourceKind::Collection,
                        ProviderError::precondition(
                            "collection has no endpoint yet; run a full deploy first",
                        ),
                    )
                })?;
                (self.ctx.bucket_name(), kb.id, endpoint)
            }
        };

        let script = bootstrap::render_setup_script(
            &self.ctx,
            &bucket,
            &knowledge_base_id,
            &collection_endpoint,
        );
        bootstrap::run(self.provider, &instance_id, &script).await?;
        Ok(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;
    use stack_common::ProviderError;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_deploy_produces_a_complete_summary() {
        let cloud = FakeCloud::new();
        let summary = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        assert_eq!(summary.bucket, "storage-for-es-us-123456789012-us-west-2");
        assert_eq!(summary.public_subnet_ids.len(), 2);
        assert_eq!(summary.private_subnet_ids.len(), 2);
        assert!(!summary.instance_id.is_empty());
        assert!(!summary.knowledge_base_id.is_empty());
        assert!(summary.sharing_url().starts_with("https://"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_converged_rerun_makes_no_mutations() {
        let cloud = FakeCloud::new();
        Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        let before = cloud.mutation_count();
        Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        assert_eq!(cloud.mutation_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_halts_and_names_the_stage() {
        let cloud = FakeCloud::new();
        cloud.inject_error("create_collection", ProviderError::other("boom"));
        let err = Sequencer::new(&cloud, ctx()).deploy().await.unwrap_err();
        assert_eq!(err.stage, StageId::VectorStore);
        // Nothing past the failed stage ran.
        assert!(!cloud
            .mutation_log()
            .iter()
            .any(|m| m.starts_with("create_load_balancer")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_only_resolves_the_instance_by_name() {
        let cloud = FakeCloud::new();
        let summary = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        let before = cloud.mutation_count();
        // No summary and no explicit id: the instance and the script's
        // environment are re-resolved from the provider.
        let bootstrapped = Sequencer::new(&cloud, ctx())
            .bootstrap_only(None, None)
            .await
            .unwrap();
        assert_eq!(bootstrapped, summary.instance_id);
        let log = cloud.mutation_log();
        assert_eq!(log.len(), before + 1);
        assert!(log.last().unwrap().starts_with("send_command"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_only_prefers_an_explicit_instance_id() {
        let cloud = FakeCloud::new();
        let summary = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        let bootstrapped = Sequencer::new(&cloud, ctx())
            .bootstrap_only(Some("i-override"), Some(&summary))
            .await
            .unwrap();
        assert_eq!(bootstrapped, "i-override");
        assert!(cloud
            .mutation_log()
            .iter()
            .any(|m| m == "send_command i-override"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_run_converges_on_retry() {
        let cloud = FakeCloud::new();
        cloud.inject_error("create_nat_gateway", ProviderError::transient("blip"));
        let first = Sequencer::new(&cloud, ctx()).deploy().await;
        assert!(first.is_err());
        let summary = Sequencer::new(&cloud, ctx()).deploy().await.unwrap();
        assert!(!summary.vpc_id.is_empty());
        // The retry adopted the vpc instead of creating a second one.
        assert_eq!(
            cloud
                .mutation_log()
                .iter()
                .filter(|m| m.starts_with("create_address_space"))
                .count(),
            1
        );
    }
}
