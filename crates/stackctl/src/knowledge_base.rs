//! Knowledge base stage: binds the embedding model, the vector index, and
//! the content bucket together.

use crate::conflict::{create_or_reuse, Provenance};
use crate::poller;
use crate::provider::{ChunkingConfig, CloudProvider, KnowledgeBaseSpec};
use stack_common::{ProjectContext, ResourceHandle, ResourceKind, StageError, StageId};
use tracing::info;

/// Hierarchical chunking sizes, in tokens.
pub const CHUNKING: ChunkingConfig = ChunkingConfig {
    parent_tokens: 1500,
    child_tokens: 300,
    overlap_tokens: 60,
};

pub struct KnowledgeBaseOutputs {
    pub knowledge_base: ResourceHandle,
}

pub async fn provision(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
    bucket: &str,
    role_id: &str,
    collection_id: &str,
    index_name: &str,
) -> Result<KnowledgeBaseOutputs, StageError> {
    let wrap = |e| StageError::new(StageId::KnowledgeBase, ResourceKind::KnowledgeBase, e);

    let name = ctx.knowledge_base_name();
    let spec = KnowledgeBaseSpec {
        name: name.clone(),
        role_id: role_id.to_string(),
        collection_id: collection_id.to_string(),
        index_name: index_name.to_string(),
        embedding_model: format!(
            "arn:aws:bedrock:{}::foundation-model/amazon.titan-embed-text-v2:0",
            ctx.region
        ),
        parsing_model: format!(
            "arn:aws:bedrock:{}::foundation-model/amazon.nova-lite-v1:0",
            ctx.region
        ),
        chunking: CHUNKING,
    };

    let (knowledge_base, provenance) =
        create_or_reuse(provider, ResourceKind::KnowledgeBase, &name, || {
            provider.create_knowledge_base(&spec)
        })
        .await
        .map_err(wrap)?;

    // An interrupted run can leave the knowledge base mid-activation, so
    // readiness is checked on the reuse path too.
    if !knowledge_base.is_ready() {
        poller::await_state(
            provider,
            ResourceKind::KnowledgeBase,
            &knowledge_base.id,
            poller::KNOWLEDGE_BASE,
        )
        .await
        .map_err(wrap)?;
    }
    // On reuse the data source is probed for and backfilled when missing;
    // an interrupted run can have created the knowledge base without it.
    let needs_data_source = provenance == Provenance::Created
        || !provider
            .data_source_exists(&knowledge_base.id, bucket)
            .await
            .map_err(wrap)?;
    if needs_data_source {
        provider
            .create_data_source(&knowledge_base.id, bucket)
            .await
            .map_err(wrap)?;
    }

    info!(knowledge_base = %knowledge_base.id, "knowledge base stage complete");
    Ok(KnowledgeBaseOutputs { knowledge_base })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_creates_knowledge_base_and_data_source() {
        let cloud = FakeCloud::new();
        let outputs = provision(&cloud, &ctx(), "bucket", "role-arn", "col-arn", "es-us-index")
            .await
            .unwrap();
        assert_eq!(outputs.knowledge_base.name, "kb-for-es-us");
        let log = cloud.mutation_log();
        assert!(log.iter().any(|m| m.starts_with("create_knowledge_base kb-for-es-us")));
        assert!(log.iter().any(|m| m.starts_with("create_data_source")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_slow_activation() {
        let cloud = FakeCloud::new();
        let kb = cloud
            .create_knowledge_base(&KnowledgeBaseSpec {
                name: "kb-for-es-us".into(),
                role_id: "r".into(),
                collection_id: "c".into(),
                index_name: "i".into(),
                embedding_model: "m".into(),
                parsing_model: "p".into(),
                chunking: CHUNKING,
            })
            .await
            .unwrap();
        cloud.set_ready_after(ResourceKind::KnowledgeBase, &kb.id, 3);
        let outputs = provision(&cloud, &ctx(), "bucket", "r", "c", "i").await;
        assert!(outputs.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopted_knowledge_base_without_data_source_gets_one() {
        let cloud = FakeCloud::new();
        // A run that died after creating the knowledge base but before
        // attaching the bucket.
        cloud
            .create_knowledge_base(&KnowledgeBaseSpec {
                name: "kb-for-es-us".into(),
                role_id: "r".into(),
                collection_id: "c".into(),
                index_name: "i".into(),
                embedding_model: "m".into(),
                parsing_model: "p".into(),
                chunking: CHUNKING,
            })
            .await
            .unwrap();
        provision(&cloud, &ctx(), "bucket", "r", "c", "i").await.unwrap();
        let log = cloud.mutation_log();
        assert_eq!(
            log.iter().filter(|m| m.starts_with("create_knowledge_base")).count(),
            1
        );
        assert!(log.iter().any(|m| m.starts_with("create_data_source")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_makes_no_mutations() {
        let cloud = FakeCloud::new();
        provision(&cloud, &ctx(), "bucket", "r", "c", "i").await.unwrap();
        let before = cloud.mutation_count();
        provision(&cloud, &ctx(), "bucket", "r", "c", "i").await.unwrap();
        assert_eq!(cloud.mutation_count(), before);
    }
}
