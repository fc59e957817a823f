//! Vector store stage: serverless search policies, the collection, and the
//! k-NN index the knowledge base writes into.
//!
//! The three policies are independent and are written concurrently; the
//! collection cannot be created until the encryption policy exists, and the
//! index cannot be created until the collection is active, so those two
//! steps stay sequential.

use crate::conflict::create_or_reuse;
use crate::poller::{self, PollOutcome};
use crate::provider::{CloudProvider, SearchPolicyKind, VectorIndexSpec};
use crate::registry::Registry;
use futures::future::try_join_all;
use serde_json::{json, Value};
use stack_common::{
    ErrorClass, ProjectContext, ResourceHandle, ResourceKind, StageError, StageId,
};
use tracing::info;

/// Embedding width of the model the knowledge base uses.
pub const VECTOR_DIMENSION: u32 = 1024;

pub struct VectorStoreOutputs {
    /// Active collection, endpoint populated.
    pub collection: ResourceHandle,
    pub index_name: String,
}

pub async fn provision(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
    data_access_principals: &[String],
) -> Result<VectorStoreOutputs, StageError> {
    let policy_wrap = |e| StageError::new(StageId::VectorStore, ResourceKind::SearchPolicy, e);

    let specs = vec![
        (
            ctx.encryption_policy_name(),
            SearchPolicyKind::Encryption,
            encryption_policy(ctx),
        ),
        (
            ctx.network_policy_name(),
            SearchPolicyKind::Network,
            network_policy(ctx),
        ),
        (
            ctx.data_policy_name(),
            SearchPolicyKind::DataAccess,
            data_access_policy(ctx, data_access_principals),
        ),
    ];
    let writes = specs.into_iter().map(|(name, kind, document)| async move {
        create_or_reuse(provider, ResourceKind::SearchPolicy, &name, || {
            provider.put_search_policy(&name, kind, document)
        })
        .await
    });
    try_join_all(writes).await.map_err(policy_wrap)?;

    let collection_wrap = |e| StageError::new(StageId::VectorStore, ResourceKind::Collection, e);
    let collection_name = ctx.collection_name();
    let (collection, _) =
        create_or_reuse(provider, ResourceKind::Collection, &collection_name, || {
            provider.create_collection(&collection_name)
        })
        .await
        .map_err(collection_wrap)?;

    // Collections take minutes to activate; the endpoint only appears once
    // they do.
    let name_ref = collection_name.as_str();
    let collection = poller::await_ready(
        &format!("collection {collection_name}"),
        poller::COLLECTION,
        || async move {
            let status = provider.collection_status(name_ref).await?;
            Ok(if status.is_ready() && status.endpoint.is_some() {
                PollOutcome::Ready(status)
            } else {
                PollOutcome::Pending
            })
        },
    )
    .await
    .map_err(collection_wrap)?;

    let index_wrap = |e| StageError::new(StageId::VectorStore, ResourceKind::VectorIndex, e);
    let index_name = ctx.vector_index_name();
    let registry = Registry::new(provider);
    if registry
        .resolve(ResourceKind::VectorIndex, &index_name)
        .await
        .map_err(index_wrap)?
        .is_none()
    {
        let endpoint = collection.endpoint.as_deref().unwrap_or_default();
        let spec = VectorIndexSpec {
            name: index_name.clone(),
            dimension: VECTOR_DIMENSION,
        };
        match provider.create_vector_index(endpoint, &spec).await {
            Ok(()) => {}
            // The index is invisible to by-name lookup on some providers, so
            // a duplicate create is how reuse shows up.
            Err(err) if err.is(ErrorClass::AlreadyExists) => {}
            Err(err) => return Err(index_wrap(err)),
        }
    }

    info!(collection = %collection.name, index = %index_name, "vector store stage complete");
    Ok(VectorStoreOutputs {
        collection,
        index_name,
    })
}

fn encryption_policy(ctx: &ProjectContext) -> Value {
    json!({
        "Rules": [{
            "ResourceType": "collection",
            "Resource": [format!("collection/{}", ctx.collection_name())]
        }],
        "AWSOwnedKey": true
    })
}

fn network_policy(ctx: &ProjectContext) -> Value {
    json!([{
        "Rules": [
            {
                "ResourceType": "collection",
                "Resource": [format!("collection/{}", ctx.collection_name())]
            },
            {
                "ResourceType": "dashboard",
                "Resource": [format!("collection/{}", ctx.collection_name())]
            }
        ],
        "AllowFromPublic": true
    }])
}

fn data_access_policy(ctx: &ProjectContext, principals: &[String]) -> Value {
    json!([{
        "Rules": [
            {
                "ResourceType": "collection",
                "Resource": [format!("collection/{}", ctx.collection_name())],
                "Permission": ["aoss:*"]
            },
            {
                "ResourceType": "index",
                "Resource": [format!("index/{}/*", ctx.collection_name())],
                "Permission": ["aoss:*"]
            }
        ],
        "Principal": principals
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    fn principals() -> Vec<String> {
        vec!["arn:fake:iam::role/kb".into()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisions_policies_collection_and_index() {
        let cloud = FakeCloud::new();
        let outputs = provision(&cloud, &ctx(), &principals()).await.unwrap();
        assert_eq!(outputs.collection.name, "es-us");
        assert!(outputs.collection.endpoint.is_some());
        assert_eq!(outputs.index_name, "es-us-index");
        let log = cloud.mutation_log();
        assert_eq!(
            log.iter().filter(|m| m.starts_with("put_search_policy")).count(),
            3
        );
        assert!(log.iter().any(|m| m.contains("create_collection es-us")));
        assert!(log.iter().any(|m| m.contains("create_vector_index es-us-index dim=1024")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_slow_collection_activation() {
        let cloud = FakeCloud::new();
        // Activation takes a few polls; the id is assigned on create, so
        // preload the countdown after creating through a first run attempt.
        let collection = cloud.create_collection("es-us").await.unwrap();
        cloud.set_ready_after(ResourceKind::Collection, &collection.id, 5);
        let outputs = provision(&cloud, &ctx(), &principals()).await.unwrap();
        assert!(outputs.collection.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_makes_no_mutations() {
        let cloud = FakeCloud::new();
        provision(&cloud, &ctx(), &principals()).await.unwrap();
        let before = cloud.mutation_count();
        provision(&cloud, &ctx(), &principals()).await.unwrap();
        assert_eq!(cloud.mutation_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_index_create_is_treated_as_reuse() {
        let cloud = FakeCloud::new();
        // A provider that cannot list indexes reports a duplicate create
        // instead; that must not fail the stage.
        cloud.inject_error(
            "create_vector_index",
            stack_common::ProviderError::already_exists("es-us-index"),
        );
        let outputs = provision(&cloud, &ctx(), &principals()).await.unwrap();
        assert_eq!(outputs.index_name, "es-us-index");
    }
}
