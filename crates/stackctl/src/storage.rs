//! Bucket stage: the content bucket everything else hangs off.

use crate::conflict::{create_or_reuse, Provenance};
use crate::provider::CloudProvider;
use serde_json::json;
use stack_common::{ProjectContext, ResourceHandle, ResourceKind, StageError, StageId};
use tracing::info;

pub struct StorageOutputs {
    pub bucket: ResourceHandle,
}

/// Create or adopt the content bucket. On reuse the transport-security
/// policy is applied only if it is actually missing, so a converged re-run
/// issues no writes while an interrupted one still converges.
pub async fn provision(
    provider: &dyn CloudProvider,
    ctx: &ProjectContext,
) -> Result<StorageOutputs, StageError> {
    let name = ctx.bucket_name();
    let wrap = |e| StageError::new(StageId::Bucket, ResourceKind::Bucket, e);

    let (bucket, provenance) = create_or_reuse(provider, ResourceKind::Bucket, &name, || {
        provider.create_bucket(&name)
    })
    .await
    .map_err(wrap)?;

    let needs_policy = provenance == Provenance::Created
        || !provider.bucket_has_policy(&name).await.map_err(wrap)?;
    if needs_policy {
        provider
            .put_bucket_policy(&name, transport_security_policy(&name))
            .await
            .map_err(wrap)?;
    }
    info!(bucket = %bucket.name, "bucket stage complete");
    Ok(StorageOutputs { bucket })
}

/// Deny any access that does not arrive over TLS.
fn transport_security_policy(bucket: &str) -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "DenyInsecureTransport",
            "Effect": "Deny",
            "Principal": "*",
            "Action": "s3:*",
            "Resource": [
                format!("arn:aws:s3:::{bucket}"),
                format!("arn:aws:s3:::{bucket}/*")
            ],
            "Condition": { "Bool": { "aws:SecureTransport": "false" } }
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    #[tokio::test]
    async fn test_fresh_bucket_gets_created_with_policy() {
        let cloud = FakeCloud::new();
        let outputs = provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(outputs.bucket.name, "storage-for-es-us-123456789012-us-west-2");
        let log = cloud.mutation_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("create_bucket"));
        assert!(log[1].starts_with("put_bucket_policy"));
    }

    #[tokio::test]
    async fn test_existing_bucket_rerun_makes_no_mutations() {
        let cloud = FakeCloud::new();
        provision(&cloud, &ctx()).await.unwrap();
        let before = cloud.mutation_count();
        provision(&cloud, &ctx()).await.unwrap();
        assert_eq!(cloud.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_adopted_bucket_without_policy_gets_one() {
        let cloud = FakeCloud::new();
        // A run that died between the create and the policy write.
        cloud
            .create_bucket("storage-for-es-us-123456789012-us-west-2")
            .await
            .unwrap();
        provision(&cloud, &ctx()).await.unwrap();
        let log = cloud.mutation_log();
        assert!(log.iter().any(|m| m.starts_with("put_bucket_policy")));
    }
}
