//! Create-or-reuse and name-collision resolution.
//!
//! Every provisioner funnels resource creation through [`create_or_reuse`]
//! so a re-run adopts what already exists instead of duplicating it, and
//! through [`create_address_space`] when the resource competes for a global
//! address range and may need to fall back to an alternate candidate.

use crate::provider::{CloudProvider, ProviderResult};
use crate::registry::Registry;
use stack_common::{
    CidrBlock, ErrorClass, ProviderError, ResourceHandle, ResourceKind, CANDIDATE_BLOCKS,
};
use std::future::Future;
use tracing::{debug, info};

/// Whether the returned handle came from a fresh create or an adoption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Created,
    Reused,
}

/// Look the resource up by name first and adopt it when present; otherwise
/// create it. A create that loses a race (`AlreadyExists`) falls back to a
/// second lookup so both contenders converge on the same handle.
pub async fn create_or_reuse<F, Fut>(
    provider: &dyn CloudProvider,
    kind: ResourceKind,
    name: &str,
    create: F,
) -> ProviderResult<(ResourceHandle, Provenance)>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ProviderResult<ResourceHandle>>,
{
    let registry = Registry::new(provider);
    if let Some(existing) = registry.resolve(kind, name).await? {
        debug!(%kind, name, id = %existing.id, "reusing existing resource");
        return Ok((existing, Provenance::Reused));
    }
    match create().await {
        Ok(handle) => {
            info!(%kind, name, id = %handle.id, "created");
            Ok((handle, Provenance::Created))
        }
        Err(err) if err.is(ErrorClass::AlreadyExists) => {
            let adopted = registry.expect(kind, name).await?;
            debug!(%kind, name, id = %adopted.id, "lost create race, adopted");
            Ok((adopted, Provenance::Reused))
        }
        Err(err) => Err(err),
    }
}

/// Create the address space, walking the fixed candidate list until a block
/// neither overlaps an already claimed range nor is rejected by the
/// provider. Exhausting every candidate is a quota failure, not a retry
/// case.
pub async fn create_address_space(
    provider: &dyn CloudProvider,
    name: &str,
) -> ProviderResult<(ResourceHandle, CidrBlock)> {
    let claimed = provider.claimed_address_blocks().await?;
    for candidate in CANDIDATE_BLOCKS {
        let block: CidrBlock = candidate
            .parse()
            .map_err(|e| ProviderError::other(format!("bad candidate block {candidate}: {e}")))?;
        if let Some(taken) = claimed.iter().find(|c| c.overlaps(&block)) {
            debug!(%block, %taken, "candidate overlaps a claimed block, skipping");
            continue;
        }
        match provider.create_address_space(name, block).await {
            Ok(handle) => {
                info!(%block, id = %handle.id, "address space created");
                return Ok((handle, block));
            }
            // Claimed behind our back between the listing and the create.
            Err(err) if err.is(ErrorClass::AlreadyExists) => {
                debug!(%block, "candidate rejected by provider, trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    Err(ProviderError::quota_exhausted(format!(
        "all {} candidate address blocks are taken",
        CANDIDATE_BLOCKS.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;

    #[tokio::test]
    async fn test_existing_resource_is_reused_without_mutation() {
        let cloud = FakeCloud::new();
        cloud.preload(ResourceHandle::ready(ResourceKind::Bucket, "b", "b"));
        let (handle, provenance) =
            create_or_reuse(&cloud, ResourceKind::Bucket, "b", || cloud.create_bucket("b"))
                .await
                .unwrap();
        assert_eq!(provenance, Provenance::Reused);
        assert_eq!(handle.id, "b");
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_resource_is_created() {
        let cloud = FakeCloud::new();
        let (_, provenance) =
            create_or_reuse(&cloud, ResourceKind::Bucket, "b", || cloud.create_bucket("b"))
                .await
                .unwrap();
        assert_eq!(provenance, Provenance::Created);
        assert_eq!(cloud.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_create_race_adopts_the_winner() {
        let cloud = FakeCloud::new();
        let cloud_ref = &cloud;
        let (handle, provenance) = create_or_reuse(cloud_ref, ResourceKind::Vpc, "v", || async move {
            // Simulate another writer getting in between lookup and create.
            cloud_ref.preload(ResourceHandle::ready(ResourceKind::Vpc, "v", "vpc-race"));
            Err(ProviderError::already_exists("vpc v"))
        })
        .await
        .unwrap();
        assert_eq!(provenance, Provenance::Reused);
        assert_eq!(handle.id, "vpc-race");
    }

    #[tokio::test]
    async fn test_first_free_candidate_block_wins() {
        let cloud = FakeCloud::new();
        cloud.claim_block("10.20.0.0/16".parse().unwrap());
        cloud.claim_block("10.21.0.0/16".parse().unwrap());
        let (_, block) = create_address_space(&cloud, "vpc-for-demo").await.unwrap();
        assert_eq!(block.to_string(), "10.22.0.0/16");
    }

    #[tokio::test]
    async fn test_exhausting_every_candidate_is_quota_exhausted() {
        let cloud = FakeCloud::new();
        for candidate in CANDIDATE_BLOCKS {
            cloud.claim_block(candidate.parse().unwrap());
        }
        let err = create_address_space(&cloud, "vpc-for-demo").await.unwrap_err();
        assert!(err.is(ErrorClass::QuotaExhausted));
        // Overlap screening means no create was ever attempted.
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_side_conflict_falls_through_to_next_candidate() {
        let cloud = FakeCloud::new();
        cloud.inject_error("create_address_space", ProviderError::already_exists("taken"));
        let (_, block) = create_address_space(&cloud, "vpc-for-demo").await.unwrap();
        assert_eq!(block.to_string(), "10.21.0.0/16");
    }
}
