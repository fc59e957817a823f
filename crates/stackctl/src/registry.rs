//! Resource registry: name-based resolution against the provider.
//!
//! Provisioners never remember ids between runs; the registry re-resolves
//! every resource from its derived name, which is what makes re-runs
//! converge instead of duplicating. Lookups retry a bounded number of times
//! on transient provider errors before giving up.

use crate::provider::CloudProvider;
use stack_common::{ErrorClass, ProviderError, ResourceHandle, ResourceKind};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

const LOOKUP_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct Registry<'a> {
    provider: &'a dyn CloudProvider,
}

impl<'a> Registry<'a> {
    pub fn new(provider: &'a dyn CloudProvider) -> Self {
        Self { provider }
    }

    /// Resolve a resource by derived name. Absence is `Ok(None)`.
    pub async fn resolve(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ResourceHandle>, ProviderError> {
        let mut last = None;
        for attempt in 1..=LOOKUP_ATTEMPTS {
            match self.provider.lookup(kind, name).await {
                Ok(found) => return Ok(found),
                Err(err) if err.is(ErrorClass::Transient) && attempt < LOOKUP_ATTEMPTS => {
                    warn!(%kind, name, attempt, error = %err, "lookup failed, retrying");
                    last = Some(err);
                    sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
        // Unreachable unless the loop fell through on the last transient.
        Err(last.unwrap_or_else(|| ProviderError::other("lookup retries exhausted")))
    }

    /// Resolve a resource that must already exist.
    pub async fn expect(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<ResourceHandle, ProviderError> {
        self.resolve(kind, name).await?.ok_or_else(|| {
            ProviderError::not_found(format!("{kind} {name} does not exist"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeCloud;

    #[tokio::test(start_paused = true)]
    async fn test_resolve_retries_transient_lookup_failures() {
        let cloud = FakeCloud::new();
        cloud.preload(ResourceHandle::ready(ResourceKind::Vpc, "vpc-for-demo", "vpc-1"));
        cloud.inject_error("lookup", ProviderError::transient("throttled"));
        cloud.inject_error("lookup", ProviderError::transient("throttled"));
        let registry = Registry::new(&cloud);
        let found = registry.resolve(ResourceKind::Vpc, "vpc-for-demo").await.unwrap();
        assert_eq!(found.unwrap().id, "vpc-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_gives_up_after_bounded_attempts() {
        let cloud = FakeCloud::new();
        for _ in 0..3 {
            cloud.inject_error("lookup", ProviderError::transient("throttled"));
        }
        let registry = Registry::new(&cloud);
        let err = registry.resolve(ResourceKind::Vpc, "vpc-for-demo").await.unwrap_err();
        assert!(err.is(ErrorClass::Transient));
    }

    #[tokio::test]
    async fn test_expect_maps_absence_to_not_found() {
        let cloud = FakeCloud::new();
        let registry = Registry::new(&cloud);
        let err = registry.expect(ResourceKind::Bucket, "missing").await.unwrap_err();
        assert!(err.is(ErrorClass::NotFound));
        assert!(err.message.contains("missing"));
    }
}
