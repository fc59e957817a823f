//! Resource handles: the identifier/state tuple every provisioner produces.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every category of resource the orchestrator can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Bucket,
    Role,
    Secret,
    SearchPolicy,
    Collection,
    VectorIndex,
    KnowledgeBase,
    Vpc,
    Subnet,
    InternetGateway,
    NatGateway,
    RouteTable,
    SecurityGroup,
    VpcEndpoint,
    LoadBalancer,
    TargetGroup,
    Listener,
    Distribution,
    Instance,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Bucket => "bucket",
            ResourceKind::Role => "role",
            ResourceKind::Secret => "secret",
            ResourceKind::SearchPolicy => "search-policy",
            ResourceKind::Collection => "collection",
            ResourceKind::VectorIndex => "vector-index",
            ResourceKind::KnowledgeBase => "knowledge-base",
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::InternetGateway => "internet-gateway",
            ResourceKind::NatGateway => "nat-gateway",
            ResourceKind::RouteTable => "route-table",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::VpcEndpoint => "vpc-endpoint",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::TargetGroup => "target-group",
            ResourceKind::Listener => "listener",
            ResourceKind::Distribution => "distribution",
            ResourceKind::Instance => "instance",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle state of an externally provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Absent,
    Creating,
    Ready,
    Failed,
}

/// Identifier tuple for one provisioned resource.
///
/// Handles are owned by the provisioner that created them and read-only for
/// everyone downstream. A handle that reached `Ready` is never mutated; if a
/// resource must be provisioned again a new handle is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    /// External name, derived from the project context.
    pub name: String,
    /// Provider-assigned identifier (id, ARN, or the name itself for
    /// resources the provider addresses by name).
    pub id: String,
    /// Endpoint, DNS name, or URL where one exists for the kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub state: ResourceState,
}

impl ResourceHandle {
    pub fn ready(kind: ResourceKind, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: id.into(),
            endpoint: None,
            state: ResourceState::Ready,
        }
    }

    pub fn creating(kind: ResourceKind, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: id.into(),
            endpoint: None,
            state: ResourceState::Creating,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn is_ready(&self) -> bool {
        self.state == ResourceState::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_builder() {
        let handle = ResourceHandle::ready(ResourceKind::Vpc, "vpc-for-demo", "vpc-0abc")
            .with_endpoint("https://example.test");
        assert!(handle.is_ready());
        assert_eq!(handle.endpoint.as_deref(), Some("https://example.test"));
    }

    #[test]
    fn test_kind_display_is_kebab_case() {
        assert_eq!(ResourceKind::KnowledgeBase.to_string(), "knowledge-base");
        assert_eq!(ResourceKind::NatGateway.to_string(), "nat-gateway");
    }
}
