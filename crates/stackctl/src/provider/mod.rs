//! Cloud provider boundary.
//!
//! Everything the orchestrator asks of the cloud goes through the
//! [`CloudProvider`] trait so the engine can be driven against a fake in
//! tests. Production code uses [`CliCloud`], which shells out to the vendor
//! CLI and parses its JSON output; provider failures are classified into
//! the closed [`stack_common::ErrorClass`] set exactly once, at this
//! boundary.

mod cli;
mod fake;

pub use cli::CliCloud;
pub use fake::FakeCloud;

use async_trait::async_trait;
use stack_common::{CidrBlock, ProviderError, ResourceHandle, ResourceKind, ResourceState};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Source of traffic allowed by an ingress rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressSource {
    /// 0.0.0.0/0
    Anywhere,
    /// Another security group, by id.
    Group(String),
    /// An address block.
    Block(CidrBlock),
}

/// One ingress rule of a security group. Everything is tcp here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub port: u16,
    pub source: IngressSource,
}

/// Where a route table's default route points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    InternetGateway(String),
    NatGateway(String),
}

/// The three policy types a serverless search collection requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPolicyKind {
    Encryption,
    Network,
    DataAccess,
}

impl SearchPolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchPolicyKind::Encryption => "encryption",
            SearchPolicyKind::Network => "network",
            SearchPolicyKind::DataAccess => "data",
        }
    }
}

/// Schema for the k-nearest-neighbor vector index inside a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorIndexSpec {
    pub name: String,
    pub dimension: u32,
}

/// Binding of models, chunking, and storage that defines a knowledge base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeBaseSpec {
    pub name: String,
    pub role_id: String,
    pub collection_id: String,
    pub index_name: String,
    pub embedding_model: String,
    pub parsing_model: String,
    pub chunking: ChunkingConfig,
}

/// Hierarchical chunking: two token-size tiers plus overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub parent_tokens: u32,
    pub child_tokens: u32,
    pub overlap_tokens: u32,
}

/// CDN distribution with a dynamic origin (load balancer) and a static
/// origin (storage bucket) selected by path patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionSpec {
    pub comment: String,
    pub load_balancer_domain: String,
    pub bucket_domain: String,
    /// Shared-secret header added to every forwarded request.
    pub custom_header: (String, String),
    /// Path prefixes served from the bucket origin.
    pub static_patterns: Vec<String>,
}

/// Launch parameters for the application compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub security_group_id: String,
    pub instance_profile: String,
}

/// Terminal and non-terminal states of a remotely executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CommandStatus {
    #[default]
    InProgress,
    Success,
    Failed(String),
}

/// The full set of provider operations the orchestrator uses.
///
/// Read-only probes (`lookup`, `*_state`, `availability_zones`, ...) never
/// mutate provider state; provisioners rely on that to guarantee the
/// zero-mutation property of already-converged stages.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    // --- read-only probes ---

    /// Find a resource of `kind` bearing the derived `name`. Absence is
    /// `Ok(None)`, never an error; a lookup outage is a `Transient` error.
    async fn lookup(&self, kind: ResourceKind, name: &str) -> ProviderResult<Option<ResourceHandle>>;

    /// Current lifecycle state of a resource, by provider id.
    async fn resource_state(&self, kind: ResourceKind, id: &str) -> ProviderResult<ResourceState>;

    /// Names of the availability zones to spread subnets across.
    async fn availability_zones(&self) -> ProviderResult<Vec<String>>;

    /// Address blocks already claimed by existing address spaces.
    async fn claimed_address_blocks(&self) -> ProviderResult<Vec<CidrBlock>>;

    /// The block an existing address space was created with.
    async fn address_space_block(&self, vpc_id: &str) -> ProviderResult<CidrBlock>;

    /// Whether the subnet's route table has a default route through an
    /// internet gateway (the definition of "public").
    async fn has_internet_route(&self, subnet_id: &str) -> ProviderResult<bool>;

    /// Whether the subnet's route table has any default route at all,
    /// internet gateway or NAT gateway.
    async fn has_default_route(&self, subnet_id: &str) -> ProviderResult<bool>;

    /// Whether the bucket carries a bucket policy.
    async fn bucket_has_policy(&self, bucket: &str) -> ProviderResult<bool>;

    /// Whether the role carries the named inline policy.
    async fn role_has_inline_policy(&self, role_name: &str, policy_name: &str)
        -> ProviderResult<bool>;

    /// Whether the instance profile exists.
    async fn instance_profile_exists(&self, name: &str) -> ProviderResult<bool>;

    /// Whether the knowledge base already has a data source for the bucket.
    async fn data_source_exists(&self, knowledge_base_id: &str, bucket: &str)
        -> ProviderResult<bool>;

    /// Whether the load balancer has any listener attached.
    async fn listener_exists(&self, load_balancer_id: &str) -> ProviderResult<bool>;

    /// Whether the instance is registered with the target group.
    async fn target_registered(&self, target_group_id: &str, instance_id: &str)
        -> ProviderResult<bool>;

    /// The elastic address allocation backing a NAT gateway, if any.
    async fn nat_gateway_allocation(&self, nat_id: &str) -> ProviderResult<Option<String>>;

    /// Collection state and endpoint, by collection name.
    async fn collection_status(&self, name: &str) -> ProviderResult<ResourceHandle>;

    /// Whether the bootstrap command channel on the instance is reachable.
    async fn agent_ready(&self, instance_id: &str) -> ProviderResult<bool>;

    /// Status of a previously issued remote command.
    async fn command_status(&self, command_id: &str, instance_id: &str)
        -> ProviderResult<CommandStatus>;

    /// Whether the deployed application answers on its health endpoint.
    async fn http_ready(&self, url: &str) -> ProviderResult<bool>;

    /// Whether the instance has a public address assigned.
    async fn instance_has_public_address(&self, instance_id: &str) -> ProviderResult<bool>;

    /// Subnet id an instance is placed in.
    async fn instance_subnet(&self, instance_id: &str) -> ProviderResult<String>;

    // --- storage ---

    /// Create the content bucket with its public-access block and CORS
    /// settings applied.
    async fn create_bucket(&self, name: &str) -> ProviderResult<ResourceHandle>;

    async fn put_bucket_policy(&self, bucket: &str, policy: serde_json::Value)
        -> ProviderResult<()>;

    // --- identity ---

    async fn create_role(
        &self,
        name: &str,
        trust_services: &[String],
        managed_policies: &[String],
    ) -> ProviderResult<ResourceHandle>;

    /// Create-or-update an inline policy on a role.
    async fn put_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: serde_json::Value,
    ) -> ProviderResult<()>;

    async fn create_instance_profile(&self, name: &str, role_name: &str) -> ProviderResult<()>;

    async fn delete_instance_profile(&self, name: &str, role_name: &str) -> ProviderResult<()>;

    async fn create_secret(
        &self,
        name: &str,
        description: &str,
        value: serde_json::Value,
    ) -> ProviderResult<ResourceHandle>;

    // --- vector store ---

    async fn put_search_policy(
        &self,
        name: &str,
        kind: SearchPolicyKind,
        document: serde_json::Value,
    ) -> ProviderResult<ResourceHandle>;

    async fn create_collection(&self, name: &str) -> ProviderResult<ResourceHandle>;

    async fn create_vector_index(
        &self,
        collection_endpoint: &str,
        spec: &VectorIndexSpec,
    ) -> ProviderResult<()>;

    // --- knowledge base ---

    async fn create_knowledge_base(&self, spec: &KnowledgeBaseSpec)
        -> ProviderResult<ResourceHandle>;

    async fn create_data_source(&self, knowledge_base_id: &str, bucket: &str)
        -> ProviderResult<ResourceHandle>;

    // --- network ---

    async fn create_address_space(&self, name: &str, cidr: CidrBlock)
        -> ProviderResult<ResourceHandle>;

    async fn create_subnet(
        &self,
        name: &str,
        vpc_id: &str,
        cidr: CidrBlock,
        availability_zone: &str,
    ) -> ProviderResult<ResourceHandle>;

    /// Create the internet gateway and attach it to the address space.
    async fn create_internet_gateway(&self, name: &str, vpc_id: &str)
        -> ProviderResult<ResourceHandle>;

    /// Create the NAT gateway (including its public address) in a public
    /// subnet. Returned handle is `Creating`; callers poll for readiness.
    async fn create_nat_gateway(&self, name: &str, subnet_id: &str)
        -> ProviderResult<ResourceHandle>;

    /// Create a route table with a default route to `target` and associate
    /// it with the given subnets.
    async fn route_subnets(
        &self,
        name: &str,
        vpc_id: &str,
        subnet_ids: &[String],
        target: RouteTarget,
    ) -> ProviderResult<()>;

    async fn create_security_group(
        &self,
        name: &str,
        vpc_id: &str,
        description: &str,
        rules: &[IngressRule],
    ) -> ProviderResult<ResourceHandle>;

    /// Interface endpoint for a managed service, placed in the given
    /// subnets behind the given security group.
    async fn create_service_endpoint(
        &self,
        name: &str,
        vpc_id: &str,
        service: &str,
        subnet_ids: &[String],
        security_group_id: &str,
    ) -> ProviderResult<ResourceHandle>;

    // --- edge / compute ---

    async fn create_load_balancer(
        &self,
        name: &str,
        subnet_ids: &[String],
        security_group_id: &str,
    ) -> ProviderResult<ResourceHandle>;

    async fn create_target_group(&self, name: &str, vpc_id: &str, port: u16)
        -> ProviderResult<ResourceHandle>;

    async fn create_listener(
        &self,
        load_balancer_id: &str,
        target_group_id: &str,
        port: u16,
        custom_header: &(String, String),
    ) -> ProviderResult<ResourceHandle>;

    async fn create_distribution(&self, spec: &DistributionSpec)
        -> ProviderResult<ResourceHandle>;

    /// Newest available base image for the compute instance.
    async fn latest_image_id(&self) -> ProviderResult<String>;

    async fn run_instance(&self, spec: &InstanceSpec) -> ProviderResult<ResourceHandle>;

    async fn register_target(
        &self,
        target_group_id: &str,
        instance_id: &str,
        port: u16,
    ) -> ProviderResult<()>;

    /// Run a script on the instance through the provider's command channel.
    /// Returns the command id for status polling.
    async fn send_command(&self, instance_id: &str, script: &str) -> ProviderResult<String>;

    // --- teardown ---

    /// Delete a resource by id. `NotFound` is surfaced to the caller, which
    /// treats it as already-absent success.
    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()>;

    /// Release an elastic address allocation once its NAT gateway is gone.
    async fn release_address(&self, allocation_id: &str) -> ProviderResult<()>;
}
