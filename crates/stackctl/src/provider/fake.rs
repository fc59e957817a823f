//! In-memory provider for tests.
//!
//! Holds resources in a map keyed by kind and name, records every mutating
//! call in a log, and exposes knobs for the scenarios the orchestrator has
//! to survive: slow-activating resources, injected failures, claimed
//! address blocks, and instances that ended up with the wrong placement.

use super::{
    CloudProvider, CommandStatus, DistributionSpec, IngressRule, InstanceSpec, KnowledgeBaseSpec,
    ProviderResult, RouteTarget, SearchPolicyKind, VectorIndexSpec,
};
use async_trait::async_trait;
use stack_common::{
    CidrBlock, ProviderError, ResourceHandle, ResourceKind, ResourceState,
};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    resources: HashMap<(ResourceKind, String), ResourceHandle>,
    /// Log of every mutating call, in order.
    mutations: Vec<String>,
    zones: Vec<String>,
    claimed_blocks: Vec<CidrBlock>,
    /// Per-resource countdown of state polls before it reports `Ready`.
    ready_after: HashMap<(ResourceKind, String), u32>,
    /// Pre-loaded errors popped by operation name before it runs.
    injected: HashMap<String, Vec<ProviderError>>,
    /// Subnet ids that have a default route through an internet gateway.
    public_subnets: Vec<String>,
    /// Subnet ids that have a default route through a NAT gateway.
    nat_routed_subnets: Vec<String>,
    agent_ready_after: u32,
    http_ready_after: u32,
    command_polls_in_progress: u32,
    command_result: CommandStatus,
    instance_profiles: Vec<String>,
    instances_with_public_address: Vec<String>,
    instance_subnets: HashMap<String, String>,
    vpc_blocks: HashMap<String, CidrBlock>,
    buckets_with_policy: Vec<String>,
    inline_policies: Vec<(String, String)>,
    /// (knowledge base id, bucket) pairs with a data source attached.
    data_sources: Vec<(String, String)>,
    /// Load balancer ids carrying a listener.
    load_balancers_with_listener: Vec<String>,
    /// (target group id, instance id) registrations.
    registered_targets: Vec<(String, String)>,
    /// NAT gateway id to elastic address allocation.
    nat_allocations: HashMap<String, String>,
    allocated_addresses: Vec<String>,
    next_id: u64,
}

pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    pub fn new() -> Self {
        let state = FakeState {
            zones: vec!["zone-a".into(), "zone-b".into()],
            command_result: CommandStatus::Success,
            ..FakeState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    // --- test knobs ---

    pub fn set_zones(&self, zones: &[&str]) {
        self.state.lock().unwrap().zones = zones.iter().map(|z| z.to_string()).collect();
    }

    /// Mark an address block as claimed by some pre-existing address space.
    pub fn claim_block(&self, block: CidrBlock) {
        self.state.lock().unwrap().claimed_blocks.push(block);
    }

    /// Make `resource_state` report `Creating` for the next `polls` calls.
    pub fn set_ready_after(&self, kind: ResourceKind, id: &str, polls: u32) {
        self.state
            .lock()
            .unwrap()
            .ready_after
            .insert((kind, id.to_string()), polls);
    }

    /// Queue an error to be returned by the next call to `operation`.
    pub fn inject_error(&self, operation: &str, error: ProviderError) {
        self.state
            .lock()
            .unwrap()
            .injected
            .entry(operation.to_string())
            .or_default()
            .push(error);
    }

    /// Insert a resource as if a previous run had created it.
    pub fn preload(&self, handle: ResourceHandle) {
        let mut state = self.state.lock().unwrap();
        state
            .resources
            .insert((handle.kind, handle.name.clone()), handle);
    }

    pub fn mark_subnet_public(&self, subnet_id: &str) {
        self.state
            .lock()
            .unwrap()
            .public_subnets
            .push(subnet_id.to_string());
    }

    pub fn set_agent_ready_after(&self, polls: u32) {
        self.state.lock().unwrap().agent_ready_after = polls;
    }

    pub fn set_http_ready_after(&self, polls: u32) {
        self.state.lock().unwrap().http_ready_after = polls;
    }

    pub fn set_command_outcome(&self, polls_in_progress: u32, result: CommandStatus) {
        let mut state = self.state.lock().unwrap();
        state.command_polls_in_progress = polls_in_progress;
        state.command_result = result;
    }

    pub fn give_instance_public_address(&self, instance_id: &str) {
        self.state
            .lock()
            .unwrap()
            .instances_with_public_address
            .push(instance_id.to_string());
    }

    pub fn place_instance(&self, instance_id: &str, subnet_id: &str) {
        self.state
            .lock()
            .unwrap()
            .instance_subnets
            .insert(instance_id.to_string(), subnet_id.to_string());
    }

    // --- test observers ---

    pub fn mutation_log(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().unwrap().mutations.len()
    }

    pub fn resource(&self, kind: ResourceKind, name: &str) -> Option<ResourceHandle> {
        self.state
            .lock()
            .unwrap()
            .resources
            .get(&(kind, name.to_string()))
            .cloned()
    }

    // --- internals ---

    fn take_injected(&self, operation: &str) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(queue) = state.injected.get_mut(operation) {
            if !queue.is_empty() {
                return Err(queue.remove(0));
            }
        }
        Ok(())
    }

    /// Record a mutation and insert the handle, rejecting duplicates the
    /// way the real provider does.
    fn create(&self, call: String, handle: ResourceHandle) -> ProviderResult<ResourceHandle> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(call);
        let key = (handle.kind, handle.name.clone());
        if state.resources.contains_key(&key) {
            return Err(ProviderError::already_exists(format!(
                "{} {} already exists",
                handle.kind, handle.name
            )));
        }
        state.resources.insert(key, handle.clone());
        Ok(handle)
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().mutations.push(call);
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("{prefix}-{:04}", state.next_id)
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn lookup(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> ProviderResult<Option<ResourceHandle>> {
        self.take_injected("lookup")?;
        Ok(self.resource(kind, name))
    }

    async fn resource_state(&self, kind: ResourceKind, id: &str) -> ProviderResult<ResourceState> {
        self.take_injected("resource_state")?;
        let mut state = self.state.lock().unwrap();
        let key = (kind, id.to_string());
        if let Some(remaining) = state.ready_after.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(ResourceState::Creating);
            }
        }
        let known = state.resources.values().any(|h| h.kind == kind && h.id == id);
        Ok(if known {
            ResourceState::Ready
        } else {
            ResourceState::Absent
        })
    }

    async fn availability_zones(&self) -> ProviderResult<Vec<String>> {
        self.take_injected("availability_zones")?;
        Ok(self.state.lock().unwrap().zones.clone())
    }

    async fn claimed_address_blocks(&self) -> ProviderResult<Vec<CidrBlock>> {
        self.take_injected("claimed_address_blocks")?;
        Ok(self.state.lock().unwrap().claimed_blocks.clone())
    }

    async fn address_space_block(&self, vpc_id: &str) -> ProviderResult<CidrBlock> {
        self.take_injected("address_space_block")?;
        self.state
            .lock()
            .unwrap()
            .vpc_blocks
            .get(vpc_id)
            .copied()
            .ok_or_else(|| ProviderError::not_found(format!("vpc {vpc_id} not found")))
    }

    async fn has_internet_route(&self, subnet_id: &str) -> ProviderResult<bool> {
        self.take_injected("has_internet_route")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .public_subnets
            .iter()
            .any(|s| s == subnet_id))
    }

    async fn has_default_route(&self, subnet_id: &str) -> ProviderResult<bool> {
        self.take_injected("has_default_route")?;
        let state = self.state.lock().unwrap();
        Ok(state.public_subnets.iter().any(|s| s == subnet_id)
            || state.nat_routed_subnets.iter().any(|s| s == subnet_id))
    }

    async fn bucket_has_policy(&self, bucket: &str) -> ProviderResult<bool> {
        self.take_injected("bucket_has_policy")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .buckets_with_policy
            .iter()
            .any(|b| b == bucket))
    }

    async fn role_has_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> ProviderResult<bool> {
        self.take_injected("role_has_inline_policy")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .inline_policies
            .iter()
            .any(|(role, policy)| role == role_name && policy == policy_name))
    }

    async fn instance_profile_exists(&self, name: &str) -> ProviderResult<bool> {
        self.take_injected("instance_profile_exists")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .instance_profiles
            .iter()
            .any(|p| p == name))
    }

    async fn data_source_exists(
        &self,
        knowledge_base_id: &str,
        bucket: &str,
    ) -> ProviderResult<bool> {
        self.take_injected("data_source_exists")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .data_sources
            .iter()
            .any(|(kb, b)| kb == knowledge_base_id && b == bucket))
    }

    async fn listener_exists(&self, load_balancer_id: &str) -> ProviderResult<bool> {
        self.take_injected("listener_exists")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .load_balancers_with_listener
            .iter()
            .any(|lb| lb == load_balancer_id))
    }

    async fn target_registered(
        &self,
        target_group_id: &str,
        instance_id: &str,
    ) -> ProviderResult<bool> {
        self.take_injected("target_registered")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .registered_targets
            .iter()
            .any(|(tg, instance)| tg == target_group_id && instance == instance_id))
    }

    async fn nat_gateway_allocation(&self, nat_id: &str) -> ProviderResult<Option<String>> {
        self.take_injected("nat_gateway_allocation")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .nat_allocations
            .get(nat_id)
            .cloned())
    }

    async fn collection_status(&self, name: &str) -> ProviderResult<ResourceHandle> {
        self.take_injected("collection_status")?;
        let mut state = self.state.lock().unwrap();
        let key = (ResourceKind::Collection, name.to_string());
        let handle = state
            .resources
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(format!("collection {name} not found")))?;
        let ready_key = (ResourceKind::Collection, handle.id.clone());
        if let Some(remaining) = state.ready_after.get_mut(&ready_key) {
            if *remaining > 0 {
                *remaining -= 1;
                let mut pending = handle;
                pending.state = ResourceState::Creating;
                return Ok(pending);
            }
        }
        let mut ready = handle;
        ready.state = ResourceState::Ready;
        if ready.endpoint.is_none() {
            ready = ready.with_endpoint(format!("https://{name}.search.test"));
        }
        state
            .resources
            .insert(key, ready.clone());
        Ok(ready)
    }

    async fn agent_ready(&self, _instance_id: &str) -> ProviderResult<bool> {
        self.take_injected("agent_ready")?;
        let mut state = self.state.lock().unwrap();
        if state.agent_ready_after > 0 {
            state.agent_ready_after -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn command_status(
        &self,
        _command_id: &str,
        _instance_id: &str,
    ) -> ProviderResult<CommandStatus> {
        self.take_injected("command_status")?;
        let mut state = self.state.lock().unwrap();
        if state.command_polls_in_progress > 0 {
            state.command_polls_in_progress -= 1;
            return Ok(CommandStatus::InProgress);
        }
        Ok(state.command_result.clone())
    }

    async fn http_ready(&self, _url: &str) -> ProviderResult<bool> {
        self.take_injected("http_ready")?;
        let mut state = self.state.lock().unwrap();
        if state.http_ready_after > 0 {
            state.http_ready_after -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn instance_has_public_address(&self, instance_id: &str) -> ProviderResult<bool> {
        self.take_injected("instance_has_public_address")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances_with_public_address
            .iter()
            .any(|i| i == instance_id))
    }

    async fn instance_subnet(&self, instance_id: &str) -> ProviderResult<String> {
        self.take_injected("instance_subnet")?;
        self.state
            .lock()
            .unwrap()
            .instance_subnets
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(format!("instance {instance_id} not found")))
    }

    async fn create_bucket(&self, name: &str) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_bucket")?;
        self.create(
            format!("create_bucket {name}"),
            ResourceHandle::ready(ResourceKind::Bucket, name, name),
        )
    }

    async fn put_bucket_policy(
        &self,
        bucket: &str,
        _policy: serde_json::Value,
    ) -> ProviderResult<()> {
        self.take_injected("put_bucket_policy")?;
        self.record(format!("put_bucket_policy {bucket}"));
        self.state
            .lock()
            .unwrap()
            .buckets_with_policy
            .push(bucket.to_string());
        Ok(())
    }

    async fn create_role(
        &self,
        name: &str,
        _trust_services: &[String],
        _managed_policies: &[String],
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_role")?;
        let arn = format!("arn:fake:iam::role/{name}");
        self.create(
            format!("create_role {name}"),
            ResourceHandle::ready(ResourceKind::Role, name, arn),
        )
    }

    async fn put_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        _document: serde_json::Value,
    ) -> ProviderResult<()> {
        self.take_injected("put_inline_policy")?;
        self.record(format!("put_inline_policy {role_name} {policy_name}"));
        self.state
            .lock()
            .unwrap()
            .inline_policies
            .push((role_name.to_string(), policy_name.to_string()));
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str, role_name: &str) -> ProviderResult<()> {
        self.take_injected("create_instance_profile")?;
        self.record(format!("create_instance_profile {name} {role_name}"));
        self.state
            .lock()
            .unwrap()
            .instance_profiles
            .push(name.to_string());
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str, _role_name: &str) -> ProviderResult<()> {
        self.take_injected("delete_instance_profile")?;
        self.record(format!("delete_instance_profile {name}"));
        let mut state = self.state.lock().unwrap();
        match state.instance_profiles.iter().position(|p| p == name) {
            Some(i) => {
                state.instance_profiles.remove(i);
                Ok(())
            }
            None => Err(ProviderError::not_found(format!(
                "instance profile {name} not found"
            ))),
        }
    }

    async fn create_secret(
        &self,
        name: &str,
        _description: &str,
        _value: serde_json::Value,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_secret")?;
        let arn = format!("arn:fake:secret/{name}");
        self.create(
            format!("create_secret {name}"),
            ResourceHandle::ready(ResourceKind::Secret, name, arn),
        )
    }

    async fn put_search_policy(
        &self,
        name: &str,
        kind: SearchPolicyKind,
        _document: serde_json::Value,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("put_search_policy")?;
        self.create(
            format!("put_search_policy {} {name}", kind.as_str()),
            ResourceHandle::ready(ResourceKind::SearchPolicy, name, name),
        )
    }

    async fn create_collection(&self, name: &str) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_collection")?;
        let id = self.fresh_id("col");
        self.create(
            format!("create_collection {name}"),
            ResourceHandle::creating(ResourceKind::Collection, name, id),
        )
    }

    async fn create_vector_index(
        &self,
        _collection_endpoint: &str,
        spec: &VectorIndexSpec,
    ) -> ProviderResult<()> {
        self.take_injected("create_vector_index")?;
        self.create(
            format!("create_vector_index {} dim={}", spec.name, spec.dimension),
            ResourceHandle::ready(ResourceKind::VectorIndex, &spec.name, &spec.name),
        )?;
        Ok(())
    }

    async fn create_knowledge_base(
        &self,
        spec: &KnowledgeBaseSpec,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_knowledge_base")?;
        let id = self.fresh_id("kb");
        self.create(
            format!("create_knowledge_base {}", spec.name),
            ResourceHandle::creating(ResourceKind::KnowledgeBase, &spec.name, id),
        )
    }

    async fn create_data_source(
        &self,
        knowledge_base_id: &str,
        bucket: &str,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_data_source")?;
        self.record(format!("create_data_source {knowledge_base_id} {bucket}"));
        self.state
            .lock()
            .unwrap()
            .data_sources
            .push((knowledge_base_id.to_string(), bucket.to_string()));
        let id = self.fresh_id("ds");
        Ok(ResourceHandle::ready(
            ResourceKind::KnowledgeBase,
            format!("{bucket}-source"),
            id,
        ))
    }

    async fn create_address_space(
        &self,
        name: &str,
        cidr: CidrBlock,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_address_space")?;
        {
            let state = self.state.lock().unwrap();
            if state.claimed_blocks.iter().any(|b| b.overlaps(&cidr)) {
                drop(state);
                self.record(format!("create_address_space {name} {cidr}"));
                return Err(ProviderError::already_exists(format!(
                    "address block {cidr} conflicts with an existing address space"
                )));
            }
        }
        let id = self.fresh_id("vpc");
        let handle = self.create(
            format!("create_address_space {name} {cidr}"),
            ResourceHandle::ready(ResourceKind::Vpc, name, &id),
        )?;
        let mut state = self.state.lock().unwrap();
        state.claimed_blocks.push(cidr);
        state.vpc_blocks.insert(id, cidr);
        Ok(handle)
    }

    async fn create_subnet(
        &self,
        name: &str,
        _vpc_id: &str,
        cidr: CidrBlock,
        availability_zone: &str,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_subnet")?;
        let id = self.fresh_id("subnet");
        self.create(
            format!("create_subnet {name} {cidr} {availability_zone}"),
            ResourceHandle::creating(ResourceKind::Subnet, name, id),
        )
    }

    async fn create_internet_gateway(
        &self,
        name: &str,
        vpc_id: &str,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_internet_gateway")?;
        let id = self.fresh_id("igw");
        self.create(
            format!("create_internet_gateway {name} {vpc_id}"),
            ResourceHandle::ready(ResourceKind::InternetGateway, name, id),
        )
    }

    async fn create_nat_gateway(
        &self,
        name: &str,
        subnet_id: &str,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_nat_gateway")?;
        let id = self.fresh_id("nat");
        let allocation = self.fresh_id("eipalloc");
        let handle = self.create(
            format!("create_nat_gateway {name} {subnet_id}"),
            ResourceHandle::creating(ResourceKind::NatGateway, name, &id),
        )?;
        let mut state = self.state.lock().unwrap();
        state.allocated_addresses.push(allocation.clone());
        state.nat_allocations.insert(id, allocation);
        Ok(handle)
    }

    async fn route_subnets(
        &self,
        name: &str,
        _vpc_id: &str,
        subnet_ids: &[String],
        target: RouteTarget,
    ) -> ProviderResult<()> {
        self.take_injected("route_subnets")?;
        self.record(format!("route_subnets {name} [{}]", subnet_ids.join(",")));
        let rt_id = self.fresh_id("rtb");
        let mut state = self.state.lock().unwrap();
        // Re-routing replaces the previous table of the same name.
        state.resources.insert(
            (ResourceKind::RouteTable, name.to_string()),
            ResourceHandle::ready(ResourceKind::RouteTable, name, rt_id),
        );
        match target {
            RouteTarget::InternetGateway(_) => {
                for subnet_id in subnet_ids {
                    state.public_subnets.push(subnet_id.clone());
                }
            }
            RouteTarget::NatGateway(_) => {
                for subnet_id in subnet_ids {
                    state.nat_routed_subnets.push(subnet_id.clone());
                }
            }
        }
        Ok(())
    }

    async fn create_security_group(
        &self,
        name: &str,
        vpc_id: &str,
        _description: &str,
        rules: &[IngressRule],
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_security_group")?;
        let id = self.fresh_id("sg");
        self.create(
            format!("create_security_group {name} {vpc_id} rules={}", rules.len()),
            ResourceHandle::ready(ResourceKind::SecurityGroup, name, id),
        )
    }

    async fn create_service_endpoint(
        &self,
        name: &str,
        _vpc_id: &str,
        service: &str,
        _subnet_ids: &[String],
        _security_group_id: &str,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_service_endpoint")?;
        let id = self.fresh_id("vpce");
        self.create(
            format!("create_service_endpoint {name} {service}"),
            ResourceHandle::ready(ResourceKind::VpcEndpoint, name, id),
        )
    }

    async fn create_load_balancer(
        &self,
        name: &str,
        subnet_ids: &[String],
        _security_group_id: &str,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_load_balancer")?;
        let id = self.fresh_id("alb");
        let handle = ResourceHandle::ready(ResourceKind::LoadBalancer, name, &id)
            .with_endpoint(format!("{name}.elb.test"));
        self.create(
            format!("create_load_balancer {name} [{}]", subnet_ids.join(",")),
            handle,
        )
    }

    async fn create_target_group(
        &self,
        name: &str,
        _vpc_id: &str,
        port: u16,
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_target_group")?;
        let id = self.fresh_id("tg");
        self.create(
            format!("create_target_group {name} port={port}"),
            ResourceHandle::ready(ResourceKind::TargetGroup, name, id),
        )
    }

    async fn create_listener(
        &self,
        load_balancer_id: &str,
        target_group_id: &str,
        port: u16,
        _custom_header: &(String, String),
    ) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_listener")?;
        let id = self.fresh_id("listener");
        self.record(format!(
            "create_listener {load_balancer_id} {target_group_id} port={port}"
        ));
        self.state
            .lock()
            .unwrap()
            .load_balancers_with_listener
            .push(load_balancer_id.to_string());
        Ok(ResourceHandle::ready(ResourceKind::Listener, "listener", id))
    }

    async fn create_distribution(&self, spec: &DistributionSpec) -> ProviderResult<ResourceHandle> {
        self.take_injected("create_distribution")?;
        let id = self.fresh_id("dist");
        let handle = ResourceHandle::ready(ResourceKind::Distribution, &spec.comment, &id)
            .with_endpoint(format!("{id}.cdn.test"));
        self.create(
            format!(
                "create_distribution {} patterns={}",
                spec.comment,
                spec.static_patterns.join(",")
            ),
            handle,
        )
    }

    async fn latest_image_id(&self) -> ProviderResult<String> {
        self.take_injected("latest_image_id")?;
        Ok("image-fake-latest".into())
    }

    async fn run_instance(&self, spec: &InstanceSpec) -> ProviderResult<ResourceHandle> {
        self.take_injected("run_instance")?;
        let id = self.fresh_id("i");
        let handle = self.create(
            format!("run_instance {} in {}", spec.name, spec.subnet_id),
            ResourceHandle::creating(ResourceKind::Instance, &spec.name, &id),
        )?;
        self.state
            .lock()
            .unwrap()
            .instance_subnets
            .insert(id, spec.subnet_id.clone());
        Ok(handle)
    }

    async fn register_target(
        &self,
        target_group_id: &str,
        instance_id: &str,
        port: u16,
    ) -> ProviderResult<()> {
        self.take_injected("register_target")?;
        self.record(format!(
            "register_target {target_group_id} {instance_id} port={port}"
        ));
        self.state
            .lock()
            .unwrap()
            .registered_targets
            .push((target_group_id.to_string(), instance_id.to_string()));
        Ok(())
    }

    async fn send_command(&self, instance_id: &str, _script: &str) -> ProviderResult<String> {
        self.take_injected("send_command")?;
        self.record(format!("send_command {instance_id}"));
        Ok(self.fresh_id("cmd"))
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()> {
        self.take_injected("delete")?;
        self.record(format!("delete {kind} {id}"));
        let mut state = self.state.lock().unwrap();
        let key = state
            .resources
            .iter()
            .find(|(_, h)| h.kind == kind && (h.id == id || h.name == id))
            .map(|(k, _)| k.clone());
        match key {
            Some(key) => {
                state.resources.remove(&key);
                Ok(())
            }
            None => Err(ProviderError::not_found(format!("{kind} {id} not found"))),
        }
    }

    async fn release_address(&self, allocation_id: &str) -> ProviderResult<()> {
        self.take_injected("release_address")?;
        self.record(format!("release_address {allocation_id}"));
        let mut state = self.state.lock().unwrap();
        match state
            .allocated_addresses
            .iter()
            .position(|a| a == allocation_id)
        {
            Some(i) => {
                state.allocated_addresses.remove(i);
                Ok(())
            }
            None => Err(ProviderError::not_found(format!(
                "address {allocation_id} not found"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_common::ErrorClass;

    #[tokio::test]
    async fn test_lookup_does_not_touch_the_mutation_log() {
        let cloud = FakeCloud::new();
        cloud.preload(ResourceHandle::ready(ResourceKind::Bucket, "b", "b"));
        assert!(cloud.lookup(ResourceKind::Bucket, "b").await.unwrap().is_some());
        assert!(cloud.lookup(ResourceKind::Vpc, "missing").await.unwrap().is_none());
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_already_exists() {
        let cloud = FakeCloud::new();
        cloud.create_bucket("b").await.unwrap();
        let err = cloud.create_bucket("b").await.unwrap_err();
        assert!(err.is(ErrorClass::AlreadyExists));
    }

    #[tokio::test]
    async fn test_injected_error_fires_once() {
        let cloud = FakeCloud::new();
        cloud.inject_error("create_bucket", ProviderError::transient("flake"));
        assert!(cloud.create_bucket("b").await.unwrap_err().is(ErrorClass::Transient));
        assert!(cloud.create_bucket("b").await.is_ok());
    }

    #[tokio::test]
    async fn test_address_space_conflict_on_claimed_block() {
        let cloud = FakeCloud::new();
        let block: CidrBlock = "10.20.0.0/16".parse().unwrap();
        cloud.claim_block(block);
        let err = cloud.create_address_space("v", block).await.unwrap_err();
        assert!(err.is(ErrorClass::AlreadyExists));
    }

    #[tokio::test]
    async fn test_fresh_fake_reports_commands_successful() {
        // The constructor fills defaults for every knob; commands succeed
        // unless a test says otherwise.
        let cloud = FakeCloud::new();
        let status = cloud.command_status("cmd-1", "i-1").await.unwrap();
        assert_eq!(status, CommandStatus::Success);
        assert_eq!(CommandStatus::default(), CommandStatus::InProgress);
    }

    #[tokio::test]
    async fn test_ready_after_counts_down() {
        let cloud = FakeCloud::new();
        let nat = cloud.create_nat_gateway("nat", "subnet-1").await.unwrap();
        cloud.set_ready_after(ResourceKind::NatGateway, &nat.id, 2);
        for _ in 0..2 {
            assert_eq!(
                cloud.resource_state(ResourceKind::NatGateway, &nat.id).await.unwrap(),
                ResourceState::Creating
            );
        }
        assert_eq!(
            cloud.resource_state(ResourceKind::NatGateway, &nat.id).await.unwrap(),
            ResourceState::Ready
        );
    }
}
