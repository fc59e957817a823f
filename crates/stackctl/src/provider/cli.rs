//! Production provider backed by the vendor CLI.
//!
//! Every operation shells out to the `aws` CLI with `--output json` and
//! parses the response with serde. Failures are classified from the CLI's
//! error output here and nowhere else.

use super::{
    ChunkingConfig, CloudProvider, CommandStatus, DistributionSpec, IngressRule, IngressSource,
    InstanceSpec, KnowledgeBaseSpec, ProviderResult, RouteTarget, SearchPolicyKind,
    VectorIndexSpec,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use stack_common::{
    CidrBlock, ErrorClass, ProviderError, ResourceHandle, ResourceKind, ResourceState,
};
use std::time::Duration;
use tracing::debug;

/// Classify a CLI error message into the closed error-class set.
///
/// The CLI reports failures as `An error occurred (<Code>) when calling
/// ...`; the code substrings below cover the codes the orchestrator
/// branches on. Everything unrecognized is `Other`.
pub fn classify(stderr: &str) -> ErrorClass {
    const ALREADY_EXISTS: &[&str] = &[
        "AlreadyExists",
        "AlreadyOwnedByYou",
        "ConflictException",
        "Duplicate",
        "InvalidPermission.Duplicate",
        "RouteAlreadyExists",
    ];
    const NOT_FOUND: &[&str] = &[
        "NotFound",
        "NoSuchEntity",
        "ResourceNotFoundException",
        "NoSuchBucket",
        "does not exist",
        "404",
    ];
    const TRANSIENT: &[&str] = &[
        "Throttling",
        "RequestLimitExceeded",
        "TooManyRequests",
        "ServiceUnavailable",
        "InternalError",
        "timed out",
        "Connection reset",
    ];
    const QUOTA: &[&str] = &[
        "LimitExceeded",
        "QuotaExceeded",
        "InsufficientFreeAddresses",
        "AddressLimitExceeded",
    ];

    // Transient is checked before quota: throttling codes like
    // RequestLimitExceeded contain "LimitExceeded" and must stay retryable.
    let hit = |codes: &[&str]| codes.iter().any(|c| stderr.contains(c));
    if hit(ALREADY_EXISTS) {
        ErrorClass::AlreadyExists
    } else if hit(NOT_FOUND) {
        ErrorClass::NotFound
    } else if hit(TRANSIENT) {
        ErrorClass::Transient
    } else if hit(QUOTA) {
        ErrorClass::QuotaExhausted
    } else {
        ErrorClass::Other
    }
}

pub struct CliCloud {
    region: String,
    http: reqwest::Client,
}

impl CliCloud {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Run one CLI invocation and parse stdout as JSON.
    async fn aws(&self, args: &[&str]) -> ProviderResult<Value> {
        debug!("aws {}", args.join(" "));
        let output = tokio::process::Command::new("aws")
            .args(["--region", &self.region, "--output", "json"])
            .args(args)
            .output()
            .await
            .map_err(|e| ProviderError::transient(format!("failed to spawn aws cli: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::new(classify(&stderr), stderr.trim().to_string()));
        }
        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| ProviderError::other(format!("unparseable cli output: {e}")))
    }

    /// Account id of the active credentials.
    pub async fn caller_account(&self) -> ProviderResult<String> {
        let v = self.aws(&["sts", "get-caller-identity"]).await?;
        Ok(Self::str_at(&v, "/Account")?.to_string())
    }

    /// Tag filter argument for name-tagged resources.
    fn name_filter(name: &str) -> String {
        format!("Name=tag:Name,Values={name}")
    }

    fn tag_spec(resource_type: &str, name: &str) -> String {
        format!("ResourceType={resource_type},Tags=[{{Key=Name,Value={name}}}]")
    }

    fn str_at<'a>(value: &'a Value, pointer: &str) -> ProviderResult<&'a str> {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::other(format!("missing field {pointer} in cli output")))
    }
}

#[async_trait]
impl CloudProvider for CliCloud {
    async fn lookup(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> ProviderResult<Option<ResourceHandle>> {
        let result = match kind {
            ResourceKind::Bucket => {
                self.aws(&["s3api", "head-bucket", "--bucket", name])
                    .await
                    .map(|_| Some(ResourceHandle::ready(kind, name, name)))
            }
            ResourceKind::Role => self
                .aws(&["iam", "get-role", "--role-name", name])
                .await
                .and_then(|v| {
                    let arn = Self::str_at(&v, "/Role/Arn")?;
                    Ok(Some(ResourceHandle::ready(kind, name, arn)))
                }),
            ResourceKind::Secret => self
                .aws(&["secretsmanager", "describe-secret", "--secret-id", name])
                .await
                .and_then(|v| {
                    let arn = Self::str_at(&v, "/ARN")?;
                    Ok(Some(ResourceHandle::ready(kind, name, arn)))
                }),
            ResourceKind::SearchPolicy => {
                // Policy type is encoded in the name prefix.
                let (cmd, type_arg) = if name.starts_with("data-") {
                    ("get-access-policy", "data")
                } else if name.starts_with("network-") {
                    ("get-security-policy", "network")
                } else {
                    ("get-security-policy", "encryption")
                };
                self.aws(&["opensearchserverless", cmd, "--name", name, "--type", type_arg])
                    .await
                    .map(|_| Some(ResourceHandle::ready(kind, name, name)))
            }
            ResourceKind::Collection => {
                let v = self
                    .aws(&["opensearchserverless", "batch-get-collection", "--names", name])
                    .await?;
                match v.pointer("/collectionDetails/0") {
                    Some(detail) => {
                        let id = Self::str_at(detail, "/arn")?;
                        let state = match detail.pointer("/status").and_then(Value::as_str) {
                            Some("ACTIVE") => ResourceState::Ready,
                            Some("FAILED") => ResourceState::Failed,
                            _ => ResourceState::Creating,
                        };
                        let mut handle = ResourceHandle::ready(kind, name, id);
                        handle.state = state;
                        if let Some(endpoint) =
                            detail.pointer("/collectionEndpoint").and_then(Value::as_str)
                        {
                            handle = handle.with_endpoint(endpoint);
                        }
                        return Ok(Some(handle));
                    }
                    None => return Ok(None),
                }
            }
            // Data-plane indexes are not visible through the control CLI;
            // creation handles the already-exists case instead.
            ResourceKind::VectorIndex => return Ok(None),
            ResourceKind::KnowledgeBase => {
                let v = self
                    .aws(&["bedrock-agent", "list-knowledge-bases", "--max-results", "100"])
                    .await?;
                let found = v
                    .pointer("/knowledgeBaseSummaries")
                    .and_then(Value::as_array)
                    .and_then(|items| {
                        items.iter().find(|item| {
                            item.pointer("/name").and_then(Value::as_str) == Some(name)
                        })
                    })
                    .and_then(|item| item.pointer("/knowledgeBaseId").and_then(Value::as_str))
                    .map(|id| ResourceHandle::ready(kind, name, id));
                return Ok(found);
            }
            ResourceKind::Vpc => {
                let v = self
                    .aws(&["ec2", "describe-vpcs", "--filters", &Self::name_filter(name)])
                    .await?;
                return Ok(v
                    .pointer("/Vpcs/0/VpcId")
                    .and_then(Value::as_str)
                    .map(|id| ResourceHandle::ready(kind, name, id)));
            }
            ResourceKind::Subnet => {
                let v = self
                    .aws(&["ec2", "describe-subnets", "--filters", &Self::name_filter(name)])
                    .await?;
                return Ok(v
                    .pointer("/Subnets/0/SubnetId")
                    .and_then(Value::as_str)
                    .map(|id| ResourceHandle::ready(kind, name, id)));
            }
            ResourceKind::InternetGateway => {
                let v = self
                    .aws(&[
                        "ec2",
                        "describe-internet-gateways",
                        "--filters",
                        &Self::name_filter(name),
                    ])
                    .await?;
                return Ok(v
                    .pointer("/InternetGateways/0/InternetGatewayId")
                    .and_then(Value::as_str)
                    .map(|id| ResourceHandle::ready(kind, name, id)));
            }
            ResourceKind::NatGateway => {
                let v = self
                    .aws(&[
                        "ec2",
                        "describe-nat-gateways",
                        "--filter",
                        &Self::name_filter(name),
                        "Name=state,Values=pending,available",
                    ])
                    .await?;
                return Ok(v.pointer("/NatGateways/0").map(|gw| {
                    let id = gw
                        .pointer("/NatGatewayId")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let mut handle = ResourceHandle::ready(kind, name, id);
                    if gw.pointer("/State").and_then(Value::as_str) != Some("available") {
                        handle.state = ResourceState::Creating;
                    }
                    handle
                }));
            }
            ResourceKind::RouteTable => {
                let v = self
                    .aws(&[
                        "ec2",
                        "describe-route-tables",
                        "--filters",
                        &Self::name_filter(name),
                    ])
                    .await?;
                return Ok(v
                    .pointer("/RouteTables/0/RouteTableId")
                    .and_then(Value::as_str)
                    .map(|id| ResourceHandle::ready(kind, name, id)));
            }
            ResourceKind::SecurityGroup => {
                let v = self
                    .aws(&[
                        "ec2",
                        "describe-security-groups",
                        "--filters",
                        &format!("Name=group-name,Values={name}"),
                    ])
                    .await?;
                return Ok(v
                    .pointer("/SecurityGroups/0/GroupId")
                    .and_then(Value::as_str)
                    .map(|id| ResourceHandle::ready(kind, name, id)));
            }
            ResourceKind::VpcEndpoint => {
                let v = self
                    .aws(&[
                        "ec2",
                        "describe-vpc-endpoints",
                        "--filters",
                        &Self::name_filter(name),
                    ])
                    .await?;
                return Ok(v
                    .pointer("/VpcEndpoints/0/VpcEndpointId")
                    .and_then(Value::as_str)
                    .map(|id| ResourceHandle::ready(kind, name, id)));
            }
            ResourceKind::LoadBalancer => self
                .aws(&["elbv2", "describe-load-balancers", "--names", name])
                .await
                .and_then(|v| {
                    let arn = Self::str_at(&v, "/LoadBalancers/0/LoadBalancerArn")?;
                    let dns = Self::str_at(&v, "/LoadBalancers/0/DNSName")?;
                    Ok(Some(ResourceHandle::ready(kind, name, arn).with_endpoint(dns)))
                }),
            ResourceKind::TargetGroup => self
                .aws(&["elbv2", "describe-target-groups", "--names", name])
                .await
                .and_then(|v| {
                    let arn = Self::str_at(&v, "/TargetGroups/0/TargetGroupArn")?;
                    Ok(Some(ResourceHandle::ready(kind, name, arn)))
                }),
            // Listeners are addressed through their load balancer, not by
            // name; creation resolves duplicates itself.
            ResourceKind::Listener => return Ok(None),
            ResourceKind::Distribution => {
                let v = self.aws(&["cloudfront", "list-distributions"]).await?;
                let found = v
                    .pointer("/DistributionList/Items")
                    .and_then(Value::as_array)
                    .and_then(|items| {
                        items.iter().find(|d| {
                            d.pointer("/Comment").and_then(Value::as_str) == Some(name)
                                && d.pointer("/Enabled").and_then(Value::as_bool) == Some(true)
                        })
                    })
                    .and_then(|d| {
                        let id = d.pointer("/Id").and_then(Value::as_str)?;
                        let domain = d.pointer("/DomainName").and_then(Value::as_str)?;
                        Some(ResourceHandle::ready(kind, name, id).with_endpoint(domain))
                    });
                return Ok(found);
            }
            ResourceKind::Instance => {
                let v = self
                    .aws(&[
                        "ec2",
                        "describe-instances",
                        "--filters",
                        &Self::name_filter(name),
                        "Name=instance-state-name,Values=running,pending,stopping,stopped",
                    ])
                    .await?;
                return Ok(v
                    .pointer("/Reservations/0/Instances/0/InstanceId")
                    .and_then(Value::as_str)
                    .map(|id| ResourceHandle::ready(kind, name, id)));
            }
        };

        // Describe-by-name calls report absence as an error; translate that
        // into the expected None.
        match result {
            Ok(handle) => Ok(handle),
            Err(err) if err.is(ErrorClass::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn resource_state(&self, kind: ResourceKind, id: &str) -> ProviderResult<ResourceState> {
        match kind {
            ResourceKind::Subnet => {
                let v = self
                    .aws(&["ec2", "describe-subnets", "--subnet-ids", id])
                    .await?;
                Ok(match v.pointer("/Subnets/0/State").and_then(Value::as_str) {
                    Some("available") => ResourceState::Ready,
                    Some(_) => ResourceState::Creating,
                    None => ResourceState::Absent,
                })
            }
            ResourceKind::NatGateway => {
                let v = self
                    .aws(&["ec2", "describe-nat-gateways", "--nat-gateway-ids", id])
                    .await?;
                Ok(match v.pointer("/NatGateways/0/State").and_then(Value::as_str) {
                    Some("available") => ResourceState::Ready,
                    Some("failed") | Some("deleted") => ResourceState::Failed,
                    Some(_) => ResourceState::Creating,
                    None => ResourceState::Absent,
                })
            }
            ResourceKind::Instance => {
                let v = self
                    .aws(&["ec2", "describe-instances", "--instance-ids", id])
                    .await?;
                Ok(
                    match v
                        .pointer("/Reservations/0/Instances/0/State/Name")
                        .and_then(Value::as_str)
                    {
                        Some("running") => ResourceState::Ready,
                        Some("terminated") | Some("shutting-down") => ResourceState::Failed,
                        Some(_) => ResourceState::Creating,
                        None => ResourceState::Absent,
                    },
                )
            }
            ResourceKind::KnowledgeBase => {
                let v = self
                    .aws(&["bedrock-agent", "get-knowledge-base", "--knowledge-base-id", id])
                    .await?;
                Ok(
                    match v.pointer("/knowledgeBase/status").and_then(Value::as_str) {
                        Some("ACTIVE") => ResourceState::Ready,
                        Some("FAILED") => ResourceState::Failed,
                        Some(_) => ResourceState::Creating,
                        None => ResourceState::Absent,
                    },
                )
            }
            // Everything else is usable as soon as the create call returns.
            _ => Ok(ResourceState::Ready),
        }
    }

    async fn availability_zones(&self) -> ProviderResult<Vec<String>> {
        let v = self.aws(&["ec2", "describe-availability-zones"]).await?;
        let zones = v
            .pointer("/AvailabilityZones")
            .and_then(Value::as_array)
            .map(|zones| {
                zones
                    .iter()
                    .filter_map(|z| z.pointer("/ZoneName").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(zones)
    }

    async fn claimed_address_blocks(&self) -> ProviderResult<Vec<CidrBlock>> {
        let v = self.aws(&["ec2", "describe-vpcs"]).await?;
        let mut blocks = Vec::new();
        if let Some(vpcs) = v.pointer("/Vpcs").and_then(Value::as_array) {
            for vpc in vpcs {
                if let Some(cidr) = vpc.pointer("/CidrBlock").and_then(Value::as_str) {
                    if let Ok(block) = cidr.parse() {
                        blocks.push(block);
                    }
                }
            }
        }
        Ok(blocks)
    }

    async fn address_space_block(&self, vpc_id: &str) -> ProviderResult<CidrBlock> {
        let v = self.aws(&["ec2", "describe-vpcs", "--vpc-ids", vpc_id]).await?;
        Self::str_at(&v, "/Vpcs/0/CidrBlock")?
            .parse()
            .map_err(|e| ProviderError::other(format!("unparseable vpc block: {e}")))
    }

    async fn has_internet_route(&self, subnet_id: &str) -> ProviderResult<bool> {
        let v = self
            .aws(&[
                "ec2",
                "describe-route-tables",
                "--filters",
                &format!("Name=association.subnet-id,Values={subnet_id}"),
            ])
            .await?;
        let has_route = v
            .pointer("/RouteTables")
            .and_then(Value::as_array)
            .map(|tables| {
                tables.iter().any(|rt| {
                    rt.pointer("/Routes")
                        .and_then(Value::as_array)
                        .map(|routes| {
                            routes.iter().any(|r| {
                                r.pointer("/GatewayId")
                                    .and_then(Value::as_str)
                                    .map(|g| g.starts_with("igw-"))
                                    .unwrap_or(false)
                                    && r.pointer("/DestinationCidrBlock").and_then(Value::as_str)
                                        == Some("0.0.0.0/0")
                            })
                        })
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        Ok(has_route)
    }

    async fn has_default_route(&self, subnet_id: &str) -> ProviderResult<bool> {
        let v = self
            .aws(&[
                "ec2",
                "describe-route-tables",
                "--filters",
                &format!("Name=association.subnet-id,Values={subnet_id}"),
            ])
            .await?;
        let has_route = v
            .pointer("/RouteTables")
            .and_then(Value::as_array)
            .map(|tables| {
                tables.iter().any(|rt| {
                    rt.pointer("/Routes")
                        .and_then(Value::as_array)
                        .map(|routes| {
                            routes.iter().any(|r| {
                                r.pointer("/DestinationCidrBlock").and_then(Value::as_str)
                                    == Some("0.0.0.0/0")
                                    && (r.pointer("/NatGatewayId").is_some()
                                        || r.pointer("/GatewayId")
                                            .and_then(Value::as_str)
                                            .map(|g| g.starts_with("igw-"))
                                            .unwrap_or(false))
                            })
                        })
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        Ok(has_route)
    }

    async fn bucket_has_policy(&self, bucket: &str) -> ProviderResult<bool> {
        match self
            .aws(&["s3api", "get-bucket-policy", "--bucket", bucket])
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is(ErrorClass::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn role_has_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> ProviderResult<bool> {
        match self
            .aws(&[
                "iam",
                "get-role-policy",
                "--role-name",
                role_name,
                "--policy-name",
                policy_name,
            ])
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is(ErrorClass::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn instance_profile_exists(&self, name: &str) -> ProviderResult<bool> {
        match self
            .aws(&["iam", "get-instance-profile", "--instance-profile-name", name])
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is(ErrorClass::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn data_source_exists(
        &self,
        knowledge_base_id: &str,
        bucket: &str,
    ) -> ProviderResult<bool> {
        let v = self
            .aws(&[
                "bedrock-agent",
                "list-data-sources",
                "--knowledge-base-id",
                knowledge_base_id,
            ])
            .await?;
        let wanted = format!("{bucket}-source");
        let found = v
            .pointer("/dataSourceSummaries")
            .and_then(Value::as_array)
            .map(|items| {
                items.iter().any(|item| {
                    item.pointer("/name").and_then(Value::as_str) == Some(wanted.as_str())
                })
            })
            .unwrap_or(false);
        Ok(found)
    }

    async fn listener_exists(&self, load_balancer_id: &str) -> ProviderResult<bool> {
        match self
            .aws(&[
                "elbv2",
                "describe-listeners",
                "--load-balancer-arn",
                load_balancer_id,
            ])
            .await
        {
            Ok(v) => Ok(v
                .pointer("/Listeners")
                .and_then(Value::as_array)
                .map(|listeners| !listeners.is_empty())
                .unwrap_or(false)),
            Err(err) if err.is(ErrorClass::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn target_registered(
        &self,
        target_group_id: &str,
        instance_id: &str,
    ) -> ProviderResult<bool> {
        let v = self
            .aws(&[
                "elbv2",
                "describe-target-health",
                "--target-group-arn",
                target_group_id,
            ])
            .await?;
        let found = v
            .pointer("/TargetHealthDescriptions")
            .and_then(Value::as_array)
            .map(|targets| {
                targets.iter().any(|t| {
                    t.pointer("/Target/Id").and_then(Value::as_str) == Some(instance_id)
                })
            })
            .unwrap_or(false);
        Ok(found)
    }

    async fn nat_gateway_allocation(&self, nat_id: &str) -> ProviderResult<Option<String>> {
        let result = self
            .aws(&["ec2", "describe-nat-gateways", "--nat-gateway-ids", nat_id])
            .await;
        match result {
            Ok(v) => Ok(v
                .pointer("/NatGateways/0/NatGatewayAddresses/0/AllocationId")
                .and_then(Value::as_str)
                .map(str::to_string)),
            Err(err) if err.is(ErrorClass::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn collection_status(&self, name: &str) -> ProviderResult<ResourceHandle> {
        self.lookup(ResourceKind::Collection, name).await?.ok_or_else(|| {
            ProviderError::not_found(format!("collection {name} not found"))
        })
    }

    async fn agent_ready(&self, instance_id: &str) -> ProviderResult<bool> {
        let v = self
            .aws(&[
                "ssm",
                "describe-instance-information",
                "--filters",
                &format!("Key=InstanceIds,Values={instance_id}"),
            ])
            .await?;
        Ok(v.pointer("/InstanceInformationList/0").is_some())
    }

    async fn command_status(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> ProviderResult<CommandStatus> {
        let v = self
            .aws(&[
                "ssm",
                "get-command-invocation",
                "--command-id",
                command_id,
                "--instance-id",
                instance_id,
            ])
            .await?;
        Ok(match v.pointer("/Status").and_then(Value::as_str) {
            Some("Success") => CommandStatus::Success,
            Some(terminal @ ("Failed" | "Cancelled" | "TimedOut")) => {
                let stderr = v
                    .pointer("/StandardErrorContent")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                CommandStatus::Failed(format!("{terminal}: {stderr}"))
            }
            _ => CommandStatus::InProgress,
        })
    }

    async fn http_ready(&self, url: &str) -> ProviderResult<bool> {
        match self
            .http
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    async fn instance_has_public_address(&self, instance_id: &str) -> ProviderResult<bool> {
        let v = self
            .aws(&["ec2", "describe-instances", "--instance-ids", instance_id])
            .await?;
        Ok(v.pointer("/Reservations/0/Instances/0/PublicIpAddress").is_some())
    }

    async fn instance_subnet(&self, instance_id: &str) -> ProviderResult<String> {
        let v = self
            .aws(&["ec2", "describe-instances", "--instance-ids", instance_id])
            .await?;
        Ok(Self::str_at(&v, "/Reservations/0/Instances/0/SubnetId")?.to_string())
    }

    async fn create_bucket(&self, name: &str) -> ProviderResult<ResourceHandle> {
        let location = format!("LocationConstraint={}", self.region);
        self.aws(&[
            "s3api",
            "create-bucket",
            "--bucket",
            name,
            "--create-bucket-configuration",
            &location,
        ])
        .await?;
        self.aws(&[
            "s3api",
            "put-public-access-block",
            "--bucket",
            name,
            "--public-access-block-configuration",
            "BlockPublicAcls=true,IgnorePublicAcls=true,BlockPublicPolicy=true,RestrictPublicBuckets=true",
        ])
        .await?;
        let cors = json!({
            "CORSRules": [{
                "AllowedHeaders": ["*"],
                "AllowedMethods": ["GET", "POST", "PUT"],
                "AllowedOrigins": ["*"]
            }]
        });
        self.aws(&[
            "s3api",
            "put-bucket-cors",
            "--bucket",
            name,
            "--cors-configuration",
            &cors.to_string(),
        ])
        .await?;
        Ok(ResourceHandle::ready(ResourceKind::Bucket, name, name))
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: Value) -> ProviderResult<()> {
        self.aws(&[
            "s3api",
            "put-bucket-policy",
            "--bucket",
            bucket,
            "--policy",
            &policy.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn create_role(
        &self,
        name: &str,
        trust_services: &[String],
        managed_policies: &[String],
    ) -> ProviderResult<ResourceHandle> {
        let trust = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": trust_services },
                "Action": "sts:AssumeRole"
            }]
        });
        let v = self
            .aws(&[
                "iam",
                "create-role",
                "--role-name",
                name,
                "--assume-role-policy-document",
                &trust.to_string(),
                "--description",
                &format!("Role for {name}"),
            ])
            .await?;
        let arn = Self::str_at(&v, "/Role/Arn")?.to_string();
        for policy_arn in managed_policies {
            self.aws(&[
                "iam",
                "attach-role-policy",
                "--role-name",
                name,
                "--policy-arn",
                policy_arn,
            ])
            .await?;
        }
        Ok(ResourceHandle::ready(ResourceKind::Role, name, arn))
    }

    async fn put_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: Value,
    ) -> ProviderResult<()> {
        self.aws(&[
            "iam",
            "put-role-policy",
            "--role-name",
            role_name,
            "--policy-name",
            policy_name,
            "--policy-document",
            &document.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str, role_name: &str) -> ProviderResult<()> {
        match self
            .aws(&["iam", "create-instance-profile", "--instance-profile-name", name])
            .await
        {
            Ok(_) => {}
            Err(err) if err.is(ErrorClass::AlreadyExists) => return Ok(()),
            Err(err) => return Err(err),
        }
        self.aws(&[
            "iam",
            "add-role-to-instance-profile",
            "--instance-profile-name",
            name,
            "--role-name",
            role_name,
        ])
        .await?;
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str, role_name: &str) -> ProviderResult<()> {
        self.aws(&[
            "iam",
            "remove-role-from-instance-profile",
            "--instance-profile-name",
            name,
            "--role-name",
            role_name,
        ])
        .await?;
        self.aws(&["iam", "delete-instance-profile", "--instance-profile-name", name])
            .await?;
        Ok(())
    }

    async fn create_secret(
        &self,
        name: &str,
        description: &str,
        value: Value,
    ) -> ProviderResult<ResourceHandle> {
        let v = self
            .aws(&[
                "secretsmanager",
                "create-secret",
                "--name",
                name,
                "--description",
                description,
                "--secret-string",
                &value.to_string(),
            ])
            .await?;
        let arn = Self::str_at(&v, "/ARN")?;
        Ok(ResourceHandle::ready(ResourceKind::Secret, name, arn))
    }

    async fn put_search_policy(
        &self,
        name: &str,
        kind: SearchPolicyKind,
        document: Value,
    ) -> ProviderResult<ResourceHandle> {
        let policy = document.to_string();
        match kind {
            SearchPolicyKind::DataAccess => {
                self.aws(&[
                    "opensearchserverless",
                    "create-access-policy",
                    "--name",
                    name,
                    "--type",
                    "data",
                    "--policy",
                    &policy,
                ])
                .await?;
            }
            _ => {
                self.aws(&[
                    "opensearchserverless",
                    "create-security-policy",
                    "--name",
                    name,
                    "--type",
                    kind.as_str(),
                    "--policy",
                    &policy,
                ])
                .await?;
            }
        }
        Ok(ResourceHandle::ready(ResourceKind::SearchPolicy, name, name))
    }

    async fn create_collection(&self, name: &str) -> ProviderResult<ResourceHandle> {
        let v = self
            .aws(&[
                "opensearchserverless",
                "create-collection",
                "--name",
                name,
                "--type",
                "VECTORSEARCH",
                "--description",
                &format!("vector search collection for {name}"),
            ])
            .await?;
        let arn = Self::str_at(&v, "/createCollectionDetail/arn")?;
        Ok(ResourceHandle::creating(ResourceKind::Collection, name, arn))
    }

    async fn create_vector_index(
        &self,
        collection_endpoint: &str,
        spec: &VectorIndexSpec,
    ) -> ProviderResult<()> {
        // The index is a data-plane object; the CLI signs the request for us.
        let body = json!({
            "settings": { "index.knn": true },
            "mappings": {
                "properties": {
                    "vector_field": {
                        "type": "knn_vector",
                        "dimension": spec.dimension,
                        "method": { "name": "hnsw", "engine": "faiss" }
                    },
                    "text": { "type": "text" },
                    "metadata": { "type": "text" }
                }
            }
        });
        let url = format!("{}/{}", collection_endpoint.trim_end_matches('/'), spec.name);
        let response = self
            .http
            .put(&url)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("index creation request failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 400 {
            let text = response.text().await.unwrap_or_default();
            if text.contains("resource_already_exists_exception") {
                Err(ProviderError::already_exists(format!("index {}", spec.name)))
            } else {
                Err(ProviderError::other(text))
            }
        } else {
            Err(ProviderError::other(format!("index creation returned {status}")))
        }
    }

    async fn create_knowledge_base(
        &self,
        spec: &KnowledgeBaseSpec,
    ) -> ProviderResult<ResourceHandle> {
        let storage = json!({
            "type": "OPENSEARCH_SERVERLESS",
            "opensearchServerlessConfiguration": {
                "collectionArn": spec.collection_id,
                "vectorIndexName": spec.index_name,
                "fieldMapping": {
                    "vectorField": "vector_field",
                    "textField": "text",
                    "metadataField": "metadata"
                }
            }
        });
        let kb_config = json!({
            "type": "VECTOR",
            "vectorKnowledgeBaseConfiguration": {
                "embeddingModelArn": spec.embedding_model
            }
        });
        let v = self
            .aws(&[
                "bedrock-agent",
                "create-knowledge-base",
                "--name",
                &spec.name,
                "--role-arn",
                &spec.role_id,
                "--knowledge-base-configuration",
                &kb_config.to_string(),
                "--storage-configuration",
                &storage.to_string(),
            ])
            .await?;
        let id = Self::str_at(&v, "/knowledgeBase/knowledgeBaseId")?;
        Ok(ResourceHandle::creating(ResourceKind::KnowledgeBase, &spec.name, id))
    }

    async fn create_data_source(
        &self,
        knowledge_base_id: &str,
        bucket: &str,
    ) -> ProviderResult<ResourceHandle> {
        let chunking = ChunkingConfig {
            parent_tokens: 1500,
            child_tokens: 300,
            overlap_tokens: 60,
        };
        let config = json!({
            "type": "S3",
            "s3Configuration": { "bucketArn": format!("arn:aws:s3:::{bucket}") }
        });
        let vector_ingestion = json!({
            "chunkingConfiguration": {
                "chunkingStrategy": "HIERARCHICAL",
                "hierarchicalChunkingConfiguration": {
                    "levelConfigurations": [
                        { "maxTokens": chunking.parent_tokens },
                        { "maxTokens": chunking.child_tokens }
                    ],
                    "overlapTokens": chunking.overlap_tokens
                }
            }
        });
        let v = self
            .aws(&[
                "bedrock-agent",
                "create-data-source",
                "--knowledge-base-id",
                knowledge_base_id,
                "--name",
                &format!("{bucket}-source"),
                "--data-source-configuration",
                &config.to_string(),
                "--vector-ingestion-configuration",
                &vector_ingestion.to_string(),
            ])
            .await?;
        let id = Self::str_at(&v, "/dataSource/dataSourceId")?;
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
        let v = self
            .aws(&[
                "ec2",
                "create-vpc",
                "--cidr-block",
                &cidr.to_string(),
                "--tag-specifications",
                &Self::tag_spec("vpc", name),
            ])
            .await?;
        let vpc_id = Self::str_at(&v, "/Vpc/VpcId")?.to_string();
        self.aws(&[
            "ec2",
            "modify-vpc-attribute",
            "--vpc-id",
            &vpc_id,
            "--enable-dns-hostnames",
        ])
        .await?;
        self.aws(&[
            "ec2",
            "modify-vpc-attribute",
            "--vpc-id",
            &vpc_id,
            "--enable-dns-support",
        ])
        .await?;
        Ok(ResourceHandle::ready(ResourceKind::Vpc, name, vpc_id))
    }

    async fn create_subnet(
        &self,
        name: &str,
        vpc_id: &str,
        cidr: CidrBlock,
        availability_zone: &str,
    ) -> ProviderResult<ResourceHandle> {
        let v = self
            .aws(&[
                "ec2",
                "create-subnet",
                "--vpc-id",
                vpc_id,
                "--cidr-block",
                &cidr.to_string(),
                "--availability-zone",
                availability_zone,
                "--tag-specifications",
                &Self::tag_spec("subnet", name),
            ])
            .await?;
        let id = Self::str_at(&v, "/Subnet/SubnetId")?;
        Ok(ResourceHandle::creating(ResourceKind::Subnet, name, id))
    }

    async fn create_internet_gateway(
        &self,
        name: &str,
        vpc_id: &str,
    ) -> ProviderResult<ResourceHandle> {
        let v = self
            .aws(&[
                "ec2",
                "create-internet-gateway",
                "--tag-specifications",
                &Self::tag_spec("internet-gateway", name),
            ])
            .await?;
        let igw_id = Self::str_at(&v, "/InternetGateway/InternetGatewayId")?.to_string();
        self.aws(&[
            "ec2",
            "attach-internet-gateway",
            "--internet-gateway-id",
            &igw_id,
            "--vpc-id",
            vpc_id,
        ])
        .await?;
        Ok(ResourceHandle::ready(ResourceKind::InternetGateway, name, igw_id))
    }

    async fn create_nat_gateway(
        &self,
        name: &str,
        subnet_id: &str,
    ) -> ProviderResult<ResourceHandle> {
        let eip = self
            .aws(&["ec2", "allocate-address", "--domain", "vpc"])
            .await?;
        let allocation_id = Self::str_at(&eip, "/AllocationId")?.to_string();
        let v = self
            .aws(&[
                "ec2",
                "create-nat-gateway",
                "--subnet-id",
                subnet_id,
                "--allocation-id",
                &allocation_id,
                "--tag-specifications",
                &Self::tag_spec("natgateway", name),
            ])
            .await?;
        let id = Self::str_at(&v, "/NatGateway/NatGatewayId")?;
        Ok(ResourceHandle::creating(ResourceKind::NatGateway, name, id))
    }

    async fn route_subnets(
        &self,
        name: &str,
        vpc_id: &str,
        subnet_ids: &[String],
        target: RouteTarget,
    ) -> ProviderResult<()> {
        let v = self
            .aws(&[
                "ec2",
                "create-route-table",
                "--vpc-id",
                vpc_id,
                "--tag-specifications",
                &Self::tag_spec("route-table", name),
            ])
            .await?;
        let rt_id = Self::str_at(&v, "/RouteTable/RouteTableId")?.to_string();
        let (flag, gateway_id) = match &target {
            RouteTarget::InternetGateway(id) => ("--gateway-id", id.clone()),
            RouteTarget::NatGateway(id) => ("--nat-gateway-id", id.clone()),
        };
        self.aws(&[
            "ec2",
            "create-route",
            "--route-table-id",
            &rt_id,
            "--destination-cidr-block",
            "0.0.0.0/0",
            flag,
            &gateway_id,
        ])
        .await?;
        for subnet_id in subnet_ids {
            self.aws(&[
                "ec2",
                "associate-route-table",
                "--route-table-id",
                &rt_id,
                "--subnet-id",
                subnet_id,
            ])
            .await?;
        }
        Ok(())
    }

    async fn create_security_group(
        &self,
        name: &str,
        vpc_id: &str,
        description: &str,
        rules: &[IngressRule],
    ) -> ProviderResult<ResourceHandle> {
        let v = self
            .aws(&[
                "ec2",
                "create-security-group",
                "--group-name",
                name,
                "--description",
                description,
                "--vpc-id",
                vpc_id,
                "--tag-specifications",
                &Self::tag_spec("security-group", name),
            ])
            .await?;
        let group_id = Self::str_at(&v, "/GroupId")?.to_string();
        for rule in rules {
            let permission = match &rule.source {
                IngressSource::Anywhere => json!([{
                    "IpProtocol": "tcp",
                    "FromPort": rule.port,
                    "ToPort": rule.port,
                    "IpRanges": [{ "CidrIp": "0.0.0.0/0" }]
                }]),
                IngressSource::Group(source_group) => json!([{
                    "IpProtocol": "tcp",
                    "FromPort": rule.port,
                    "ToPort": rule.port,
                    "UserIdGroupPairs": [{ "GroupId": source_group }]
                }]),
                IngressSource::Block(block) => json!([{
                    "IpProtocol": "tcp",
                    "FromPort": rule.port,
                    "ToPort": rule.port,
                    "IpRanges": [{ "CidrIp": block.to_string() }]
                }]),
            };
            match self
                .aws(&[
                    "ec2",
                    "authorize-security-group-ingress",
                    "--group-id",
                    &group_id,
                    "--ip-permissions",
                    &permission.to_string(),
                ])
                .await
            {
                Ok(_) => {}
                Err(err) if err.is(ErrorClass::AlreadyExists) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(ResourceHandle::ready(ResourceKind::SecurityGroup, name, group_id))
    }

    async fn create_service_endpoint(
        &self,
        name: &str,
        vpc_id: &str,
        service: &str,
        subnet_ids: &[String],
        security_group_id: &str,
    ) -> ProviderResult<ResourceHandle> {
        let mut args: Vec<String> = vec![
            "ec2".into(),
            "create-vpc-endpoint".into(),
            "--vpc-id".into(),
            vpc_id.into(),
            "--service-name".into(),
            format!("com.amazonaws.{}.{}", self.region, service),
            "--vpc-endpoint-type".into(),
            "Interface".into(),
            "--private-dns-enabled".into(),
            "--security-group-ids".into(),
            security_group_id.into(),
            "--subnet-ids".into(),
        ];
        args.extend(subnet_ids.iter().cloned());
        args.push("--tag-specifications".into());
        args.push(Self::tag_spec("vpc-endpoint", name));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let v = self.aws(&arg_refs).await?;
        let id = Self::str_at(&v, "/VpcEndpoint/VpcEndpointId")?;
        Ok(ResourceHandle::ready(ResourceKind::VpcEndpoint, name, id))
    }

    async fn create_load_balancer(
        &self,
        name: &str,
        subnet_ids: &[String],
        security_group_id: &str,
    ) -> ProviderResult<ResourceHandle> {
        let mut args: Vec<String> = vec![
            "elbv2".into(),
            "create-load-balancer".into(),
            "--name".into(),
            name.into(),
            "--scheme".into(),
            "internet-facing".into(),
            "--type".into(),
            "application".into(),
            "--security-groups".into(),
            security_group_id.into(),
            "--subnets".into(),
        ];
        args.extend(subnet_ids.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let v = self.aws(&arg_refs).await?;
        let arn = Self::str_at(&v, "/LoadBalancers/0/LoadBalancerArn")?.to_string();
        let dns = Self::str_at(&v, "/LoadBalancers/0/DNSName")?;
        Ok(ResourceHandle::ready(ResourceKind::LoadBalancer, name, arn).with_endpoint(dns))
    }

    async fn create_target_group(
        &self,
        name: &str,
        vpc_id: &str,
        port: u16,
    ) -> ProviderResult<ResourceHandle> {
        let v = self
            .aws(&[
                "elbv2",
                "create-target-group",
                "--name",
                name,
                "--protocol",
                "HTTP",
                "--port",
                &port.to_string(),
                "--vpc-id",
                vpc_id,
                "--health-check-protocol",
                "HTTP",
                "--health-check-path",
                "/",
                "--target-type",
                "instance",
            ])
            .await?;
        let arn = Self::str_at(&v, "/TargetGroups/0/TargetGroupArn")?;
        Ok(ResourceHandle::ready(ResourceKind::TargetGroup, name, arn))
    }

    async fn create_listener(
        &self,
        load_balancer_id: &str,
        target_group_id: &str,
        port: u16,
        custom_header: &(String, String),
    ) -> ProviderResult<ResourceHandle> {
        let actions = json!([{ "Type": "forward", "TargetGroupArn": target_group_id }]);
        let created = self
            .aws(&[
                "elbv2",
                "create-listener",
                "--load-balancer-arn",
                load_balancer_id,
                "--protocol",
                "HTTP",
                "--port",
                &port.to_string(),
                "--default-actions",
                &actions.to_string(),
            ])
            .await;
        let v = match created {
            Ok(v) => v,
            // Re-describe on duplicate so re-runs converge on the existing
            // listener instead of failing.
            Err(err) if err.is(ErrorClass::AlreadyExists) => {
                self.aws(&[
                    "elbv2",
                    "describe-listeners",
                    "--load-balancer-arn",
                    load_balancer_id,
                ])
                .await?
            }
            Err(err) => return Err(err),
        };
        let arn = v
            .pointer("/Listeners/0/ListenerArn")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::other("listener arn missing from cli output"))?
            .to_string();
        let conditions = json!([{
            "Field": "http-header",
            "HttpHeaderConfig": {
                "HttpHeaderName": custom_header.0,
                "Values": [custom_header.1]
            }
        }]);
        match self
            .aws(&[
                "elbv2",
                "create-rule",
                "--listener-arn",
                &arn,
                "--priority",
                "10",
                "--conditions",
                &conditions.to_string(),
                "--actions",
                &actions.to_string(),
            ])
            .await
        {
            Ok(_) => {}
            Err(err) if err.is(ErrorClass::AlreadyExists) => {}
            Err(err) => return Err(err),
        }
        Ok(ResourceHandle::ready(ResourceKind::Listener, "listener", arn))
    }

    async fn create_distribution(&self, spec: &DistributionSpec) -> ProviderResult<ResourceHandle> {
        let caller_reference = format!("{}-{}", spec.comment, chrono::Utc::now().timestamp());
        let dynamic_origin_id = format!("{}-dynamic", spec.comment);
        let static_origin_id = format!("{}-static", spec.comment);
        let cache_behaviors: Vec<Value> = spec
            .static_patterns
            .iter()
            .map(|pattern| {
                json!({
                    "PathPattern": pattern,
                    "TargetOriginId": static_origin_id,
                    "ViewerProtocolPolicy": "redirect-to-https",
                    "AllowedMethods": {
                        "Quantity": 2,
                        "Items": ["GET", "HEAD"],
                        "CachedMethods": { "Quantity": 2, "Items": ["GET", "HEAD"] }
                    },
                    "Compress": true,
                    "ForwardedValues": {
                        "QueryString": false,
                        "Cookies": { "Forward": "none" }
                    },
                    "MinTTL": 0
                })
            })
            .collect();
        let config = json!({
            "CallerReference": caller_reference,
            "Comment": spec.comment,
            "Enabled": true,
            "PriceClass": "PriceClass_200",
            "Origins": {
                "Quantity": 2,
                "Items": [
                    {
                        "Id": dynamic_origin_id,
                        "DomainName": spec.load_balancer_domain,
                        "CustomOriginConfig": {
                            "HTTPPort": 80,
                            "HTTPSPort": 443,
                            "OriginProtocolPolicy": "http-only",
                            "OriginSslProtocols": { "Quantity": 1, "Items": ["TLSv1.2"] }
                        },
                        "CustomHeaders": {
                            "Quantity": 1,
                            "Items": [{
                                "HeaderName": spec.custom_header.0,
                                "HeaderValue": spec.custom_header.1
                            }]
                        }
                    },
                    {
                        "Id": static_origin_id,
                        "DomainName": spec.bucket_domain,
                        "S3OriginConfig": { "OriginAccessIdentity": "" }
                    }
                ]
            },
            "DefaultCacheBehavior": {
                "TargetOriginId": dynamic_origin_id,
                "ViewerProtocolPolicy": "redirect-to-https",
                "AllowedMethods": {
                    "Quantity": 7,
                    "Items": ["GET", "HEAD", "OPTIONS", "PUT", "POST", "PATCH", "DELETE"],
                    "CachedMethods": { "Quantity": 2, "Items": ["GET", "HEAD"] }
                },
                "Compress": true,
                "ForwardedValues": {
                    "QueryString": true,
                    "Cookies": { "Forward": "all" },
                    "Headers": { "Quantity": 1, "Items": [spec.custom_header.0] }
                },
                "MinTTL": 0
            },
            "CacheBehaviors": {
                "Quantity": cache_behaviors.len(),
                "Items": cache_behaviors
            }
        });
        let v = self
            .aws(&[
                "cloudfront",
                "create-distribution",
                "--distribution-config",
                &config.to_string(),
            ])
            .await?;
        let id = Self::str_at(&v, "/Distribution/Id")?.to_string();
        let domain = Self::str_at(&v, "/Distribution/DomainName")?;
        Ok(ResourceHandle::ready(ResourceKind::Distribution, &spec.comment, id)
            .with_endpoint(domain))
    }

    async fn latest_image_id(&self) -> ProviderResult<String> {
        let v = self
            .aws(&[
                "ec2",
                "describe-images",
                "--owners",
                "amazon",
                "--filters",
                "Name=name,Values=al2023-ami-*-x86_64",
                "Name=state,Values=available",
            ])
            .await?;
        let mut images: Vec<(&str, &str)> = v
            .pointer("/Images")
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(|image| {
                        Some((
                            image.pointer("/CreationDate").and_then(Value::as_str)?,
                            image.pointer("/ImageId").and_then(Value::as_str)?,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        images.sort();
        images
            .last()
            .map(|(_, id)| id.to_string())
            .ok_or_else(|| ProviderError::not_found("no base image available"))
    }

    async fn run_instance(&self, spec: &InstanceSpec) -> ProviderResult<ResourceHandle> {
        let network_interface = json!([{
            "DeviceIndex": 0,
            "SubnetId": spec.subnet_id,
            "Groups": [spec.security_group_id],
            "AssociatePublicIpAddress": false,
            "DeleteOnTermination": true
        }]);
        let block_devices = json!([{
            "DeviceName": "/dev/xvda",
            "Ebs": {
                "VolumeSize": 80,
                "DeleteOnTermination": true,
                "Encrypted": true,
                "VolumeType": "gp3"
            }
        }]);
        let v = self
            .aws(&[
                "ec2",
                "run-instances",
                "--image-id",
                &spec.image_id,
                "--instance-type",
                &spec.instance_type,
                "--count",
                "1",
                "--iam-instance-profile",
                &format!("Name={}", spec.instance_profile),
                "--network-interfaces",
                &network_interface.to_string(),
                "--block-device-mappings",
                &block_devices.to_string(),
                "--monitoring",
                "Enabled=true",
                "--tag-specifications",
                &Self::tag_spec("instance", &spec.name),
            ])
            .await?;
        let id = Self::str_at(&v, "/Instances/0/InstanceId")?;
        Ok(ResourceHandle::creating(ResourceKind::Instance, &spec.name, id))
    }

    async fn register_target(
        &self,
        target_group_id: &str,
        instance_id: &str,
        port: u16,
    ) -> ProviderResult<()> {
        self.aws(&[
            "elbv2",
            "register-targets",
            "--target-group-arn",
            target_group_id,
            "--targets",
            &format!("Id={instance_id},Port={port}"),
        ])
        .await?;
        Ok(())
    }

    async fn send_command(&self, instance_id: &str, script: &str) -> ProviderResult<String> {
        let parameters = json!({ "commands": [script] });
        let v = self
            .aws(&[
                "ssm",
                "send-command",
                "--instance-ids",
                instance_id,
                "--document-name",
                "AWS-RunShellScript",
                "--timeout-seconds",
                "3600",
                "--parameters",
                &parameters.to_string(),
            ])
            .await?;
        Ok(Self::str_at(&v, "/Command/CommandId")?.to_string())
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()> {
        let args: Vec<String> = match kind {
            ResourceKind::Bucket => vec!["s3api".into(), "delete-bucket".into(), "--bucket".into(), id.into()],
            ResourceKind::Role => vec!["iam".into(), "delete-role".into(), "--role-name".into(), id.into()],
            ResourceKind::Secret => vec![
                "secretsmanager".into(),
                "delete-secret".into(),
                "--secret-id".into(),
                id.into(),
                "--force-delete-without-recovery".into(),
            ],
            ResourceKind::SearchPolicy => {
                let (cmd, type_arg) = if id.starts_with("data-") {
                    ("delete-access-policy", "data")
                } else if id.starts_with("network-") {
                    ("delete-security-policy", "network")
                } else {
                    ("delete-security-policy", "encryption")
                };
                vec![
                    "opensearchserverless".into(),
                    cmd.into(),
                    "--name".into(),
                    id.into(),
                    "--type".into(),
                    type_arg.into(),
                ]
            }
            ResourceKind::Collection => vec![
                "opensearchserverless".into(),
                "delete-collection".into(),
                "--id".into(),
                id.into(),
            ],
            ResourceKind::VectorIndex => return Ok(()),
            ResourceKind::KnowledgeBase => vec![
                "bedrock-agent".into(),
                "delete-knowledge-base".into(),
                "--knowledge-base-id".into(),
                id.into(),
            ],
            ResourceKind::Vpc => vec!["ec2".into(), "delete-vpc".into(), "--vpc-id".into(), id.into()],
            ResourceKind::Subnet => vec!["ec2".into(), "delete-subnet".into(), "--subnet-id".into(), id.into()],
            ResourceKind::InternetGateway => vec![
                "ec2".into(),
                "delete-internet-gateway".into(),
                "--internet-gateway-id".into(),
                id.into(),
            ],
            ResourceKind::NatGateway => vec![
                "ec2".into(),
                "delete-nat-gateway".into(),
                "--nat-gateway-id".into(),
                id.into(),
            ],
            // Associations disappear with the subnets, which go first.
            ResourceKind::RouteTable => vec![
                "ec2".into(),
                "delete-route-table".into(),
                "--route-table-id".into(),
                id.into(),
            ],
            ResourceKind::SecurityGroup => vec![
                "ec2".into(),
                "delete-security-group".into(),
                "--group-id".into(),
                id.into(),
            ],
            ResourceKind::VpcEndpoint => vec![
                "ec2".into(),
                "delete-vpc-endpoints".into(),
                "--vpc-endpoint-ids".into(),
                id.into(),
            ],
            ResourceKind::LoadBalancer => vec![
                "elbv2".into(),
                "delete-load-balancer".into(),
                "--load-balancer-arn".into(),
                id.into(),
            ],
            ResourceKind::TargetGroup => vec![
                "elbv2".into(),
                "delete-target-group".into(),
                "--target-group-arn".into(),
                id.into(),
            ],
            ResourceKind::Listener => vec![
                "elbv2".into(),
                "delete-listener".into(),
                "--listener-arn".into(),
                id.into(),
            ],
            ResourceKind::Distribution => vec![
                "cloudfront".into(),
                "delete-distribution".into(),
                "--id".into(),
                id.into(),
            ],
            ResourceKind::Instance => vec![
                "ec2".into(),
                "terminate-instances".into(),
                "--instance-ids".into(),
                id.into(),
            ],
        };
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.aws(&arg_refs).await?;
        Ok(())
    }

    async fn release_address(&self, allocation_id: &str) -> ProviderResult<()> {
        self.aws(&["ec2", "release-address", "--allocation-id", allocation_id])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_already_exists_codes() {
        for stderr in [
            "An error occurred (EntityAlreadyExists) when calling the CreateRole operation",
            "An error occurred (BucketAlreadyOwnedByYou) when calling the CreateBucket operation",
            "An error occurred (ConflictException) when calling the CreateCollection operation",
            "An error occurred (DuplicateListener) when calling the CreateListener operation",
        ] {
            assert_eq!(classify(stderr), ErrorClass::AlreadyExists, "{stderr}");
        }
    }

    #[test]
    fn test_classify_not_found_codes() {
        for stderr in [
            "An error occurred (ResourceNotFoundException) when calling the DescribeSecret operation",
            "An error occurred (LoadBalancerNotFound) when calling the DescribeLoadBalancers operation",
            "An error occurred (NoSuchEntity) when calling the GetRole operation",
        ] {
            assert_eq!(classify(stderr), ErrorClass::NotFound, "{stderr}");
        }
    }

    #[test]
    fn test_classify_quota_and_transient() {
        assert_eq!(
            classify("An error occurred (AddressLimitExceeded) when calling the AllocateAddress operation"),
            ErrorClass::QuotaExhausted
        );
        assert_eq!(
            classify("An error occurred (Throttling) when calling the DescribeVpcs operation"),
            ErrorClass::Transient
        );
        assert_eq!(classify("something unexpected"), ErrorClass::Other);
    }

    #[test]
    fn test_classify_request_throttling_is_transient_not_quota() {
        assert_eq!(
            classify("An error occurred (RequestLimitExceeded) when calling the RunInstances operation"),
            ErrorClass::Transient
        );
    }
}
