//! Project context: the immutable input every resource name derives from.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Immutable deployment input, constructed once at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Project identifier, at least three characters.
    pub project: String,
    /// Target region, e.g. `us-west-2`.
    pub region: String,
    /// Numeric account identifier of the target account.
    pub account_id: String,
}

impl ProjectContext {
    pub fn new(
        project: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Result<Self> {
        let project = project.into();
        let region = region.into();
        let account_id = account_id.into();
        if project.len() < 3 {
            bail!("project name must be at least 3 characters, got '{project}'");
        }
        if region.is_empty() {
            bail!("region must not be empty");
        }
        if account_id.is_empty() {
            bail!("account id must not be empty");
        }
        Ok(Self {
            project,
            region,
            account_id,
        })
    }

    // Name derivation. Names are deterministic so the registry can look a
    // resource up before any create call is issued.

    pub fn bucket_name(&self) -> String {
        format!(
            "storage-for-{}-{}-{}",
            self.project, self.account_id, self.region
        )
    }

    pub fn role_name(&self, logical: &str) -> String {
        format!("role-{}-for-{}-{}", logical, self.project, self.region)
    }

    pub fn instance_profile_name(&self) -> String {
        format!("instance-profile-{}-{}", self.project, self.region)
    }

    pub fn weather_secret_name(&self) -> String {
        format!("openweathermap-{}", self.project)
    }

    pub fn search_secret_name(&self) -> String {
        format!("tavilyapikey-{}", self.project)
    }

    pub fn encryption_policy_name(&self) -> String {
        format!("encryption-{}-{}", self.project, self.region)
    }

    pub fn network_policy_name(&self) -> String {
        format!("network-{}-{}", self.project, self.region)
    }

    pub fn data_policy_name(&self) -> String {
        format!("data-{}", self.project)
    }

    pub fn collection_name(&self) -> String {
        self.project.clone()
    }

    pub fn vector_index_name(&self) -> String {
        format!("{}-index", self.project)
    }

    pub fn knowledge_base_name(&self) -> String {
        format!("kb-for-{}", self.project)
    }

    pub fn vpc_name(&self) -> String {
        format!("vpc-for-{}", self.project)
    }

    pub fn internet_gateway_name(&self) -> String {
        format!("igw-{}", self.project)
    }

    pub fn nat_gateway_name(&self) -> String {
        format!("nat-{}", self.project)
    }

    pub fn public_subnet_name(&self, n: usize) -> String {
        format!("public-subnet-for-{}-{}", self.project, n + 1)
    }

    pub fn private_subnet_name(&self, n: usize) -> String {
        format!("private-subnet-for-{}-{}", self.project, n + 1)
    }

    pub fn public_route_table_name(&self) -> String {
        format!("public-rt-{}", self.project)
    }

    pub fn private_route_table_name(&self) -> String {
        format!("private-rt-{}", self.project)
    }

    pub fn edge_security_group_name(&self) -> String {
        format!("alb-sg-for-{}", self.project)
    }

    pub fn app_security_group_name(&self) -> String {
        format!("ec2-sg-for-{}", self.project)
    }

    pub fn endpoint_security_group_name(&self) -> String {
        format!("vpce-sg-for-{}", self.project)
    }

    pub fn service_endpoint_name(&self, service: &str) -> String {
        format!("vpce-{}-for-{}", service, self.project)
    }

    pub fn load_balancer_name(&self) -> String {
        format!("alb-for-{}", self.project)
    }

    pub fn target_group_name(&self) -> String {
        format!("tg-for-{}", self.project)
    }

    pub fn distribution_comment(&self) -> String {
        format!("distribution-for-{}", self.project)
    }

    pub fn instance_name(&self) -> String {
        format!("app-for-{}", self.project)
    }

    /// Shared-secret header the CDN adds so the load balancer only forwards
    /// traffic that came through the distribution.
    pub fn custom_header(&self) -> (String, String) {
        (
            "X-Custom-Header".to_string(),
            format!("{}_12dab15e4s31", self.project),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ProjectContext {
        ProjectContext::new("es-us", "us-west-2", "123456789012").unwrap()
    }

    #[test]
    fn test_project_name_minimum_length() {
        assert!(ProjectContext::new("ab", "us-west-2", "1").is_err());
        assert!(ProjectContext::new("abc", "us-west-2", "1").is_ok());
    }

    #[test]
    fn test_bucket_name_layout() {
        assert_eq!(
            ctx().bucket_name(),
            "storage-for-es-us-123456789012-us-west-2"
        );
    }

    #[test]
    fn test_role_names_carry_region() {
        assert_eq!(
            ctx().role_name("knowledge-base"),
            "role-knowledge-base-for-es-us-us-west-2"
        );
    }

    #[test]
    fn test_subnet_names_are_one_based() {
        assert_eq!(ctx().public_subnet_name(0), "public-subnet-for-es-us-1");
        assert_eq!(ctx().private_subnet_name(1), "private-subnet-for-es-us-2");
    }
}
