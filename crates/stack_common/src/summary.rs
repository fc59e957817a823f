//! The deployment summary artifact.
//!
//! This is the single hand-off contract to every external consumer: the
//! chat front-end reads it for endpoints and identifiers, operators read it
//! for the CDN URL. It is overwritten wholesale on each successful run and
//! written via a temp file + rename so a crash can never leave a partial
//! document behind.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub generated_at: DateTime<Utc>,
    pub project: String,
    pub account_id: String,
    pub region: String,
    pub bucket: String,
    pub vpc_id: String,
    pub public_subnet_ids: Vec<String>,
    pub private_subnet_ids: Vec<String>,
    pub load_balancer_endpoint: String,
    pub distribution_domain: String,
    pub instance_id: String,
    pub collection_endpoint: String,
    pub knowledge_base_id: String,
    /// Wall-clock duration of the run that produced this summary.
    pub elapsed_seconds: u64,
}

impl DeploymentSummary {
    /// Public URL of the deployed application.
    pub fn sharing_url(&self) -> String {
        format!("https://{}", self.distribution_domain)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body)
            .with_context(|| format!("writing summary to {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("publishing summary at {}", path.display()))?;
        debug!(path = %path.display(), "summary written");
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("reading summary from {}", path.display()))?;
        serde_json::from_str(&body).context("summary artifact is not valid JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeploymentSummary {
        DeploymentSummary {
            generated_at: Utc::now(),
            project: "es-us".into(),
            account_id: "123456789012".into(),
            region: "us-west-2".into(),
            bucket: "storage-for-es-us-123456789012-us-west-2".into(),
            vpc_id: "vpc-0abc".into(),
            public_subnet_ids: vec!["subnet-1".into(), "subnet-2".into()],
            private_subnet_ids: vec!["subnet-3".into(), "subnet-4".into()],
            load_balancer_endpoint: "alb-for-es-us.elb.test".into(),
            distribution_domain: "d123.cdn.test".into(),
            instance_id: "i-0def".into(),
            collection_endpoint: "https://col.search.test".into(),
            knowledge_base_id: "KB123".into(),
            elapsed_seconds: 840,
        }
    }

    #[test]
    fn test_write_then_read_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = sample();
        summary.write(&path).unwrap();
        assert_eq!(DeploymentSummary::read(&path).unwrap(), summary);
        // No temp file left behind.
        assert!(!dir.path().join("summary.json.tmp").exists());
    }

    #[test]
    fn test_sharing_url_uses_distribution_domain() {
        assert_eq!(sample().sharing_url(), "https://d123.cdn.test");
    }
}
