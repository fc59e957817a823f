//! The fixed ten-stage deployment plan.
//!
//! The dependency graph is known in advance and close to linear, so the
//! plan is a static table rather than a computed schedule. Stage order is
//! the execution order; dependencies are recorded so entry points that run
//! a subset of stages can validate what they need.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The ten deployment stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Bucket,
    Identity,
    Secrets,
    VectorStore,
    Network,
    KnowledgeBase,
    LoadBalancer,
    Distribution,
    Compute,
    EdgeBinding,
}

impl StageId {
    pub const ALL: [StageId; 10] = [
        StageId::Bucket,
        StageId::Identity,
        StageId::Secrets,
        StageId::VectorStore,
        StageId::Network,
        StageId::KnowledgeBase,
        StageId::LoadBalancer,
        StageId::Distribution,
        StageId::Compute,
        StageId::EdgeBinding,
    ];

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageId::Bucket => "bucket",
            StageId::Identity => "identity",
            StageId::Secrets => "secrets",
            StageId::VectorStore => "vector-store",
            StageId::Network => "network",
            StageId::KnowledgeBase => "knowledge-base",
            StageId::LoadBalancer => "load-balancer",
            StageId::Distribution => "distribution",
            StageId::Compute => "compute",
            StageId::EdgeBinding => "edge-binding",
        };
        write!(f, "{}", name)
    }
}

/// Per-stage lifecycle inside one sequencer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// One row of the deployment plan.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub stage: StageId,
    /// Indices into the plan of the stages this one consumes outputs from.
    pub dependencies: &'static [usize],
}

/// The fixed plan: ten stages, dependencies by stage index.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    stages: Vec<StageDescriptor>,
}

impl DeploymentPlan {
    pub fn standard() -> Self {
        let stages = vec![
            StageDescriptor {
                stage: StageId::Bucket,
                dependencies: &[],
            },
            StageDescriptor {
                stage: StageId::Identity,
                dependencies: &[],
            },
            StageDescriptor {
                stage: StageId::Secrets,
                dependencies: &[],
            },
            StageDescriptor {
                stage: StageId::VectorStore,
                dependencies: &[1],
            },
            StageDescriptor {
                stage: StageId::Network,
                dependencies: &[],
            },
            StageDescriptor {
                stage: StageId::KnowledgeBase,
                dependencies: &[0, 1, 3],
            },
            StageDescriptor {
                stage: StageId::LoadBalancer,
                dependencies: &[4],
            },
            StageDescriptor {
                stage: StageId::Distribution,
                dependencies: &[0, 6],
            },
            StageDescriptor {
                stage: StageId::Compute,
                dependencies: &[1, 4, 5, 7],
            },
            StageDescriptor {
                stage: StageId::EdgeBinding,
                dependencies: &[6, 8],
            },
        ];
        Self { stages }
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_has_ten_stages_in_order() {
        let plan = DeploymentPlan::standard();
        assert_eq!(plan.len(), 10);
        for (i, descriptor) in plan.stages().iter().enumerate() {
            assert_eq!(descriptor.stage, StageId::ALL[i]);
            assert_eq!(descriptor.stage.index(), i);
        }
    }

    #[test]
    fn test_dependencies_point_backwards() {
        let plan = DeploymentPlan::standard();
        for (i, descriptor) in plan.stages().iter().enumerate() {
            for &dep in descriptor.dependencies {
                assert!(dep < i, "stage {} depends on later stage {}", i, dep);
            }
        }
    }
}
