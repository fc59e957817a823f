//! Shared data model for the stackctl provisioning orchestrator.
//!
//! Everything in this crate is pure data: no provider calls, no I/O beyond
//! writing the final summary artifact. The orchestrator binary depends on
//! these types; nothing here depends on the orchestrator.

pub mod cidr;
pub mod context;
pub mod error;
pub mod handle;
pub mod plan;
pub mod summary;

pub use cidr::{AddressAllocation, CidrBlock, CANDIDATE_BLOCKS};
pub use context::ProjectContext;
pub use error::{ErrorClass, ProviderError, StageError};
pub use handle::{ResourceHandle, ResourceKind, ResourceState};
pub use plan::{DeploymentPlan, StageId, StageStatus};
pub use summary::DeploymentSummary;
