//! Error taxonomy for provider calls and deployment stages.
//!
//! Provider failures are classified exactly once, at the provider boundary,
//! into a closed set of classes. Provisioners branch on the class and never
//! re-parse message text.

use crate::handle::ResourceKind;
use crate::plan::StageId;
use thiserror::Error;

/// Closed classification of provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The resource does not exist. Expected; drives create-vs-reuse.
    NotFound,
    /// The resource already exists. Expected under re-run or race.
    AlreadyExists,
    /// Throttling, timeouts at the transport level, service hiccups.
    Transient,
    /// Address range or quota exhausted.
    QuotaExhausted,
    /// A validated precondition does not hold (fatal, with remediation).
    PreconditionViolated,
    /// A readiness poll gave up before the resource became usable.
    Timeout,
    /// Anything else. Fatal for the owning stage.
    Other,
}

/// A failure reported by the cloud provider, classified at the boundary.
#[derive(Debug, Clone, Error)]
#[error("{class:?}: {message}")]
pub struct ProviderError {
    pub class: ErrorClass,
    pub message: String,
}

impl ProviderError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::AlreadyExists, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn quota_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::QuotaExhausted, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::PreconditionViolated, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Other, message)
    }

    pub fn is(&self, class: ErrorClass) -> bool {
        self.class == class
    }
}

/// A provider error enriched with the stage and resource kind it belongs to.
///
/// Only the sequencer is allowed to halt the run; everything below it wraps
/// failures in this type and bubbles them up.
#[derive(Debug, Error)]
#[error("stage {stage} failed while provisioning {kind}: {source}")]
pub struct StageError {
    pub stage: StageId,
    pub kind: ResourceKind,
    #[source]
    pub source: ProviderError,
}

impl StageError {
    pub fn new(stage: StageId, kind: ResourceKind, source: ProviderError) -> Self {
        Self {
            stage,
            kind,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class_roundtrip() {
        let err = ProviderError::already_exists("vpc-for-demo");
        assert!(err.is(ErrorClass::AlreadyExists));
        assert!(!err.is(ErrorClass::NotFound));
    }

    #[test]
    fn test_stage_error_names_stage_and_kind() {
        let err = StageError::new(
            StageId::Network,
            ResourceKind::Subnet,
            ProviderError::timeout("subnet never left pending"),
        );
        let text = err.to_string();
        assert!(text.contains("network"));
        assert!(text.contains("subnet"));
    }
}
