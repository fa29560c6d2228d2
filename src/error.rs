// src/error.rs
use thiserror::Error;
use uuid::Uuid;

use crate::models::{HierarchyId, MatchStatus, RegionId};

/// Outcomes callers need to tell apart from plain failures. Exposed
/// operations return `anyhow::Result`; downcast to this type to inspect them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("a matching run is already in progress for hierarchy {0}")]
    AlreadyRunning(HierarchyId),
    #[error("matching run was cancelled")]
    Cancelled,
    #[error("region {0} not found")]
    RegionNotFound(RegionId),
    #[error("region {0} is already resolved ({1})")]
    AlreadyResolved(RegionId, MatchStatus),
    #[error("hierarchy {0} not found or has no regions")]
    HierarchyNotFound(HierarchyId),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
}

/// True when `err` (or anything it wraps) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<MatchError>(), Some(MatchError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_cancellation_survives_context() {
        let err: anyhow::Result<()> = Err(MatchError::Cancelled.into());
        let err = err.context("while geocoding").unwrap_err();
        assert!(is_cancelled(&err));
        let other = anyhow::anyhow!("boom");
        assert!(!is_cancelled(&other));
    }
}
