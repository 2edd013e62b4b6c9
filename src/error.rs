/// Worker error taxonomy
///
/// Every fallible operation in the worker core returns `WorkerError`. The
/// classification helpers decide whether the consumer retries a job,
/// dead-letters it, or treats the failure as a startup fault.

use crate::sandbox::SandboxState;
use std::time::Duration;
use uuid::Uuid;

/// Result alias used throughout the worker core
pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("job queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("lock store unavailable: {0}")]
    LockStoreUnavailable(String),

    #[error("concurrency capacity exceeded for project '{project_id}' after waiting {waited:?}")]
    CapacityExceeded { project_id: String, waited: Duration },

    #[error("dependency install failed for sandbox {sandbox_id}: {reason}")]
    InstallFailed { sandbox_id: Uuid, reason: String },

    #[error("sandbox {sandbox_id} is {state}, executions require READY")]
    SandboxNotReady { sandbox_id: Uuid, state: SandboxState },

    #[error("invalid sandbox transition {from} -> {to}")]
    InvalidTransition { from: SandboxState, to: SandboxState },

    #[error("piece action '{0}' is not installed in this sandbox")]
    UnknownAction(String),

    #[error("flow version not found: {0}")]
    FlowVersionNotFound(String),

    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    #[error("no webhook trigger registered for flow '{0}'")]
    UnknownTrigger(String),

    #[error("webhook renewal failed for flow '{flow_id}': {reason}")]
    RenewalFailed { flow_id: String, reason: String },

    #[error("sandbox runtime failure: {0}")]
    Runtime(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl WorkerError {
    /// Transient failures: the job goes back to the queue until its attempts run out
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::QueueUnavailable(_)
                | WorkerError::LockStoreUnavailable(_)
                | WorkerError::CapacityExceeded { .. }
                | WorkerError::InstallFailed { .. }
                | WorkerError::Runtime(_)
                | WorkerError::Storage(_)
                | WorkerError::Io(_)
                | WorkerError::Http(_)
        )
    }

    /// Programming-contract violations. Never retried, never swallowed.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            WorkerError::SandboxNotReady { .. } | WorkerError::InvalidTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_and_invariant_faults() {
        let capacity = WorkerError::CapacityExceeded {
            project_id: "acme".into(),
            waited: Duration::from_secs(1),
        };
        assert!(capacity.is_retryable());
        assert!(!capacity.is_invariant_violation());

        let not_ready = WorkerError::SandboxNotReady {
            sandbox_id: Uuid::new_v4(),
            state: SandboxState::Initialized,
        };
        assert!(not_ready.is_invariant_violation());
        assert!(!not_ready.is_retryable());

        assert!(!WorkerError::FlowVersionNotFound("fv-1".into()).is_retryable());
    }

    #[test]
    fn not_ready_message_names_the_state() {
        let err = WorkerError::SandboxNotReady {
            sandbox_id: Uuid::nil(),
            state: SandboxState::Created,
        };
        assert!(err.to_string().contains("CREATED"));
    }
}
