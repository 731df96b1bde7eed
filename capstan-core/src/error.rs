//! Error types for capstan.
//!
//! One error enum spans the whole controller so that classification
//! survives crate boundaries: the engine, the agent fabric, and the CLI all
//! agree on what is retryable, what aborts the operation, and what reaches
//! the user verbatim.

use thiserror::Error;

use crate::store::Revision;

/// The main error type for capstan operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Validation rejected the request before anything was persisted.
    #[error("precondition failed: {reason}")]
    PreconditionFailed {
        /// Human-readable rejection, surfaced to the user as-is.
        reason: String,
    },

    /// The backend lacks a capability required by the operation flavor.
    #[error("not implemented: {hint}")]
    NotImplemented {
        /// Remediation hint shown to the user.
        hint: String,
    },

    /// A plan-store compare-and-swap lost against a concurrent writer.
    #[error("stale plan revision: have {have}, store is at {actual}")]
    StaleRevision {
        /// The revision the caller based its write on.
        have: Revision,
        /// The revision currently persisted.
        actual: Revision,
    },

    /// A phase work function returned an error.
    #[error("phase {phase} failed: {cause}")]
    PhaseFailed {
        /// Path of the failed phase.
        phase: String,
        /// Reason for the failure.
        cause: String,
    },

    /// The operation was cancelled by the client or a signal.
    #[error("operation aborted")]
    Aborted,

    /// An RPC call to a peer agent failed.
    #[error("transport failure: {cause}")]
    Transport {
        /// Reason for the transport failure.
        cause: String,
    },

    /// A referenced entity does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// An entity the caller tried to create already exists.
    #[error("{what} already exists")]
    AlreadyExists {
        /// Description of the conflicting entity.
        what: String,
    },

    /// The plan-store backend is temporarily unreachable.
    #[error("backend unavailable: {cause}")]
    BackendUnavailable {
        /// Reason the backend is unavailable.
        cause: String,
    },

    /// An internal invariant was violated. Halts immediately.
    #[error("internal invariant violated: {cause}")]
    Fatal {
        /// Description of the violated invariant.
        cause: String,
    },
}

/// Result type for capstan operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Shorthand for a [`CoreError::Fatal`].
    pub fn fatal(cause: impl Into<String>) -> Self {
        CoreError::Fatal { cause: cause.into() }
    }

    /// Shorthand for a [`CoreError::Transport`].
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        CoreError::Transport {
            cause: cause.to_string(),
        }
    }

    /// Wrap a phase failure with its phase-id context.
    pub fn phase_failed(phase: impl std::fmt::Display, cause: impl std::fmt::Display) -> Self {
        CoreError::PhaseFailed {
            phase: phase.to_string(),
            cause: cause.to_string(),
        }
    }

    /// True for [`CoreError::Aborted`] and any phase failure whose cause
    /// wraps one.
    pub fn is_aborted(&self) -> bool {
        match self {
            CoreError::Aborted => true,
            CoreError::PhaseFailed { cause, .. } => cause.contains("operation aborted"),
            _ => false,
        }
    }

    /// True when the caller raced another creator and can treat the outcome
    /// as success.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, CoreError::AlreadyExists { .. })
    }

    /// True when the referenced entity is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }

    /// True for failures the engine retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transport { .. } | CoreError::BackendUnavailable { .. }
        )
    }

    /// Stable kind tag used on the event wire.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::PreconditionFailed { .. } => "precondition-failed",
            CoreError::NotImplemented { .. } => "not-implemented",
            CoreError::StaleRevision { .. } => "stale-revision",
            CoreError::PhaseFailed { .. } => "phase-failed",
            CoreError::Aborted => "aborted",
            CoreError::Transport { .. } => "transport",
            CoreError::NotFound { .. } => "not-found",
            CoreError::AlreadyExists { .. } => "already-exists",
            CoreError::BackendUnavailable { .. } => "backend-unavailable",
            CoreError::Fatal { .. } => "fatal",
        }
    }
}

/// Collect teardown errors without shadowing any of them.
///
/// Returns `Ok(())` for an empty input, the sole error for a singleton, and
/// a [`CoreError::Fatal`] joining all messages otherwise.
pub fn aggregate(errors: Vec<CoreError>) -> Result<()> {
    let mut errors = errors;
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            Err(CoreError::Fatal { cause: joined })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_classification_survives_phase_wrapping() {
        let err = CoreError::phase_failed("update-config/apply/node-1", CoreError::Aborted);
        assert!(err.is_aborted());
        assert_eq!(err.kind(), "phase-failed");
    }

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::transport("connection refused").is_retryable());
        assert!(CoreError::BackendUnavailable {
            cause: "etcd down".into()
        }
        .is_retryable());
        assert!(!CoreError::Aborted.is_retryable());
    }

    #[test]
    fn aggregate_preserves_single_error() {
        let err = aggregate(vec![CoreError::Aborted]).unwrap_err();
        assert!(err.is_aborted());

        let err = aggregate(vec![
            CoreError::transport("dial tcp"),
            CoreError::fatal("boom"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("dial tcp"));
        assert!(err.to_string().contains("boom"));
    }
}
