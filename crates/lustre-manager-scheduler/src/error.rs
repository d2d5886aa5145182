//! Error types for the scheduler crate.
//!
//! Three layers fail independently: the planner ([`SchedulerError`]), the
//! agent messenger ([`AgentError`]) and step bodies ([`StepError`]). Planner
//! errors reject a request before any job exists; agent and step errors fail
//! a single step and, through it, its job.

use lustre_manager_core::{CommandId, EntityRef, JobId};
use thiserror::Error;

/// Errors raised while planning or serving scheduler requests.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The requested state is not reachable from the entity's current state.
    #[error("invalid transition for {entity}: {message}")]
    InvalidTransition {
        /// Entity the transition was requested on.
        entity: EntityRef,
        /// Why the transition is invalid.
        message: String,
    },

    /// Planning produced a dependency cycle.
    #[error("circular dependency: {0}")]
    CircularDependency(String),

    /// The planned write locks do not form a valid state chain.
    #[error("lock conflict on {item}: {message}")]
    LockConflict {
        /// Contended entity.
        item: EntityRef,
        /// Description of the broken chain.
        message: String,
    },

    /// An entity disappeared while being planned or run.
    #[error("entity vanished: {0}")]
    EntityVanished(EntityRef),

    /// A job class name is not known.
    #[error("unknown job class: {0}")]
    UnknownJobClass(String),

    /// Job arguments did not match the class's schema.
    #[error("invalid arguments for {class_name}: {message}")]
    InvalidJobArgs {
        /// Job class.
        class_name: String,
        /// Decoding error.
        message: String,
    },

    /// A request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No job with this id exists.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// No command with this id exists.
    #[error("command not found: {0}")]
    CommandNotFound(CommandId),

    /// A request id was reused with a different payload.
    #[error("request id {0} was already used for a different request")]
    DuplicateRequest(String),

    /// The facade does not expose this method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The scheduler loop has stopped.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] lustre_manager_store::StoreError),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Check if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Store(_))
    }

    /// Whether this is a planning failure that rejects a command.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::CircularDependency(_)
                | Self::LockConflict { .. }
                | Self::EntityVanished(_)
        )
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::JobNotFound(_) | Self::CommandNotFound(_) | Self::UnknownMethod(_) => 404,
            Self::InvalidTransition { .. }
            | Self::UnknownJobClass(_)
            | Self::InvalidJobArgs { .. }
            | Self::InvalidRequest(_)
            | Self::Serialization(_) => 400,
            Self::CircularDependency(_)
            | Self::LockConflict { .. }
            | Self::EntityVanished(_)
            | Self::DuplicateRequest(_) => 409,
            Self::ShuttingDown | Self::Store(_) => 503,
            Self::Internal(_) => 500,
        }
    }
}

/// A specialized Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failures of a single agent RPC.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// No session appeared within the session wait timeout.
    #[error("no session for {fqdn} within the session wait timeout")]
    NoSession {
        /// Target host.
        fqdn: String,
    },

    /// The session carrying the RPC was terminated.
    #[error("communications error with {fqdn} because {reason}")]
    SessionTerminated {
        /// Target host.
        fqdn: String,
        /// Why the session ended.
        reason: String,
    },

    /// The agent was silent for longer than the contact timeout.
    #[error("timed out waiting for {fqdn}: no contact for {seconds}s")]
    Timeout {
        /// Target host.
        fqdn: String,
        /// Contact timeout that elapsed.
        seconds: u64,
    },

    /// The RPC was cancelled locally.
    #[error("cancelled")]
    Cancelled,

    /// The remote action raised.
    #[error("{action} failed on {fqdn}")]
    AgentException {
        /// Host the action ran on.
        fqdn: String,
        /// Action name.
        action: String,
        /// Agent-provided backtrace.
        backtrace: String,
        /// Rendered subprocess output.
        subprocesses: String,
    },

    /// The transport service could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// An agent message broke the session protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The messenger is shutting down.
    #[error("cancelled due to service shutdown")]
    Shutdown,
}

/// Failures of a step body.
#[derive(Error, Debug)]
pub enum StepError {
    /// An agent RPC failed.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// The system is not in a state where the step can proceed.
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    /// An entity the step needed has disappeared.
    #[error("entity vanished: {0}")]
    EntityVanished(EntityRef),

    /// A manager-side helper failed.
    #[error("local action {action} failed: {message}")]
    Local {
        /// Helper name.
        action: String,
        /// Failure description.
        message: String,
    },

    /// A wait exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Store error during a database step.
    #[error("store error: {0}")]
    Store(#[from] lustre_manager_store::StoreError),

    /// A result could not be decoded.
    #[error("unexpected result: {0}")]
    BadResult(String),
}

impl StepError {
    /// Whether this failure is a cancellation rather than an error.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Agent(AgentError::Cancelled))
    }

    /// Backtrace text recorded on the failed step result.
    #[must_use]
    pub fn backtrace(&self) -> String {
        match self {
            Self::Agent(AgentError::AgentException {
                backtrace,
                subprocesses,
                ..
            }) => {
                if subprocesses.is_empty() {
                    backtrace.clone()
                } else {
                    format!("{backtrace}\n{subprocesses}")
                }
            }
            other => other.to_string(),
        }
    }
}

impl From<SchedulerError> for StepError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::EntityVanished(item) => Self::EntityVanished(item),
            SchedulerError::Store(e) => Self::Store(e),
            other => Self::PreconditionFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lustre_manager_core::{ClassTag, EntityId};

    #[test]
    fn planner_errors_are_validation_failures() {
        let item = EntityRef::new(ClassTag::Host, EntityId::new(1));
        assert!(SchedulerError::CircularDependency("a -> b -> a".into()).is_validation());
        assert!(SchedulerError::LockConflict {
            item,
            message: String::new()
        }
        .is_validation());
        assert!(!SchedulerError::JobNotFound(JobId::new(1)).is_validation());
    }

    #[test]
    fn http_status_codes() {
        assert_eq!(SchedulerError::JobNotFound(JobId::new(1)).http_status_code(), 404);
        assert_eq!(SchedulerError::UnknownJobClass("X".into()).http_status_code(), 400);
        assert_eq!(SchedulerError::DuplicateRequest("r".into()).http_status_code(), 409);
        assert_eq!(SchedulerError::ShuttingDown.http_status_code(), 503);
        assert!(SchedulerError::ShuttingDown.is_retriable());
    }

    #[test]
    fn agent_exception_backtrace_includes_subprocesses() {
        let err = StepError::Agent(AgentError::AgentException {
            fqdn: "h1".into(),
            action: "format_target".into(),
            backtrace: "Traceback".into(),
            subprocesses: "mkfs.lustre: exit 1".into(),
        });
        assert_eq!(err.backtrace(), "Traceback\nmkfs.lustre: exit 1");
        assert!(!err.is_cancellation());
        assert!(StepError::Agent(AgentError::Cancelled).is_cancellation());
    }

    #[test]
    fn session_terminated_message() {
        let err = AgentError::SessionTerminated {
            fqdn: "h1".into(),
            reason: "session terminated".into(),
        };
        assert_eq!(
            err.to_string(),
            "communications error with h1 because session terminated"
        );
    }
}
