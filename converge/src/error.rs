//! Error types for planning and converging Hyper-V resources.
//!
//! Errors fall in two groups:
//! - pre-execution errors ([`ValidationError`], [`CycleError`]) abort a run
//!   before anything touches the hypervisor;
//! - execution errors ([`HypervisorError`], [`ResourceError`]) are scoped to a
//!   single resource and its dependents.

use core::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::client::Operation;
use crate::model::{OutputRef, ResourceKind};

/// Classification of failure types for retry logic and error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Transient failure - operation may succeed if retried.
    Transient,
    /// Permanent failure - retrying will not help.
    Permanent,
    /// Resource busy - retry after delay.
    ResourceBusy,
    /// Configuration error - fix configuration and retry.
    Configuration,
    /// Network-related failure.
    Network,
    /// Unknown failure type.
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Transient => write!(f, "Transient"),
            FailureType::Permanent => write!(f, "Permanent"),
            FailureType::ResourceBusy => write!(f, "ResourceBusy"),
            FailureType::Configuration => write!(f, "Configuration"),
            FailureType::Network => write!(f, "Network"),
            FailureType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Input that fails shape or domain checks. Fatal, raised before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} resource has an empty logical name")]
    EmptyName { kind: ResourceKind },

    #[error("duplicate logical name '{0}'")]
    DuplicateName(String),

    #[error("{resource}: required field '{field}' is missing")]
    MissingRequired { resource: String, field: String },

    #[error("{resource}: unknown field '{field}' for kind {kind}")]
    UnknownField {
        resource: String,
        kind: ResourceKind,
        field: String,
    },

    #[error("{resource}: field '{field}' expects {expected}")]
    TypeMismatch {
        resource: String,
        field: String,
        expected: &'static str,
    },

    #[error("{resource}: field '{field}' must be positive, got {value}")]
    NonPositive {
        resource: String,
        field: String,
        value: i64,
    },

    #[error("{resource}: invalid value for '{field}': {message}")]
    InvalidValue {
        resource: String,
        field: String,
        message: String,
    },

    #[error("{resource}: reference to unknown resource '{target}'")]
    UnknownReference { resource: String, target: String },
}

impl ValidationError {
    pub(crate) fn invalid(
        resource: &str,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ValidationError::InvalidValue {
            resource: resource.to_string(),
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn missing(resource: &str, field: impl Into<String>) -> Self {
        ValidationError::MissingRequired {
            resource: resource.to_string(),
            field: field.into(),
        }
    }
}

/// Dependency cycle. `path` starts and ends with the same logical name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle: {}", .path.join(" -> "))]
pub struct CycleError {
    pub path: Vec<String>,
}

/// Failure to build a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("duplicate logical name '{0}'")]
    DuplicateName(String),
}

/// Pre-execution failure. No hypervisor call has been made when this is returned.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("failed to load persisted state: {0}")]
    State(#[from] StateError),
}

impl From<GraphError> for PlanError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::Cycle(c) => PlanError::Cycle(c),
            GraphError::DuplicateName(name) => {
                PlanError::Validation(ValidationError::DuplicateName(name))
            }
        }
    }
}

/// Failure reported by a [`HypervisorClient`](crate::client::HypervisorClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HypervisorError {
    /// Connection to the management service failed or dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not complete in time.
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The addressed object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// An object with the same identity already exists.
    #[error("{kind} '{identity}' already exists")]
    Conflict {
        kind: ResourceKind,
        identity: String,
    },

    /// The hypervisor rejected a property value.
    #[error("invalid property '{property}': {message}")]
    InvalidProperty { property: String, message: String },

    /// Management method returned a failure code.
    #[error("operation '{operation}' failed with code {return_value}: {message}")]
    OperationFailed {
        operation: String,
        return_value: u32,
        message: String,
    },
}

impl HypervisorError {
    /// Build an [`HypervisorError::OperationFailed`] from a management-service return code.
    pub fn from_return_code(operation: impl Into<String>, return_value: u32) -> Self {
        HypervisorError::OperationFailed {
            operation: operation.into(),
            return_value,
            message: return_code_meaning(return_value).to_string(),
        }
    }

    /// Get the failure type classification for this error.
    pub fn failure_type(&self) -> FailureType {
        match self {
            HypervisorError::Transport(_) => FailureType::Network,
            HypervisorError::Timeout { .. } => FailureType::Transient,
            HypervisorError::NotFound(_) => FailureType::Permanent,
            HypervisorError::Conflict { .. } => FailureType::Permanent,
            HypervisorError::InvalidProperty { .. } => FailureType::Configuration,
            HypervisorError::OperationFailed { return_value, .. } => {
                return_code_failure_type(*return_value)
            }
        }
    }

    /// Check if the error is transient and the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.failure_type(),
            FailureType::Transient | FailureType::ResourceBusy | FailureType::Network
        )
    }

    /// Check if the error means the addressed object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound(_))
    }
}

/// Human-readable meaning of a Hyper-V management-service return code.
pub fn return_code_meaning(return_value: u32) -> &'static str {
    match return_value {
        0 => "Completed with No Error.",
        1 => "Not Supported.",
        2 => "Failed.",
        3 => "Timeout.",
        4 => "Invalid Parameter.",
        5 => "Invalid State.",
        6 => "Invalid Type.",
        4096 => "Method Parameters Checked - Job Started.",
        32768 => "Failed.",
        32769 => "Access Denied.",
        32770 => "Not Supported.",
        32771 => "Status is Unknown.",
        32772 => "Timeout.",
        32773 => "Invalid Parameter.",
        32774 => "System is In Use.",
        32775 => "Invalid State for this Operation.",
        32776 => "Incorrect Data Type.",
        32777 => "System is Not Available.",
        32778 => "Out of Memory.",
        _ => "The Method Failed. The Reason is Unknown.",
    }
}

fn return_code_failure_type(return_value: u32) -> FailureType {
    match return_value {
        3 | 32772 | 32777 => FailureType::Transient,
        5 | 32774 | 32775 => FailureType::ResourceBusy,
        4 | 6 | 32773 | 32776 => FailureType::Configuration,
        1 | 32769 | 32770 => FailureType::Permanent,
        _ => FailureType::Unknown,
    }
}

/// State store failures.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O failed for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("state for '{name}' is not valid JSON: {source}")]
    Serialization {
        name: String,
        source: serde_json::Error,
    },

    #[error("state backend error: {0}")]
    Backend(String),
}

/// Why a single resource ended up `Failed`.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// A transient failure persisted through every allowed attempt.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: Operation,
        attempts: u32,
        source: HypervisorError,
    },

    /// A non-transient failure; not retried.
    #[error("{operation} failed: {source}")]
    Permanent {
        operation: Operation,
        source: HypervisorError,
    },

    /// A referenced output was not available after its producer converged.
    #[error("unresolved output reference {reference}")]
    Unresolved { reference: OutputRef },

    #[error(transparent)]
    State(#[from] StateError),

    /// Cancellation was observed before `operation` could be issued.
    #[error("run cancelled before {operation}")]
    Cancelled { operation: Operation },

    /// The worker task panicked or was aborted.
    #[error("worker terminated abnormally: {0}")]
    Aborted(String),
}

impl ResourceError {
    /// The hypervisor error behind this failure, if any.
    pub fn hypervisor_error(&self) -> Option<&HypervisorError> {
        match self {
            ResourceError::RetriesExhausted { source, .. }
            | ResourceError::Permanent { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for hypervisor client calls.
pub type Result<T> = core::result::Result<T, HypervisorError>;
