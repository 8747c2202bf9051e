//! Per-resource results of a convergence run.

use core::fmt;

use serde::Serialize;

use crate::client::Operation;
use crate::diff::ReplaceReason;
use crate::error::ResourceError;
use crate::model::ResourceKind;
use crate::state::ObservedState;

/// Lifecycle phases a resource passes through during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Pending,
    Diffing,
    Creating,
    Updating,
    Deleting,
    Skipped,
    Converged,
    Failed,
    Blocked,
    Cancelled,
}

/// Terminal status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceStatus {
    Converged,
    /// Failed itself; the first error is recorded.
    Failed,
    /// Not attempted because a dependency failed.
    Blocked,
    /// Not started before the run was cancelled.
    Cancelled,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Converged => write!(f, "Converged"),
            ResourceStatus::Failed => write!(f, "Failed"),
            ResourceStatus::Blocked => write!(f, "Blocked"),
            ResourceStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// What the executor did to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    None,
    Created,
    /// An existing unmanaged object was taken over.
    Adopted,
    Updated { changed_fields: Vec<String> },
    Replaced { reason: ReplaceReason },
}

#[derive(Debug)]
pub struct ResourceResult {
    pub name: String,
    pub kind: ResourceKind,
    pub status: ResourceStatus,
    pub action: Action,
    /// State after the run: new state when converged, last-known otherwise.
    pub observed: Option<ObservedState>,
    pub error: Option<ResourceError>,
    pub last_operation: Option<Operation>,
    /// Hypervisor calls issued for this resource, retries included.
    pub attempts: u32,
    /// Root failed resource, for `Blocked` results.
    pub blocked_by: Option<String>,
    pub history: Vec<Phase>,
}

impl ResourceResult {
    pub(crate) fn blocked(
        name: impl Into<String>,
        kind: ResourceKind,
        observed: Option<ObservedState>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            status: ResourceStatus::Blocked,
            action: Action::None,
            observed,
            error: None,
            last_operation: None,
            attempts: 0,
            blocked_by: Some(root.into()),
            history: vec![Phase::Pending, Phase::Blocked],
        }
    }

    pub(crate) fn cancelled(
        name: impl Into<String>,
        kind: ResourceKind,
        observed: Option<ObservedState>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            status: ResourceStatus::Cancelled,
            action: Action::None,
            observed,
            error: None,
            last_operation: None,
            attempts: 0,
            blocked_by: None,
            history: vec![Phase::Pending, Phase::Cancelled],
        }
    }

    /// Result for a worker that panicked or was aborted.
    pub(crate) fn aborted(
        name: impl Into<String>,
        kind: ResourceKind,
        observed: Option<ObservedState>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            status: ResourceStatus::Failed,
            action: Action::None,
            observed,
            error: Some(ResourceError::Aborted(message.into())),
            last_operation: None,
            attempts: 0,
            blocked_by: None,
            history: vec![Phase::Pending, Phase::Failed],
        }
    }

    pub fn is_converged(&self) -> bool {
        self.status == ResourceStatus::Converged
    }
}

/// Outcome of one run, in declaration order.
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<ResourceResult>,
    /// Whether cancellation was observed during the run.
    pub cancelled: bool,
}

impl RunReport {
    /// True only if every resource converged.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(ResourceResult::is_converged)
    }

    pub fn get(&self, name: &str) -> Option<&ResourceResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn status(&self, name: &str) -> Option<ResourceStatus> {
        self.get(name).map(|r| r.status)
    }

    pub fn count(&self, status: ResourceStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// First error of every failed resource.
    pub fn errors(&self) -> impl Iterator<Item = (&str, &ResourceError)> {
        self.results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| (r.name.as_str(), e)))
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            write!(f, "{:<24} {:<8} {}", result.name, result.kind, result.status)?;
            if let Some(root) = &result.blocked_by {
                write!(f, " (blocked by {root})")?;
            }
            if let Some(error) = &result.error {
                write!(f, ": {error}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
