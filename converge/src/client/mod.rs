//! Hypervisor capability consumed by the executor.
//!
//! The management transport (WMI or an equivalent RPC to the host) sits
//! behind [`HypervisorClient`]. [`InMemoryHypervisor`] implements it in
//! process for tests and dry runs.

mod memory;

use core::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::model::{Properties, ResourceKind};

pub use memory::{Call, Fault, InMemoryHypervisor};

/// Hypervisor operation, as recorded in results and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Read,
    Lookup,
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Whether the operation changes the host.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Delete
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Lookup => write!(f, "lookup"),
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Object as returned by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub properties: Properties,
}

/// Imperative hypervisor management surface.
///
/// Any call may block. Calls are never aborted once issued.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Create an object and return its identifier and observed properties.
    async fn create(&self, kind: ResourceKind, properties: &Properties) -> Result<RemoteObject>;

    /// Apply `changed` to an existing object and return its observed properties.
    async fn update(&self, kind: ResourceKind, id: &str, changed: &Properties)
        -> Result<Properties>;

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()>;

    /// Observed properties, or `None` if the object no longer exists.
    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Option<Properties>>;

    /// Find an existing object by host identity (see
    /// [`Schema::identity`](crate::model::Schema::identity)).
    async fn lookup(&self, kind: ResourceKind, identity: &str) -> Result<Option<RemoteObject>>;
}
