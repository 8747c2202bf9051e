//! # hyperv-converge
//!
//! Dependency-ordered convergence of Hyper-V resources.
//!
//! Given declarative specifications of virtual switches, virtual disks,
//! virtual machines and VM network adapters, this crate validates them,
//! orders them by their cross-resource references, decides per resource
//! whether it must be created, updated in place, replaced or left alone, and
//! drives a [`HypervisorClient`] until the host matches.
//!
//! ## Features
//!
//! - **Typed resource model**: per-kind field tables, defaults and domains
//! - **Deferred outputs**: `{"ref": "disk", "output": "path"}` inputs are
//!   resolved only once the producer has converged
//! - **Replace vs update**: per-field policies, grow-only sizes and triggers
//! - **Bounded parallelism**: independent branches converge concurrently;
//!   failures block only their dependents
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hyperv_converge::{Converger, InMemoryHypervisor, MemoryStateStore, RawSpec, ResourceKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hyperv_converge::PlanError> {
//!     let converger = Converger::new(
//!         Arc::new(InMemoryHypervisor::new()),
//!         Arc::new(MemoryStateStore::new()),
//!     );
//!
//!     let specs = vec![
//!         RawSpec::new(ResourceKind::Switch, "lan")
//!             .with("name", "lan")
//!             .with("switchType", "Internal"),
//!         RawSpec::new(ResourceKind::Machine, "web")
//!             .with("machineName", "web01")
//!             .with("processorCount", 2i64)
//!             .depends_on("lan"),
//!     ];
//!
//!     let report = converger.converge(specs).await?;
//!     print!("{report}");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod model;
pub mod plan;
pub mod policy;
pub mod state;

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use client::{HypervisorClient, InMemoryHypervisor, Operation, RemoteObject};
pub use config::{ConfigError, ConvergeConfig, ExistingResourcePolicy};
pub use diff::{diff, Change, DiffOutcome, DiffResult, ReplaceReason};
pub use error::{
    CycleError, FailureType, GraphError, HypervisorError, PlanError, ResourceError, Result,
    StateError, ValidationError,
};
pub use executor::{
    Action, Executor, ExecutorOptions, Phase, ResourceResult, ResourceStatus, RetryPolicy,
    RunReport,
};
pub use graph::{DependencyGraph, Edge, EdgeCause};
pub use model::{normalize, Input, OutputRef, Properties, RawSpec, ResourceKind, ResourceSpec, Value};
pub use plan::{ExecutionPlan, PlanStep, Planner};
pub use policy::{FieldPolicy, ReplacementPolicy};
pub use state::{JsonFileStateStore, MemoryStateStore, ObservedState, Outputs, StateStore};

/// Initialize tracing/logging with the given filter level
///
/// `RUST_LOG` takes precedence over `filter`. Does nothing if a global
/// subscriber is already installed.
pub fn init_tracing(filter: &str) {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

/// Plans and applies resource specifications against one host.
pub struct Converger {
    client: Arc<dyn HypervisorClient>,
    store: Arc<dyn StateStore>,
    policy: ReplacementPolicy,
    options: ExecutorOptions,
}

impl Converger {
    pub fn new(client: Arc<dyn HypervisorClient>, store: Arc<dyn StateStore>) -> Self {
        Self {
            client,
            store,
            policy: ReplacementPolicy::default(),
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_config(mut self, config: &ConvergeConfig) -> Self {
        self.options = ExecutorOptions::from(config);
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_policy(mut self, policy: ReplacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate and order `specs` without touching the host.
    pub async fn plan(&self, specs: Vec<RawSpec>) -> std::result::Result<ExecutionPlan, PlanError> {
        Planner::new(self.store.as_ref(), &self.policy).plan(specs).await
    }

    pub async fn apply(&self, plan: ExecutionPlan) -> RunReport {
        self.executor().apply(plan).await
    }

    /// Plan and apply in one step. Planning errors abort before any call.
    pub async fn converge(&self, specs: Vec<RawSpec>) -> std::result::Result<RunReport, PlanError> {
        let plan = self.plan(specs).await?;
        Ok(self.apply(plan).await)
    }

    pub async fn converge_with_cancel(
        &self,
        specs: Vec<RawSpec>,
        cancel: watch::Receiver<bool>,
    ) -> std::result::Result<RunReport, PlanError> {
        let plan = self.plan(specs).await?;
        Ok(self.executor().apply_with_cancel(plan, cancel).await)
    }

    fn executor(&self) -> Executor {
        Executor::new(Arc::clone(&self.client), Arc::clone(&self.store))
            .with_policy(self.policy.clone())
            .with_options(self.options.clone())
    }
}
