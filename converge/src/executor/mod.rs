//! Convergence executor.
//!
//! A coordinator owns the plan and dispatches resources to a bounded pool of
//! workers as soon as every dependency has converged. Workers diff against
//! the outputs known at dispatch time, issue hypervisor calls with retry,
//! and persist the resulting state.
//!
//! Mutations are serialized per host object on the lock key of the resolved
//! properties, which also covers targets named through references to
//! resources outside the run.
//!
//! Cancellation is cooperative: once observed, no new resource is dispatched
//! and no new call is issued, but calls already in flight complete.

mod report;
mod retry;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::{HypervisorClient, Operation};
use crate::config::{ConvergeConfig, ExistingResourcePolicy};
use crate::diff::{diff, diff_resolved, Change, DiffOutcome, ReplaceReason};
use crate::error::{self, HypervisorError, ResourceError};
use crate::graph::DependencyGraph;
use crate::model::{OutputRef, Resolved, ResourceSpec};
use crate::plan::{ExecutionPlan, PlanStep};
use crate::policy::ReplacementPolicy;
use crate::state::{ObservedState, Outputs, StateStore};

pub use report::{Action, Phase, ResourceResult, ResourceStatus, RunReport};
pub use retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};

/// Per-run executor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorOptions {
    /// Upper bound on resources materializing at once.
    pub max_concurrency: usize,
    /// Re-read persisted objects from the host before diffing.
    pub refresh: bool,
    pub existing_resources: ExistingResourcePolicy,
    pub retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            refresh: false,
            existing_resources: ExistingResourcePolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&ConvergeConfig> for ExecutorOptions {
    fn from(config: &ConvergeConfig) -> Self {
        Self {
            max_concurrency: config.executor.max_concurrency,
            refresh: config.executor.refresh,
            existing_resources: config.executor.existing_resources,
            retry: config.retry_policy(),
        }
    }
}

pub struct Executor {
    client: Arc<dyn HypervisorClient>,
    store: Arc<dyn StateStore>,
    policy: ReplacementPolicy,
    options: ExecutorOptions,
}

/// Shared context of one run.
struct Context {
    client: Arc<dyn HypervisorClient>,
    store: Arc<dyn StateStore>,
    policy: ReplacementPolicy,
    options: ExecutorOptions,
    targets: TargetLocks,
}

/// One async mutex per host object lock key.
#[derive(Default)]
struct TargetLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TargetLocks {
    /// Hold every key in `keys`. Keys are taken in sorted order, so two
    /// workers never wait on each other.
    async fn acquire(&self, keys: BTreeSet<String>) -> Vec<OwnedMutexGuard<()>> {
        let mutexes: Vec<_> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            keys.into_iter()
                .map(|key| Arc::clone(locks.entry(key).or_default()))
                .collect()
        };
        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        guards
    }
}

impl Executor {
    pub fn new(client: Arc<dyn HypervisorClient>, store: Arc<dyn StateStore>) -> Self {
        Self {
            client,
            store,
            policy: ReplacementPolicy::default(),
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_policy(mut self, policy: ReplacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Converge every resource of `plan`.
    pub async fn apply(&self, plan: ExecutionPlan) -> RunReport {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.apply_with_cancel(plan, cancel_rx).await
    }

    /// Converge `plan`, stopping dispatch once `cancel` turns true.
    pub async fn apply_with_cancel(
        &self,
        plan: ExecutionPlan,
        mut cancel: watch::Receiver<bool>,
    ) -> RunReport {
        let ctx = Arc::new(Context {
            client: Arc::clone(&self.client),
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
            options: self.options.clone(),
            targets: TargetLocks::default(),
        });
        let (steps, graph, mut outputs) = plan.into_parts();
        let count = steps.len();
        let limit = self.options.max_concurrency.max(1);

        let mut position = vec![0; count];
        for (pos, &idx) in graph.topological_order().iter().enumerate() {
            position[idx] = pos;
        }
        let mut remaining: Vec<usize> = (0..count).map(|i| graph.dependencies(i).len()).collect();
        let mut ready: BTreeSet<(usize, usize)> = (0..count)
            .filter(|&i| remaining[i] == 0)
            .map(|i| (position[i], i))
            .collect();
        let mut results: Vec<Option<ResourceResult>> = (0..count).map(|_| None).collect();
        let mut dispatched = vec![false; count];

        let mut running = JoinSet::new();
        let mut cancelled = *cancel.borrow();
        let mut cancel_closed = false;

        info!(resources = count, max_concurrency = limit, "convergence started");
        loop {
            while !cancelled && running.len() < limit {
                let Some((_, idx)) = ready.pop_first() else {
                    break;
                };
                let worker = Worker {
                    ctx: Arc::clone(&ctx),
                    cancel: cancel.clone(),
                };
                let work = worker.converge(steps[idx].clone(), outputs.clone());
                dispatched[idx] = true;
                // The inner task turns a worker panic into a JoinError.
                running.spawn(async move { (idx, tokio::spawn(work).await) });
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = running.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    let (idx, outcome) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            // Settled as aborted once the loop ends.
                            error!(error = %e, "worker supervisor terminated");
                            continue;
                        }
                    };
                    let step = &steps[idx];
                    let result = outcome.unwrap_or_else(|e| {
                        error!(resource = step.spec.name(), error = %e, "worker panicked");
                        ResourceResult::aborted(
                            step.spec.name(),
                            step.spec.kind(),
                            step.observed.clone(),
                            e.to_string(),
                        )
                    });

                    match result.status {
                        ResourceStatus::Converged => {
                            if let Some(state) = &result.observed {
                                outputs.insert(step.spec.name(), state.clone());
                            }
                            for &dependent in graph.dependents(idx) {
                                remaining[dependent] -= 1;
                                if remaining[dependent] == 0 && results[dependent].is_none() {
                                    ready.insert((position[dependent], dependent));
                                }
                            }
                        }
                        ResourceStatus::Failed => {
                            for dependent in graph.transitive_dependents(idx) {
                                if results[dependent].is_none() {
                                    let blocked = &steps[dependent];
                                    warn!(
                                        resource = blocked.spec.name(),
                                        blocked_by = step.spec.name(),
                                        "dependency failed, resource blocked"
                                    );
                                    results[dependent] = Some(ResourceResult::blocked(
                                        blocked.spec.name(),
                                        blocked.spec.kind(),
                                        blocked.observed.clone(),
                                        step.spec.name(),
                                    ));
                                }
                            }
                        }
                        ResourceStatus::Blocked | ResourceStatus::Cancelled => {}
                    }
                    results[idx] = Some(result);
                }
                changed = cancel.changed(), if !cancelled && !cancel_closed => {
                    match changed {
                        Ok(()) => {
                            if *cancel.borrow() {
                                warn!(in_flight = running.len(), "cancellation observed, dispatch stopped");
                                cancelled = true;
                            }
                        }
                        Err(_) => cancel_closed = true,
                    }
                }
            }
        }

        let cancelled = cancelled || *cancel.borrow();
        let results = settle(&steps, &graph, results, &dispatched);

        let report = RunReport { results, cancelled };
        info!(
            converged = report.count(ResourceStatus::Converged),
            failed = report.count(ResourceStatus::Failed),
            blocked = report.count(ResourceStatus::Blocked),
            cancelled = report.count(ResourceStatus::Cancelled),
            "convergence finished"
        );
        report
    }
}

/// Fill in resources left without a result. A dispatched resource lost its
/// worker and is aborted, blocking its dependents; anything else was never
/// started and is cancelled.
fn settle(
    steps: &[PlanStep],
    graph: &DependencyGraph,
    mut results: Vec<Option<ResourceResult>>,
    dispatched: &[bool],
) -> Vec<ResourceResult> {
    for idx in 0..steps.len() {
        if results[idx].is_some() || !dispatched[idx] {
            continue;
        }
        let step = &steps[idx];
        error!(resource = step.spec.name(), "worker ended without a result");
        results[idx] = Some(ResourceResult::aborted(
            step.spec.name(),
            step.spec.kind(),
            step.observed.clone(),
            "worker ended without a result",
        ));
        for dependent in graph.transitive_dependents(idx) {
            if results[dependent].is_none() && !dispatched[dependent] {
                let blocked = &steps[dependent];
                results[dependent] = Some(ResourceResult::blocked(
                    blocked.spec.name(),
                    blocked.spec.kind(),
                    blocked.observed.clone(),
                    step.spec.name(),
                ));
            }
        }
    }

    results
        .into_iter()
        .zip(steps)
        .map(|(result, step)| {
            result.unwrap_or_else(|| {
                ResourceResult::cancelled(step.spec.name(), step.spec.kind(), step.observed.clone())
            })
        })
        .collect()
}

struct Worker {
    ctx: Arc<Context>,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    async fn converge(self, step: PlanStep, outputs: Outputs) -> ResourceResult {
        let span = info_span!("converge", resource = step.spec.name(), kind = %step.spec.kind());
        self.run(step, outputs).instrument(span).await
    }

    async fn run(self, step: PlanStep, outputs: Outputs) -> ResourceResult {
        let PlanStep { spec, observed, .. } = step;
        let mut task = Task {
            ctx: &self.ctx,
            cancel: &self.cancel,
            attempts: 0,
            last_operation: None,
            history: vec![Phase::Pending],
            last_known: observed,
        };
        let outcome = task.reconcile(&spec, &outputs).await;
        let Task {
            attempts,
            last_operation,
            mut history,
            last_known,
            ..
        } = task;

        let (status, action, error) = match outcome {
            Ok(action) => {
                info!(attempts, "converged");
                (ResourceStatus::Converged, action, None)
            }
            Err(e @ ResourceError::Cancelled { .. }) if attempts == 0 => {
                info!("cancelled before any call");
                (ResourceStatus::Cancelled, Action::None, Some(e))
            }
            Err(e) => {
                error!(attempts, error = %e, "resource failed");
                (ResourceStatus::Failed, Action::None, Some(e))
            }
        };
        history.push(match status {
            ResourceStatus::Converged => Phase::Converged,
            ResourceStatus::Failed => Phase::Failed,
            ResourceStatus::Blocked => Phase::Blocked,
            ResourceStatus::Cancelled => Phase::Cancelled,
        });

        ResourceResult {
            name: spec.name().to_string(),
            kind: spec.kind(),
            status,
            action,
            observed: last_known,
            error,
            last_operation,
            attempts,
            blocked_by: None,
            history,
        }
    }
}

/// Mutable bookkeeping of one resource's materialization.
struct Task<'a> {
    ctx: &'a Context,
    cancel: &'a watch::Receiver<bool>,
    attempts: u32,
    last_operation: Option<Operation>,
    history: Vec<Phase>,
    /// Persisted state; `None` once the recorded object is deleted.
    last_known: Option<ObservedState>,
}

impl<'a> Task<'a> {
    fn enter(&mut self, phase: Phase) {
        debug!(?phase, "phase");
        self.history.push(phase);
    }

    async fn call<T, F, Fut>(&mut self, operation: Operation, call: F) -> Result<T, ResourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = error::Result<T>>,
    {
        self.last_operation = Some(operation);
        debug!(%operation, "hypervisor call");
        retry::with_retry(
            &self.ctx.options.retry,
            operation,
            self.cancel,
            &mut self.attempts,
            call,
        )
        .await
    }

    async fn save(&mut self, name: &str, state: ObservedState) -> Result<(), ResourceError> {
        self.ctx.store.save(name, &state).await?;
        self.last_known = Some(state);
        Ok(())
    }

    async fn reconcile(
        &mut self,
        spec: &ResourceSpec,
        outputs: &Outputs,
    ) -> Result<Action, ResourceError> {
        let ctx = self.ctx;
        let client: &dyn HypervisorClient = ctx.client.as_ref();
        let kind = spec.kind();
        let name = spec.name();
        self.enter(Phase::Diffing);

        let mut observed = self.last_known.clone();
        let mut refreshed = false;
        if ctx.options.refresh {
            if let Some(state) = observed.take() {
                let id = state.id.as_str();
                let current = self
                    .call(Operation::Read, move || client.read(kind, id))
                    .await?;
                refreshed = true;
                match current {
                    Some(properties) => {
                        observed = Some(ObservedState { properties, ..state });
                    }
                    None => {
                        warn!(id = %state.id, "recorded object no longer exists");
                        ctx.store.remove(name).await?;
                        self.last_known = None;
                    }
                }
            }
        }

        let mut result = match diff(spec, observed.as_ref(), outputs, &ctx.policy) {
            DiffOutcome::Ready(result) => result,
            DiffOutcome::Pending { unresolved } => {
                let reference = unresolved
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| OutputRef::id(name));
                return Err(ResourceError::Unresolved { reference });
            }
        };

        let mut adopted = false;
        let mut unmanaged: Option<String> = None;
        if observed.is_none() {
            if let Some(identity) = kind.schema().identity(&result.properties) {
                let identity = identity.as_str();
                let found = self
                    .call(Operation::Lookup, move || client.lookup(kind, identity))
                    .await?;
                if let Some(object) = found {
                    match ctx.options.existing_resources {
                        ExistingResourcePolicy::Adopt => {
                            info!(id = %object.id, "adopting existing object");
                            let state = ObservedState::new(kind, object.id, object.properties)
                                .with_triggers(result.triggers.clone());
                            let resolved = Resolved {
                                properties: result.properties,
                                triggers: result.triggers,
                            };
                            result = diff_resolved(kind, resolved, Some(&state), &ctx.policy);
                            observed = Some(state);
                            adopted = true;
                        }
                        ExistingResourcePolicy::Replace => {
                            info!(id = %object.id, "existing object is not managed, replacing");
                            unmanaged = Some(object.id);
                            result.change = Change::Replace {
                                reason: ReplaceReason::Unmanaged,
                            };
                        }
                    }
                }
            }
        }
        debug!(change = ?result.change, "diffed");

        let schema = kind.schema();
        let mut targets: BTreeSet<String> = BTreeSet::new();
        if !matches!(result.change, Change::NoChange) {
            targets.extend(schema.lock_key(&result.properties));
            if let Some(state) = &observed {
                targets.extend(schema.lock_key(&state.properties));
            }
        }
        let _held = ctx.targets.acquire(targets).await;

        match (result.change.clone(), observed) {
            (Change::NoChange, Some(state)) => {
                self.enter(Phase::Skipped);
                if refreshed || adopted {
                    self.save(name, state).await?;
                } else {
                    self.last_known = Some(state);
                }
                Ok(if adopted { Action::Adopted } else { Action::None })
            }
            (Change::InPlaceUpdate { changed_fields }, Some(state)) => {
                self.enter(Phase::Updating);
                let changed = result.apply_set();
                let changed = &changed;
                let id = state.id.as_str();
                let properties = self
                    .call(Operation::Update, move || client.update(kind, id, changed))
                    .await?;
                let state = ObservedState {
                    properties,
                    triggers: result.triggers,
                    ..state
                };
                self.save(name, state).await?;
                Ok(Action::Updated { changed_fields })
            }
            (change, observed) => {
                let reason = match change {
                    Change::Replace { reason } => reason,
                    _ => ReplaceReason::NotExists,
                };
                let old_id = observed.map(|s| s.id).or(unmanaged);
                if let Some(old) = old_id.as_deref() {
                    self.enter(Phase::Deleting);
                    match self
                        .call(Operation::Delete, move || client.delete(kind, old))
                        .await
                    {
                        Ok(()) => {}
                        Err(e)
                            if e
                                .hypervisor_error()
                                .is_some_and(HypervisorError::is_not_found) =>
                        {
                            debug!(id = old, "object already deleted");
                        }
                        Err(e) => return Err(e),
                    }
                    if self.last_known.take().is_some() {
                        ctx.store.remove(name).await?;
                    }
                }

                self.enter(Phase::Creating);
                let desired = &result.properties;
                let object = self
                    .call(Operation::Create, move || client.create(kind, desired))
                    .await?;
                let state = ObservedState::new(kind, object.id, object.properties)
                    .with_triggers(result.triggers.clone());
                self.save(name, state).await?;
                Ok(match old_id {
                    Some(_) => Action::Replaced { reason },
                    None => Action::Created,
                })
            }
        }
    }
}
