//! Planning: validate, order and preview a set of resource specifications.
//!
//! Every check that can reject a run happens here, before any hypervisor
//! call is made.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::diff::{diff, Change, DiffOutcome};
use crate::error::{PlanError, ValidationError};
use crate::graph::DependencyGraph;
use crate::model::{normalize, RawSpec, ResourceSpec};
use crate::policy::ReplacementPolicy;
use crate::state::{ObservedState, Outputs, StateStore};

/// One resource ready for materialization.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub spec: ResourceSpec,
    /// Last-known state, loaded once for the run.
    pub observed: Option<ObservedState>,
    /// Diff computed at planning time. References to in-run resources that
    /// will change cannot be resolved yet and leave the step `Pending`.
    pub preview: DiffOutcome,
}

/// Ordered resources of one run.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    steps: Vec<PlanStep>,
    graph: DependencyGraph,
    external: Outputs,
}

impl ExecutionPlan {
    /// Steps in topological order.
    pub fn steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.graph
            .topological_order()
            .iter()
            .map(move |&i| &self.steps[i])
    }

    pub fn step(&self, name: &str) -> Option<&PlanStep> {
        self.graph.index_of(name).map(|i| &self.steps[i])
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// State of resources referenced from outside the run.
    pub fn external(&self) -> &Outputs {
        &self.external
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True when applying the plan would issue no hypervisor call.
    pub fn is_no_op(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.preview.change() == Some(&Change::NoChange))
    }

    pub(crate) fn into_parts(self) -> (Vec<PlanStep>, DependencyGraph, Outputs) {
        (self.steps, self.graph, self.external)
    }
}

pub struct Planner<'a> {
    store: &'a dyn StateStore,
    policy: &'a ReplacementPolicy,
}

impl<'a> Planner<'a> {
    pub fn new(store: &'a dyn StateStore, policy: &'a ReplacementPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn plan(&self, raw: Vec<RawSpec>) -> Result<ExecutionPlan, PlanError> {
        let specs = raw
            .into_iter()
            .map(normalize)
            .collect::<Result<Vec<_>, _>>()?;

        let mut names = HashSet::with_capacity(specs.len());
        for spec in &specs {
            if !names.insert(spec.name()) {
                return Err(ValidationError::DuplicateName(spec.name().to_string()).into());
            }
        }

        let graph = DependencyGraph::build(&specs)?;
        let external = self.load_external(&specs, &graph).await?;

        let mut observed = Vec::with_capacity(specs.len());
        for spec in &specs {
            observed.push(self.store.load(spec.name()).await?);
        }

        let mut previews: Vec<Option<DiffOutcome>> = vec![None; specs.len()];
        let mut outputs = external.clone();
        for &i in graph.topological_order() {
            let preview = diff(&specs[i], observed[i].as_ref(), &outputs, self.policy);
            if let (Some(Change::NoChange), Some(state)) = (preview.change(), &observed[i]) {
                outputs.insert(specs[i].name(), state.clone());
            }
            debug!(resource = specs[i].name(), preview = ?preview.change(), "previewed");
            previews[i] = Some(preview);
        }

        let steps: Vec<PlanStep> = specs
            .into_iter()
            .zip(observed)
            .zip(previews)
            .map(|((spec, observed), preview)| PlanStep {
                spec,
                observed,
                preview: preview.unwrap_or(DiffOutcome::Pending {
                    unresolved: Vec::new(),
                }),
            })
            .collect();

        info!(
            resources = steps.len(),
            edges = graph.edges().len(),
            "plan ready"
        );
        Ok(ExecutionPlan {
            steps,
            graph,
            external,
        })
    }

    /// Load the state behind references and hints that leave the run.
    async fn load_external(
        &self,
        specs: &[ResourceSpec],
        graph: &DependencyGraph,
    ) -> Result<Outputs, PlanError> {
        let mut loaded: HashMap<String, Option<ObservedState>> = HashMap::new();
        let mut external = Outputs::default();
        for spec in specs {
            let targets = spec
                .references()
                .into_iter()
                .map(|(_, r)| r.resource.as_str())
                .chain(spec.depends_on().iter().map(String::as_str));
            for target in targets {
                if graph.index_of(target).is_some() {
                    continue;
                }
                if !loaded.contains_key(target) {
                    let state = self.store.load(target).await?;
                    loaded.insert(target.to_string(), state);
                }
                match loaded.get(target) {
                    Some(Some(state)) => external.insert(target, state.clone()),
                    _ => {
                        return Err(ValidationError::UnknownReference {
                            resource: spec.name().to_string(),
                            target: target.to_string(),
                        }
                        .into())
                    }
                }
            }
        }
        Ok(external)
    }
}
