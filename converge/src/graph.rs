//! Dependency graph over the resources of one run.
//!
//! Edges point from a dependent to its dependency. They come from three
//! explicit rules, each recorded as an [`EdgeCause`]:
//!
//! 1. an output reference in a property or trigger;
//! 2. a caller-declared `dependsOn` hint;
//! 3. two resources mutating the same host object (same lock key) that are
//!    not otherwise ordered: the later-declared one waits for the earlier.
//!    A lock field given as a reference keys on the literal its producer
//!    declares, so `vmName: web01` and `vmName: vm.machineName` agree.
//!
//! Names that are not part of the run produce no edge.

use std::collections::{BTreeSet, HashMap};

use crate::error::{CycleError, GraphError};
use crate::model::{Input, ResourceSpec, Value};

/// Why an edge exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeCause {
    Reference { property: String },
    Hint,
    SharedTarget { key: String },
}

/// `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub cause: EdgeCause,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
    edges: Vec<Edge>,
    order: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Lock key of `spec` with a referenced lock field followed back to the
/// literal declared by its producer in this run.
fn target_key(
    specs: &[ResourceSpec],
    index: &HashMap<String, usize>,
    spec: &ResourceSpec,
) -> Option<String> {
    let (prefix, field) = spec.kind().schema().lock;
    let mut input = spec.properties().get(field);
    // Bounded: reference cycles are reported later by `check_acyclic`.
    for _ in 0..=specs.len() {
        match input {
            Some(Input::Value(Value::String(v))) => return Some(format!("{prefix}:{v}")),
            Some(Input::Ref(r)) => {
                input = index
                    .get(&r.resource)
                    .and_then(|&producer| specs[producer].properties().get(&r.output));
            }
            _ => break,
        }
    }
    spec.lock_key()
}

impl DependencyGraph {
    /// Build the graph and its topological order.
    ///
    /// Fails on duplicate logical names and on any cycle.
    pub fn build(specs: &[ResourceSpec]) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name().to_string(), i).is_some() {
                return Err(GraphError::DuplicateName(spec.name().to_string()));
            }
        }

        let mut graph = Self {
            names: specs.iter().map(|s| s.name().to_string()).collect(),
            index,
            dependencies: vec![BTreeSet::new(); specs.len()],
            dependents: vec![BTreeSet::new(); specs.len()],
            edges: Vec::new(),
            order: Vec::new(),
        };

        for (i, spec) in specs.iter().enumerate() {
            for (property, reference) in spec.references() {
                if let Some(&to) = graph.index.get(&reference.resource) {
                    graph.add_edge(
                        i,
                        to,
                        EdgeCause::Reference {
                            property: property.to_string(),
                        },
                    );
                }
            }
            for hint in spec.depends_on() {
                if let Some(&to) = graph.index.get(hint) {
                    graph.add_edge(i, to, EdgeCause::Hint);
                }
            }
        }

        let keys: Vec<Option<String>> = specs
            .iter()
            .map(|spec| target_key(specs, &graph.index, spec))
            .collect();
        for later in 0..specs.len() {
            let Some(key) = &keys[later] else { continue };
            for earlier in 0..later {
                if keys[earlier].as_ref() != Some(key) {
                    continue;
                }
                if graph.reaches(later, earlier) || graph.reaches(earlier, later) {
                    continue;
                }
                graph.add_edge(later, earlier, EdgeCause::SharedTarget { key: key.clone() });
            }
        }

        graph.check_acyclic()?;
        graph.order = graph.kahn_order();
        Ok(graph)
    }

    fn add_edge(&mut self, from: usize, to: usize, cause: EdgeCause) {
        let new = self.dependencies[from].insert(to);
        self.dependents[to].insert(from);
        if new {
            self.edges.push(Edge {
                from: self.names[from].clone(),
                to: self.names[to].clone(),
                cause,
            });
        }
    }

    /// True when `from` transitively depends on `to`.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut seen = vec![false; self.names.len()];
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if std::mem::replace(&mut seen[node], true) {
                continue;
            }
            stack.extend(self.dependencies[node].iter().copied());
        }
        false
    }

    /// Three-color depth-first search, roots in declaration order.
    fn check_acyclic(&self) -> Result<(), CycleError> {
        let mut color = vec![Color::White; self.names.len()];
        let mut path = Vec::new();
        for root in 0..self.names.len() {
            if color[root] == Color::White {
                self.visit(root, &mut color, &mut path)?;
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        color: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Result<(), CycleError> {
        color[node] = Color::Gray;
        path.push(node);
        for &next in &self.dependencies[node] {
            match color[next] {
                Color::White => self.visit(next, color, path)?,
                Color::Gray => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&n| self.names[n].clone()).collect();
                    cycle.push(self.names[next].clone());
                    return Err(CycleError { path: cycle });
                }
                Color::Black => {}
            }
        }
        path.pop();
        color[node] = Color::Black;
        Ok(())
    }

    /// Kahn's algorithm; among ready nodes the earliest declared goes first.
    fn kahn_order(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.names.len())
            .filter(|&i| pending[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.names.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Direct dependencies of `index`.
    pub fn dependencies(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependencies[index]
    }

    /// Direct dependents of `index`.
    pub fn dependents(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependents[index]
    }

    /// Everything that depends on `index`, directly or transitively.
    pub fn transitive_dependents(&self, index: usize) -> BTreeSet<usize> {
        let mut found = BTreeSet::new();
        let mut stack: Vec<usize> = self.dependents[index].iter().copied().collect();
        while let Some(node) = stack.pop() {
            if found.insert(node) {
                stack.extend(self.dependents[node].iter().copied());
            }
        }
        found
    }

    /// Node indexes in topological order, dependencies first.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Logical names in topological order.
    pub fn ordered_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}
