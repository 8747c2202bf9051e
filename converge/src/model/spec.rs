//! Resource specifications: raw caller input and its validated form.

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::model::schema::{Props, Schema};
use crate::model::{adapter, disk, machine, switch, Input, OutputRef, Properties, Value};
use crate::state::Outputs;

/// Resource kinds managed by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Switch,
    Disk,
    Machine,
    Adapter,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Switch => "Switch",
            ResourceKind::Disk => "Disk",
            ResourceKind::Machine => "Machine",
            ResourceKind::Adapter => "Adapter",
        }
    }

    /// Field table, identity and normalization rules of this kind.
    pub fn schema(&self) -> &'static Schema {
        match self {
            ResourceKind::Switch => &switch::SCHEMA,
            ResourceKind::Disk => &disk::SCHEMA,
            ResourceKind::Machine => &machine::SCHEMA,
            ResourceKind::Adapter => &adapter::SCHEMA,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            ResourceKind::Switch,
            ResourceKind::Disk,
            ResourceKind::Machine,
            ResourceKind::Adapter,
        ]
        .into_iter()
        .find(|k| k.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown resource kind '{s}'"))
    }
}

/// Caller-supplied resource description, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawSpec {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Input>,
    /// Ordering hints: logical names that must converge first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Values whose change unconditionally forces replacement.
    #[serde(default)]
    pub triggers: Vec<Input>,
}

impl RawSpec {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
            triggers: Vec::new(),
        }
    }

    /// Set a property.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Input>) -> Self {
        self.properties.insert(field.into(), value.into());
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn trigger(mut self, value: impl Into<Input>) -> Self {
        self.triggers.push(value.into());
        self
    }
}

/// Validated, defaulted resource specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    kind: ResourceKind,
    name: String,
    properties: BTreeMap<String, Input>,
    depends_on: Vec<String>,
    triggers: Vec<Input>,
}

/// Properties and triggers with every reference substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub properties: Properties,
    pub triggers: Vec<Value>,
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &BTreeMap<String, Input> {
        &self.properties
    }

    /// Concrete value of `field`, if it holds no reference.
    pub fn literal(&self, field: &str) -> Option<&Value> {
        self.properties.get(field).and_then(Input::as_literal)
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    pub fn triggers(&self) -> &[Input] {
        &self.triggers
    }

    /// Every output reference, properties first, then triggers.
    pub fn references(&self) -> Vec<(&str, &OutputRef)> {
        let mut out = Vec::new();
        for (field, input) in &self.properties {
            let mut refs = Vec::new();
            input.collect_refs(&mut refs);
            out.extend(refs.into_iter().map(|r| (field.as_str(), r)));
        }
        for input in &self.triggers {
            let mut refs = Vec::new();
            input.collect_refs(&mut refs);
            out.extend(refs.into_iter().map(|r| ("triggers", r)));
        }
        out
    }

    /// Host identity when every identity field is a literal.
    pub fn identity(&self) -> Option<String> {
        let literals: Properties = self
            .properties
            .iter()
            .filter_map(|(k, v)| v.as_literal().map(|v| (k.clone(), v.clone())))
            .collect();
        self.kind.schema().identity(&literals)
    }

    /// Key of the host object this resource mutates, e.g. `vm:web01` for a
    /// machine and for each of its adapters.
    pub fn lock_key(&self) -> Option<String> {
        self.kind.schema().lock_key_for(&self.properties)
    }

    /// Substitute references from `outputs`.
    ///
    /// Returns every unresolved reference on failure.
    pub fn resolve(&self, outputs: &Outputs) -> Result<Resolved, Vec<OutputRef>> {
        let lookup = |r: &OutputRef| outputs.output(r);
        let mut unresolved = Vec::new();
        let mut properties = Properties::new();
        for (field, input) in &self.properties {
            if let Some(value) = input.resolve(&lookup, &mut unresolved) {
                properties.insert(field.clone(), value);
            }
        }
        let triggers: Vec<Value> = self
            .triggers
            .iter()
            .filter_map(|t| t.resolve(&lookup, &mut unresolved))
            .collect();
        if unresolved.is_empty() {
            Ok(Resolved {
                properties,
                triggers,
            })
        } else {
            Err(unresolved)
        }
    }

    pub fn to_raw(&self) -> RawSpec {
        RawSpec {
            kind: self.kind,
            name: self.name.clone(),
            properties: self.properties.clone(),
            depends_on: self.depends_on.clone(),
            triggers: self.triggers.clone(),
        }
    }
}

impl From<ResourceSpec> for RawSpec {
    fn from(spec: ResourceSpec) -> Self {
        RawSpec {
            kind: spec.kind,
            name: spec.name,
            properties: spec.properties,
            depends_on: spec.depends_on,
            triggers: spec.triggers,
        }
    }
}

/// Validate a raw specification and apply the kind's defaults.
///
/// Normalizing an already normalized spec yields an identical spec.
pub fn normalize(raw: RawSpec) -> Result<ResourceSpec, ValidationError> {
    let RawSpec {
        kind,
        name,
        properties,
        mut depends_on,
        triggers,
    } = raw;

    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName { kind });
    }

    let schema = kind.schema();
    let mut properties: BTreeMap<String, Input> = properties
        .into_iter()
        .map(|(field, input)| (field, input.canonical()))
        .collect();
    {
        let mut props = Props::new(&name, kind, &mut properties);
        props.check_fields(schema.fields)?;
        (schema.check)(&mut props)?;
    }

    if depends_on.iter().any(|d| d.trim().is_empty()) {
        return Err(ValidationError::invalid(
            &name,
            "dependsOn",
            "empty logical name",
        ));
    }
    let mut seen = BTreeSet::new();
    depends_on.retain(|d| seen.insert(d.clone()));

    Ok(ResourceSpec {
        kind,
        name,
        properties,
        depends_on,
        triggers: triggers.into_iter().map(Input::canonical).collect(),
    })
}
