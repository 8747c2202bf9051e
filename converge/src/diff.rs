//! Desired-versus-observed comparison.
//!
//! Classification order, first match wins:
//!
//! 1. any unresolved reference: [`DiffOutcome::Pending`];
//! 2. nothing observed: `Replace { NotExists }`;
//! 3. trigger values differ: `Replace { TriggerChanged }`;
//! 4. a replace-class field differs, or a grow-only field shrank:
//!    `Replace { FieldPolicy }`;
//! 5. any other declared field differs: `InPlaceUpdate`;
//! 6. otherwise `NoChange`.
//!
//! Only declared properties are compared; computed outputs the host adds
//! (identifiers, generated MAC addresses) never produce a diff.

use core::fmt;

use serde::Serialize;

use crate::model::{OutputRef, Properties, Resolved, ResourceKind, ResourceSpec, Value};
use crate::policy::{FieldPolicy, ReplacementPolicy};
use crate::state::{ObservedState, Outputs};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplaceReason {
    /// No object is recorded for the resource.
    NotExists,
    TriggerChanged,
    FieldPolicy { fields: Vec<String> },
    /// An object with the same identity exists but is not managed by this
    /// state, and adoption is disabled.
    Unmanaged,
}

impl fmt::Display for ReplaceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceReason::NotExists => write!(f, "does not exist"),
            ReplaceReason::TriggerChanged => write!(f, "trigger changed"),
            ReplaceReason::FieldPolicy { fields } => {
                write!(f, "replace-class fields changed: {}", fields.join(", "))
            }
            ReplaceReason::Unmanaged => write!(f, "unmanaged object exists"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Change {
    NoChange,
    InPlaceUpdate { changed_fields: Vec<String> },
    Replace { reason: ReplaceReason },
}

impl Change {
    pub fn is_replace(&self) -> bool {
        matches!(self, Change::Replace { .. })
    }
}

/// Classification plus the concrete desired values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffResult {
    pub change: Change,
    /// Every declared property, resolved.
    pub properties: Properties,
    pub triggers: Vec<Value>,
}

impl DiffResult {
    /// Properties to send to the host: only the changed fields for an
    /// in-place update, everything otherwise.
    pub fn apply_set(&self) -> Properties {
        match &self.change {
            Change::InPlaceUpdate { changed_fields } => changed_fields
                .iter()
                .filter_map(|f| self.properties.get(f).map(|v| (f.clone(), v.clone())))
                .collect(),
            _ => self.properties.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    Ready(DiffResult),
    /// Some references cannot be resolved yet. Not terminal: diff again once
    /// the producers have converged.
    Pending { unresolved: Vec<OutputRef> },
}

impl DiffOutcome {
    pub fn change(&self) -> Option<&Change> {
        match self {
            DiffOutcome::Ready(result) => Some(&result.change),
            DiffOutcome::Pending { .. } => None,
        }
    }
}

/// Compare a spec against its last-known state.
pub fn diff(
    spec: &ResourceSpec,
    observed: Option<&ObservedState>,
    outputs: &Outputs,
    policy: &ReplacementPolicy,
) -> DiffOutcome {
    match spec.resolve(outputs) {
        Ok(resolved) => DiffOutcome::Ready(diff_resolved(spec.kind(), resolved, observed, policy)),
        Err(unresolved) => DiffOutcome::Pending { unresolved },
    }
}

/// [`diff`] on already resolved values.
pub fn diff_resolved(
    kind: ResourceKind,
    resolved: Resolved,
    observed: Option<&ObservedState>,
    policy: &ReplacementPolicy,
) -> DiffResult {
    let Resolved {
        properties,
        triggers,
    } = resolved;
    let change = classify(kind, &properties, &triggers, observed, policy);
    DiffResult {
        change,
        properties,
        triggers,
    }
}

fn classify(
    kind: ResourceKind,
    properties: &Properties,
    triggers: &[Value],
    observed: Option<&ObservedState>,
    policy: &ReplacementPolicy,
) -> Change {
    let Some(observed) = observed else {
        return Change::Replace {
            reason: ReplaceReason::NotExists,
        };
    };

    if observed.triggers.as_slice() != triggers {
        return Change::Replace {
            reason: ReplaceReason::TriggerChanged,
        };
    }

    let mut replace_fields = Vec::new();
    let mut changed_fields = Vec::new();
    for (field, desired) in properties {
        let current = observed.properties.get(field);
        if current == Some(desired) {
            continue;
        }
        match policy.field_policy(kind, field) {
            FieldPolicy::Replace => replace_fields.push(field.clone()),
            FieldPolicy::Update => changed_fields.push(field.clone()),
            FieldPolicy::GrowOnly => match (current.and_then(Value::as_int), desired.as_int()) {
                (Some(old), Some(new)) if new < old => replace_fields.push(field.clone()),
                _ => changed_fields.push(field.clone()),
            },
        }
    }

    if !replace_fields.is_empty() {
        Change::Replace {
            reason: ReplaceReason::FieldPolicy {
                fields: replace_fields,
            },
        }
    } else if !changed_fields.is_empty() {
        Change::InPlaceUpdate { changed_fields }
    } else {
        Change::NoChange
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{normalize, RawSpec};

    fn machine() -> ResourceSpec {
        normalize(
            RawSpec::new(ResourceKind::Machine, "vm")
                .with("machineName", "web01")
                .with("processorCount", 2i64),
        )
        .unwrap()
    }

    fn observed_for(spec: &ResourceSpec) -> ObservedState {
        let resolved = spec.resolve(&Outputs::default()).unwrap();
        ObservedState::new(spec.kind(), "vm-1", resolved.properties).with_triggers(resolved.triggers)
    }

    fn classify_with(spec: &ResourceSpec, observed: Option<&ObservedState>) -> Change {
        match diff(spec, observed, &Outputs::default(), &ReplacementPolicy::new()) {
            DiffOutcome::Ready(result) => result.change,
            DiffOutcome::Pending { .. } => panic!("unexpected pending diff"),
        }
    }

    #[test]
    fn test_absent_is_create() {
        assert_eq!(
            classify_with(&machine(), None),
            Change::Replace {
                reason: ReplaceReason::NotExists
            }
        );
    }

    #[test]
    fn test_identical_is_no_change() {
        let spec = machine();
        let mut observed = observed_for(&spec);
        observed
            .properties
            .insert("vmId".into(), Value::from("computed"));
        assert_eq!(classify_with(&spec, Some(&observed)), Change::NoChange);
    }

    #[test]
    fn test_mutable_field_updates_in_place() {
        let spec = machine();
        let mut observed = observed_for(&spec);
        observed
            .properties
            .insert("processorCount".into(), Value::Int(1));
        let DiffOutcome::Ready(result) = diff(
            &spec,
            Some(&observed),
            &Outputs::default(),
            &ReplacementPolicy::new(),
        ) else {
            panic!("expected ready diff");
        };
        assert_eq!(
            result.change,
            Change::InPlaceUpdate {
                changed_fields: vec!["processorCount".into()]
            }
        );
        assert_eq!(
            result.apply_set(),
            Properties::from([("processorCount".to_string(), Value::Int(2))])
        );
    }

    #[test]
    fn test_identity_field_forces_replace() {
        let spec = machine();
        let mut observed = observed_for(&spec);
        observed.properties.insert("generation".into(), Value::Int(1));
        observed
            .properties
            .insert("processorCount".into(), Value::Int(1));
        assert_eq!(
            classify_with(&spec, Some(&observed)),
            Change::Replace {
                reason: ReplaceReason::FieldPolicy {
                    fields: vec!["generation".into()]
                }
            }
        );
    }

    #[test]
    fn test_trigger_change_wins_over_everything() {
        let spec = normalize(machine().to_raw().trigger("v2")).unwrap();
        let mut observed = observed_for(&spec).with_triggers(vec![Value::from("v1")]);
        observed.properties.insert("generation".into(), Value::Int(1));
        assert_eq!(
            classify_with(&spec, Some(&observed)),
            Change::Replace {
                reason: ReplaceReason::TriggerChanged
            }
        );
    }

    #[test]
    fn test_disk_grows_in_place_and_shrink_replaces() {
        let spec = normalize(
            RawSpec::new(ResourceKind::Disk, "os")
                .with("path", "C:\\os.vhdx")
                .with("sizeBytes", 200i64),
        )
        .unwrap();
        let mut observed = observed_for(&spec);

        observed.properties.insert("sizeBytes".into(), Value::Int(100));
        assert_eq!(
            classify_with(&spec, Some(&observed)),
            Change::InPlaceUpdate {
                changed_fields: vec!["sizeBytes".into()]
            }
        );

        observed.properties.insert("sizeBytes".into(), Value::Int(300));
        assert!(classify_with(&spec, Some(&observed)).is_replace());
    }

    #[test]
    fn test_policy_override_changes_classification() {
        let spec = machine();
        let mut observed = observed_for(&spec);
        observed
            .properties
            .insert("processorCount".into(), Value::Int(1));
        let policy = ReplacementPolicy::new().with_override(
            ResourceKind::Machine,
            "processorCount",
            FieldPolicy::Replace,
        );
        let outcome = diff(&spec, Some(&observed), &Outputs::default(), &policy);
        assert!(outcome.change().unwrap().is_replace());
    }

    #[test]
    fn test_unresolved_reference_is_pending() {
        let spec = normalize(
            RawSpec::new(ResourceKind::Adapter, "nic")
                .with("name", "nic0")
                .with("vmName", crate::model::OutputRef::new("vm", "machineName"))
                .with("switchName", "lan"),
        )
        .unwrap();
        let outcome = diff(&spec, None, &Outputs::default(), &ReplacementPolicy::new());
        assert_eq!(
            outcome,
            DiffOutcome::Pending {
                unresolved: vec![OutputRef::new("vm", "machineName")]
            }
        );
    }

    #[test]
    fn test_diff_is_deterministic() {
        let spec = machine();
        let mut observed = observed_for(&spec);
        observed.properties.insert("memorySize".into(), Value::Int(2048));
        let a = diff(&spec, Some(&observed), &Outputs::default(), &ReplacementPolicy::new());
        let b = diff(&spec, Some(&observed), &Outputs::default(), &ReplacementPolicy::new());
        assert_eq!(a, b);
    }
}
