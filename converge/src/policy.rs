//! Field-level replacement policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::ResourceKind;

/// How a change to a single field is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldPolicy {
    /// Identity-defining: any change destroys and recreates the object.
    Replace,
    /// Mutable in place.
    Update,
    /// Integer that may grow in place; shrinking forces replacement.
    GrowOnly,
}

/// Per-kind, per-field declaration of which changes force `Replace`.
///
/// Defaults come from each kind's schema. Overrides take precedence, which
/// lets a caller harden a normally mutable field (for example pinning
/// `processorCount` so any change recreates the machine).
#[derive(Debug, Clone, Default)]
pub struct ReplacementPolicy {
    overrides: HashMap<(ResourceKind, String), FieldPolicy>,
}

impl ReplacementPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(
        mut self,
        kind: ResourceKind,
        field: impl Into<String>,
        policy: FieldPolicy,
    ) -> Self {
        self.overrides.insert((kind, field.into()), policy);
        self
    }

    /// Effective policy for `field`. Fields unknown to the schema are
    /// treated as updatable.
    pub fn field_policy(&self, kind: ResourceKind, field: &str) -> FieldPolicy {
        if let Some(policy) = self.overrides.get(&(kind, field.to_string())) {
            return *policy;
        }
        kind.schema()
            .field(field)
            .map(|f| f.policy)
            .unwrap_or(FieldPolicy::Update)
    }
}
