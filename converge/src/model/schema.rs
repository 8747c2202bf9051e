//! Per-kind field tables and the normalization helpers they share.

use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::model::types::Choice;
use crate::model::{Input, Properties, ResourceKind, Value};
use crate::policy::FieldPolicy;

/// Expected shape of a literal property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Bool,
    List,
}

impl FieldType {
    fn accepts(&self, input: &Input) -> bool {
        match (self, input) {
            (_, Input::Ref(_)) => true,
            (FieldType::List, Input::List(_)) => true,
            (FieldType::String, Input::Value(Value::String(_))) => true,
            (FieldType::Int, Input::Value(Value::Int(_))) => true,
            (FieldType::Bool, Input::Value(Value::Bool(_))) => true,
            (FieldType::List, Input::Value(Value::List(_))) => true,
            _ => false,
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            FieldType::String => "a string",
            FieldType::Int => "an integer",
            FieldType::Bool => "a boolean",
            FieldType::List => "a list",
        }
    }
}

/// One declared property of a resource kind.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub policy: FieldPolicy,
}

impl Field {
    pub const fn new(name: &'static str, ty: FieldType, policy: FieldPolicy) -> Self {
        Self {
            name,
            ty,
            required: false,
            policy,
        }
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Declared surface of a resource kind.
pub struct Schema {
    pub kind: ResourceKind,
    pub fields: &'static [Field],
    /// Fields whose values, joined with `/`, identify the object on the host.
    pub identity: &'static [&'static str],
    /// Prefix and field of the shared-object lock key.
    pub lock: (&'static str, &'static str),
    pub(crate) check: fn(&mut Props<'_>) -> Result<(), ValidationError>,
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Host identity from concrete properties, e.g. `web01/nic0` for an adapter.
    pub fn identity(&self, properties: &Properties) -> Option<String> {
        let parts = self
            .identity
            .iter()
            .map(|field| properties.get(*field).and_then(Value::as_str))
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }

    /// Lock key from concrete properties.
    pub fn lock_key(&self, properties: &Properties) -> Option<String> {
        let (prefix, field) = self.lock;
        properties
            .get(field)
            .and_then(Value::as_str)
            .map(|v| format!("{prefix}:{v}"))
    }

    /// Lock key from desired inputs. A referenced value keys on the reference
    /// itself, so two resources naming the same output share a key.
    pub fn lock_key_for(&self, inputs: &BTreeMap<String, Input>) -> Option<String> {
        let (prefix, field) = self.lock;
        match inputs.get(field)? {
            Input::Value(Value::String(v)) => Some(format!("{prefix}:{v}")),
            Input::Ref(r) => Some(format!("{prefix}:@{r}")),
            _ => None,
        }
    }
}

/// Mutable view over one property map during normalization.
pub(crate) struct Props<'a> {
    resource: &'a str,
    kind: ResourceKind,
    prefix: String,
    values: &'a mut BTreeMap<String, Input>,
}

impl<'a> Props<'a> {
    pub(crate) fn new(
        resource: &'a str,
        kind: ResourceKind,
        values: &'a mut BTreeMap<String, Input>,
    ) -> Self {
        Self {
            resource,
            kind,
            prefix: String::new(),
            values,
        }
    }

    fn path(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    pub(crate) fn invalid(&self, field: &str, message: impl Into<String>) -> ValidationError {
        ValidationError::invalid(self.resource, self.path(field), message)
    }

    /// Reject unknown fields and literals of the wrong type; require presence
    /// of required fields.
    pub(crate) fn check_fields(&self, fields: &[Field]) -> Result<(), ValidationError> {
        for (name, input) in self.values.iter() {
            let Some(field) = fields.iter().find(|f| f.name == name) else {
                return Err(ValidationError::UnknownField {
                    resource: self.resource.to_string(),
                    kind: self.kind,
                    field: self.path(name),
                });
            };
            if !field.ty.accepts(input) {
                return Err(ValidationError::TypeMismatch {
                    resource: self.resource.to_string(),
                    field: self.path(name),
                    expected: field.ty.expected(),
                });
            }
        }
        for field in fields.iter().filter(|f| f.required) {
            self.require(field.name)?;
        }
        Ok(())
    }

    pub(crate) fn has(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub(crate) fn require(&self, field: &str) -> Result<(), ValidationError> {
        if self.has(field) {
            Ok(())
        } else {
            Err(ValidationError::missing(self.resource, self.path(field)))
        }
    }

    pub(crate) fn literal(&self, field: &str) -> Option<&Value> {
        self.values.get(field).and_then(Input::as_literal)
    }

    pub(crate) fn str(&self, field: &str) -> Option<&str> {
        self.literal(field).and_then(Value::as_str)
    }

    pub(crate) fn int(&self, field: &str) -> Option<i64> {
        self.literal(field).and_then(Value::as_int)
    }

    pub(crate) fn bool(&self, field: &str) -> Option<bool> {
        self.literal(field).and_then(Value::as_bool)
    }

    pub(crate) fn set(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), Input::Value(value));
    }

    pub(crate) fn default(&mut self, field: &str, value: impl Into<Value>) {
        if !self.has(field) {
            self.set(field, value.into());
        }
    }

    /// Literal string must be non-empty.
    pub(crate) fn non_empty(&self, field: &str) -> Result<(), ValidationError> {
        match self.str(field) {
            Some(s) if s.trim().is_empty() => Err(self.invalid(field, "must not be empty")),
            _ => Ok(()),
        }
    }

    /// Canonicalize a literal choice. References are left alone.
    pub(crate) fn choice<T: Choice>(&mut self, field: &str) -> Result<Option<T>, ValidationError> {
        let Some(raw) = self.str(field) else {
            return Ok(None);
        };
        let parsed = T::parse(raw).ok_or_else(|| {
            self.invalid(
                field,
                format!("'{raw}' is not one of {}", T::CHOICES.join(", ")),
            )
        })?;
        self.set(field, Value::from(parsed.as_str()));
        Ok(Some(parsed))
    }

    /// Literal integer must be strictly positive.
    pub(crate) fn positive(&self, field: &str) -> Result<Option<i64>, ValidationError> {
        match self.int(field) {
            Some(value) if value <= 0 => Err(ValidationError::NonPositive {
                resource: self.resource.to_string(),
                field: self.path(field),
                value,
            }),
            other => Ok(other),
        }
    }

    /// Literal integer must satisfy `valid`.
    pub(crate) fn int_in(
        &self,
        field: &str,
        valid: impl Fn(i64) -> bool,
        expected: &str,
    ) -> Result<Option<i64>, ValidationError> {
        match self.int(field) {
            Some(value) if !valid(value) => {
                Err(self.invalid(field, format!("{value} is outside {expected}")))
            }
            other => Ok(other),
        }
    }

    /// Normalize every map item of a list field with `each`.
    ///
    /// Items may be literal maps or maps holding references; the list is
    /// stored back in canonical form.
    pub(crate) fn each_item(
        &mut self,
        field: &str,
        mut each: impl FnMut(&mut Props<'_>) -> Result<(), ValidationError>,
    ) -> Result<(), ValidationError> {
        let Some(list) = self.values.remove(field) else {
            return Ok(());
        };
        let items: Vec<Input> = match list {
            Input::Value(Value::List(values)) => values.into_iter().map(Input::Value).collect(),
            Input::List(items) => items,
            _ => return Err(self.invalid(field, "expected a list")),
        };
        let mut normalized = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let mut map: BTreeMap<String, Input> = match item {
                Input::Value(Value::Map(map)) => {
                    map.into_iter().map(|(k, v)| (k, Input::Value(v))).collect()
                }
                Input::Map(map) => map,
                _ => {
                    return Err(ValidationError::TypeMismatch {
                        resource: self.resource.to_string(),
                        field: format!("{}[{i}]", self.path(field)),
                        expected: "a map",
                    })
                }
            };
            let mut item_props = Props {
                resource: self.resource,
                kind: self.kind,
                prefix: format!("{}[{i}].", self.path(field)),
                values: &mut map,
            };
            each(&mut item_props)?;
            normalized.push(Input::Map(map));
        }
        self.values
            .insert(field.to_string(), Input::List(normalized).canonical());
        Ok(())
    }
}
