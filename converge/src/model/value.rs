//! Property values and deferred output references.
//!
//! A desired property is an [`Input`]: either a concrete [`Value`] or a
//! placeholder ([`OutputRef`]) bound to another resource's output. Inputs
//! only become concrete once the referenced resource has converged.

use core::fmt;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the pseudo-output carrying a resource's provider-assigned identifier.
pub const ID_OUTPUT: &str = "id";

/// Concrete property set, keyed by camelCase property name.
pub type Properties = BTreeMap<String, Value>;

/// Concrete property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short type name used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Placeholder for an output of another resource in the same run (or of a
/// previously converged one).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputRef {
    /// Logical name of the producing resource.
    #[serde(rename = "ref")]
    pub resource: String,
    /// Observed property of the producer, or [`ID_OUTPUT`].
    pub output: String,
}

impl OutputRef {
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }

    /// Reference to the producer's provider-assigned identifier.
    pub fn id(resource: impl Into<String>) -> Self {
        Self::new(resource, ID_OUTPUT)
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.output)
    }
}

/// Desired property value, possibly containing unresolved references.
///
/// Deserialises from plain JSON/TOML: `{"ref": "disk", "output": "path"}` is a
/// reference, everything else is a literal or a container of inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Input {
    Ref(OutputRef),
    List(Vec<Input>),
    Map(BTreeMap<String, Input>),
    Value(Value),
}

impl Input {
    /// Collapse containers without references into a single literal.
    ///
    /// Two inputs describing the same value compare equal after this.
    pub fn canonical(self) -> Input {
        match self {
            Input::List(items) => {
                let items: Vec<Input> = items.into_iter().map(Input::canonical).collect();
                if items.iter().all(|i| matches!(i, Input::Value(_))) {
                    Input::Value(Value::List(
                        items.into_iter().filter_map(Input::into_literal).collect(),
                    ))
                } else {
                    Input::List(items)
                }
            }
            Input::Map(map) => {
                let map: BTreeMap<String, Input> =
                    map.into_iter().map(|(k, v)| (k, v.canonical())).collect();
                if map.values().all(|i| matches!(i, Input::Value(_))) {
                    Input::Value(Value::Map(
                        map.into_iter()
                            .filter_map(|(k, v)| v.into_literal().map(|v| (k, v)))
                            .collect(),
                    ))
                } else {
                    Input::Map(map)
                }
            }
            other => other,
        }
    }

    /// The literal value, when this input is already concrete.
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Input::Value(v) => Some(v),
            _ => None,
        }
    }

    fn into_literal(self) -> Option<Value> {
        match self {
            Input::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, Input::Ref(_))
    }

    /// Append every reference contained in this input.
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Input::Ref(r) => out.push(r),
            Input::List(items) => items.iter().for_each(|i| i.collect_refs(out)),
            Input::Map(map) => map.values().for_each(|i| i.collect_refs(out)),
            Input::Value(_) => {}
        }
    }

    /// Substitute references using `lookup`. Unresolvable references are
    /// pushed to `unresolved` and yield `None`.
    pub fn resolve<F>(&self, lookup: &F, unresolved: &mut Vec<OutputRef>) -> Option<Value>
    where
        F: Fn(&OutputRef) -> Option<Value>,
    {
        match self {
            Input::Value(v) => Some(v.clone()),
            Input::Ref(r) => {
                let value = lookup(r);
                if value.is_none() {
                    unresolved.push(r.clone());
                }
                value
            }
            Input::List(items) => {
                let resolved: Vec<Option<Value>> =
                    items.iter().map(|i| i.resolve(lookup, unresolved)).collect();
                resolved.into_iter().collect::<Option<Vec<_>>>().map(Value::List)
            }
            Input::Map(map) => {
                let resolved: Vec<(String, Option<Value>)> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(lookup, unresolved)))
                    .collect();
                resolved
                    .into_iter()
                    .map(|(k, v)| v.map(|v| (k, v)))
                    .collect::<Option<BTreeMap<_, _>>>()
                    .map(Value::Map)
            }
        }
    }
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Input::Value(v)
    }
}

impl From<OutputRef> for Input {
    fn from(r: OutputRef) -> Self {
        Input::Ref(r)
    }
}

impl From<bool> for Input {
    fn from(b: bool) -> Self {
        Input::Value(Value::Bool(b))
    }
}

impl From<i64> for Input {
    fn from(i: i64) -> Self {
        Input::Value(Value::Int(i))
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Input::Value(Value::from(s))
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Input::Value(Value::String(s))
    }
}

impl From<Vec<Input>> for Input {
    fn from(items: Vec<Input>) -> Self {
        Input::List(items).canonical()
    }
}

impl From<BTreeMap<String, Input>> for Input {
    fn from(map: BTreeMap<String, Input>) -> Self {
        Input::Map(map).canonical()
    }
}
