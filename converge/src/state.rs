//! Last-known resource state and the stores that persist it.
//!
//! The convergence core consumes a [`StateStore`] as its memory of reality.
//! Two adapters are provided: [`MemoryStateStore`] for a single process and
//! [`JsonFileStateStore`], which keeps one JSON document per logical name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StateError;
use crate::model::{OutputRef, Properties, ResourceKind, Value, ID_OUTPUT};

/// Concrete state of a resource as last observed on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    pub kind: ResourceKind,
    /// Provider-assigned identifier.
    pub id: String,
    pub properties: Properties,
    /// Trigger values the object was created with.
    #[serde(default)]
    pub triggers: Vec<Value>,
}

impl ObservedState {
    pub fn new(kind: ResourceKind, id: impl Into<String>, properties: Properties) -> Self {
        Self {
            kind,
            id: id.into(),
            properties,
            triggers: Vec::new(),
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<Value>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Value of an output: `id` or an observed property.
    pub fn output(&self, name: &str) -> Option<Value> {
        if name == ID_OUTPUT {
            Some(Value::String(self.id.clone()))
        } else {
            self.properties.get(name).cloned()
        }
    }
}

/// Observed state of resources whose outputs may be referenced.
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    states: HashMap<String, ObservedState>,
}

impl Outputs {
    pub fn insert(&mut self, name: impl Into<String>, state: ObservedState) {
        self.states.insert(name.into(), state);
    }

    pub fn get(&self, name: &str) -> Option<&ObservedState> {
        self.states.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    /// Concrete value behind a reference, if the producer is known.
    pub fn output(&self, reference: &OutputRef) -> Option<Value> {
        self.states
            .get(&reference.resource)
            .and_then(|s| s.output(&reference.output))
    }
}

/// Persistence of last-known state, keyed by logical name.
///
/// `save` must be atomic per key.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<ObservedState>, StateError>;

    async fn save(&self, name: &str, state: &ObservedState) -> Result<(), StateError>;

    /// Forget a resource. Removing an unknown name is not an error.
    async fn remove(&self, name: &str) -> Result<(), StateError>;
}

/// In-process state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, ObservedState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HashMap<String, ObservedState> {
        self.states.read().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, name: &str) -> Result<Option<ObservedState>, StateError> {
        Ok(self.states.read().await.get(name).cloned())
    }

    async fn save(&self, name: &str, state: &ObservedState) -> Result<(), StateError> {
        self.states
            .write()
            .await
            .insert(name.to_string(), state.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StateError> {
        self.states.write().await.remove(name);
        Ok(())
    }
}

/// One JSON document per logical name under a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// reader never sees a half-written document.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File of `name`. Bytes outside `[a-z0-9._-]` are written as `%XX`, so
    /// distinct names never share a file, even on a case-insensitive volume.
    fn path_for(&self, name: &str) -> PathBuf {
        let mut file = String::with_capacity(name.len() + 5);
        for byte in name.bytes() {
            if matches!(byte, b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.') {
                file.push(char::from(byte));
            } else {
                file.push_str(&format!("%{byte:02X}"));
            }
        }
        file.push_str(".json");
        self.dir.join(file)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load(&self, name: &str) -> Result<Option<ObservedState>, StateError> {
        let path = self.path_for(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StateError::Serialization {
                name: name.to_string(),
                source,
            })
    }

    async fn save(&self, name: &str, state: &ObservedState) -> Result<(), StateError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let path = self.path_for(name);
        let body = serde_json::to_vec_pretty(state).map_err(|source| {
            StateError::Serialization {
                name: name.to_string(),
                source,
            }
        })?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        debug!(resource = name, path = %path.display(), "state saved");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StateError> {
        let path = self.path_for(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}
