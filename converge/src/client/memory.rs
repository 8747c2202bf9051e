//! In-process hypervisor for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{HypervisorClient, Operation, RemoteObject};
use crate::error::{HypervisorError, Result};
use crate::model::{Properties, ResourceKind, Value};

/// Scripted failure for the next `remaining` matching calls.
#[derive(Debug, Clone)]
pub struct Fault {
    pub operation: Operation,
    /// `None` matches every kind.
    pub kind: Option<ResourceKind>,
    pub remaining: u32,
    pub error: HypervisorError,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub kind: ResourceKind,
    /// Identity for create and lookup, identifier otherwise.
    pub target: String,
    pub ok: bool,
}

#[derive(Debug, Clone)]
struct Object {
    kind: ResourceKind,
    properties: Properties,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Object>,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    in_flight: usize,
    max_in_flight: usize,
    active_keys: Vec<String>,
    overlaps: Vec<String>,
}

impl Inner {
    fn take_fault(&mut self, operation: Operation, kind: ResourceKind) -> Option<HypervisorError> {
        let fault = self.faults.iter_mut().find(|f| {
            f.operation == operation && f.kind.map_or(true, |k| k == kind) && f.remaining > 0
        })?;
        fault.remaining -= 1;
        Some(fault.error.clone())
    }

    /// Object `id`, only if it is of `kind`.
    fn object(&self, kind: ResourceKind, id: &str) -> Option<&Object> {
        self.objects.get(id).filter(|o| o.kind == kind)
    }

    fn find_identity(&self, kind: ResourceKind, identity: &str) -> Option<(&String, &Object)> {
        self.objects.iter().find(|(_, o)| {
            o.kind == kind && kind.schema().identity(&o.properties).as_deref() == Some(identity)
        })
    }

    fn exists(&self, kind: ResourceKind, field: &str, value: &str) -> bool {
        self.objects.values().any(|o| {
            o.kind == kind && o.properties.get(field).and_then(Value::as_str) == Some(value)
        })
    }

    fn require(
        &self,
        property: &str,
        kind: ResourceKind,
        field: &str,
        value: Option<&str>,
    ) -> Result<()> {
        match value {
            Some(v) if !self.exists(kind, field, v) => Err(HypervisorError::InvalidProperty {
                property: property.to_string(),
                message: format!("{kind} '{v}' does not exist"),
            }),
            _ => Ok(()),
        }
    }

    /// Objects a resource attaches to must already exist on the host.
    fn check_attachments(&self, kind: ResourceKind, properties: &Properties) -> Result<()> {
        let get = |field: &str| properties.get(field).and_then(Value::as_str);
        match kind {
            ResourceKind::Switch => Ok(()),
            ResourceKind::Disk => self.require(
                "parentPath",
                ResourceKind::Disk,
                "path",
                get("parentPath"),
            ),
            ResourceKind::Adapter => {
                self.require("vmName", ResourceKind::Machine, "machineName", get("vmName"))?;
                self.require("switchName", ResourceKind::Switch, "name", get("switchName"))
            }
            ResourceKind::Machine => {
                for nic in list_items(properties, "networkAdapters") {
                    self.require(
                        "networkAdapters",
                        ResourceKind::Switch,
                        "name",
                        nic.get("switchName").and_then(Value::as_str),
                    )?;
                }
                for drive in list_items(properties, "hardDrives") {
                    self.require(
                        "hardDrives",
                        ResourceKind::Disk,
                        "path",
                        drive.get("path").and_then(Value::as_str),
                    )?;
                }
                Ok(())
            }
        }
    }

    fn check_conflict(
        &self,
        kind: ResourceKind,
        properties: &Properties,
        except: Option<&str>,
    ) -> Result<()> {
        let Some(identity) = kind.schema().identity(properties) else {
            return Ok(());
        };
        match self.find_identity(kind, &identity) {
            Some((id, _)) if Some(id.as_str()) != except => {
                Err(HypervisorError::Conflict { kind, identity })
            }
            _ => Ok(()),
        }
    }
}

fn list_items<'a>(
    properties: &'a Properties,
    field: &str,
) -> impl Iterator<Item = &'a BTreeMap<String, Value>> {
    properties
        .get(field)
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_map)
}

/// Deterministic [`HypervisorClient`] holding objects in memory.
///
/// Besides the client surface it records every call, tracks how many calls
/// run at once, and notes any two mutations that overlap on the same host
/// object (same lock key).
#[derive(Debug, Default)]
pub struct InMemoryHypervisor {
    inner: Mutex<Inner>,
    latency: Duration,
    mac_counter: AtomicU64,
}

impl InMemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `latency` before taking effect.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Fail the next `times` calls of `operation` on `kind` with `error`.
    pub fn fail(&self, operation: Operation, kind: ResourceKind, times: u32, error: HypervisorError) {
        self.inject(Fault {
            operation,
            kind: Some(kind),
            remaining: times,
            error,
        });
    }

    /// Place an object on the host without going through the client, as if
    /// created out of band.
    pub fn seed(&self, kind: ResourceKind, properties: Properties) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock().objects.insert(id.clone(), Object { kind, properties });
        id
    }

    /// Remove an object out of band.
    pub fn forget(&self, id: &str) -> bool {
        self.lock().objects.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Properties> {
        self.lock().objects.get(id).map(|o| o.properties.clone())
    }

    pub fn find(&self, kind: ResourceKind, identity: &str) -> Option<RemoteObject> {
        self.lock()
            .find_identity(kind, identity)
            .map(|(id, o)| RemoteObject {
                id: id.clone(),
                properties: o.properties.clone(),
            })
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Lock keys on which two mutations ran concurrently.
    pub fn overlaps(&self) -> Vec<String> {
        self.lock().overlaps.clone()
    }

    fn lock_key_of(&self, id: &str) -> Option<String> {
        self.lock()
            .objects
            .get(id)
            .and_then(|o| o.kind.schema().lock_key(&o.properties))
    }

    fn next_mac(&self) -> String {
        let n = self.mac_counter.fetch_add(1, Ordering::SeqCst);
        format!("00155D{:06X}", n & 0xFF_FFFF)
    }

    async fn perform<T: Send>(
        &self,
        operation: Operation,
        kind: ResourceKind,
        target: String,
        key: Option<String>,
        apply: impl FnOnce(&mut Inner) -> Result<T> + Send,
    ) -> Result<T> {
        let key = key.filter(|_| operation.is_mutation());
        let fault = {
            let mut inner = self.lock();
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            if let Some(key) = &key {
                if inner.active_keys.contains(key) {
                    inner.overlaps.push(key.clone());
                }
                inner.active_keys.push(key.clone());
            }
            inner.take_fault(operation, kind)
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut inner = self.lock();
        let result = match fault {
            Some(error) => Err(error),
            None => apply(&mut inner),
        };
        inner.in_flight -= 1;
        if let Some(key) = &key {
            if let Some(pos) = inner.active_keys.iter().position(|k| k == key) {
                inner.active_keys.remove(pos);
            }
        }
        debug!(%operation, %kind, target = %target, ok = result.is_ok(), "hypervisor call");
        inner.calls.push(Call {
            operation,
            kind,
            target,
            ok: result.is_ok(),
        });
        result
    }
}

#[async_trait]
impl HypervisorClient for InMemoryHypervisor {
    async fn create(&self, kind: ResourceKind, properties: &Properties) -> Result<RemoteObject> {
        let schema = kind.schema();
        let target = schema.identity(properties).unwrap_or_default();
        let key = schema.lock_key(properties);
        let id = uuid::Uuid::new_v4().to_string();

        self.perform(Operation::Create, kind, target, key, move |inner| {
            inner.check_conflict(kind, properties, None)?;
            inner.check_attachments(kind, properties)?;

            let mut stored = properties.clone();
            match kind {
                ResourceKind::Machine => {
                    stored.insert("vmId".into(), Value::from(id.as_str()));
                }
                ResourceKind::Adapter => {
                    stored.insert("adapterId".into(), Value::from(id.as_str()));
                    if !stored.contains_key("macAddress") {
                        stored.insert("macAddress".into(), Value::from(self.next_mac()));
                    }
                }
                ResourceKind::Switch | ResourceKind::Disk => {}
            }
            inner.objects.insert(
                id.clone(),
                Object {
                    kind,
                    properties: stored.clone(),
                },
            );
            Ok(RemoteObject {
                id,
                properties: stored,
            })
        })
        .await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        changed: &Properties,
    ) -> Result<Properties> {
        let key = self.lock_key_of(id);
        self.perform(Operation::Update, kind, id.to_string(), key, |inner| {
            let current = inner
                .object(kind, id)
                .ok_or_else(|| HypervisorError::NotFound(id.to_string()))?;
            let mut merged = current.properties.clone();
            merged.extend(changed.iter().map(|(k, v)| (k.clone(), v.clone())));

            inner.check_conflict(kind, &merged, Some(id))?;
            inner.check_attachments(kind, &merged)?;

            if let Some(object) = inner.objects.get_mut(id) {
                object.properties = merged.clone();
            }
            Ok(merged)
        })
        .await
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()> {
        let key = self.lock_key_of(id);
        self.perform(Operation::Delete, kind, id.to_string(), key, |inner| {
            if inner.object(kind, id).is_none() {
                return Err(HypervisorError::NotFound(id.to_string()));
            }
            inner.objects.remove(id);
            Ok(())
        })
        .await
    }

    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Option<Properties>> {
        self.perform(Operation::Read, kind, id.to_string(), None, |inner| {
            Ok(inner.object(kind, id).map(|o| o.properties.clone()))
        })
        .await
    }

    async fn lookup(&self, kind: ResourceKind, identity: &str) -> Result<Option<RemoteObject>> {
        self.perform(Operation::Lookup, kind, identity.to_string(), None, |inner| {
            Ok(inner
                .find_identity(kind, identity)
                .map(|(id, o)| RemoteObject {
                    id: id.clone(),
                    properties: o.properties.clone(),
                }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn props(entries: &[(&str, Value)]) -> Properties {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn switch(name: &str) -> Properties {
        props(&[
            ("name", Value::from(name)),
            ("switchType", Value::from("Internal")),
        ])
    }

    #[tokio::test]
    async fn test_create_read_update_delete() {
        let hv = InMemoryHypervisor::new();
        let created = hv.create(ResourceKind::Switch, &switch("s1")).await.unwrap();
        assert_eq!(
            hv.read(ResourceKind::Switch, &created.id).await.unwrap(),
            Some(switch("s1"))
        );

        let updated = hv
            .update(
                ResourceKind::Switch,
                &created.id,
                &props(&[("notes", Value::from("lab"))]),
            )
            .await
            .unwrap();
        assert_eq!(updated["notes"], Value::from("lab"));
        assert_eq!(updated["name"], Value::from("s1"));

        hv.delete(ResourceKind::Switch, &created.id).await.unwrap();
        assert!(hv
            .delete(ResourceKind::Switch, &created.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(hv.read(ResourceKind::Switch, &created.id).await.unwrap(), None);
        assert_eq!(hv.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_operations_by_id_respect_kind() {
        let hv = InMemoryHypervisor::new();
        let disk = hv.seed(
            ResourceKind::Disk,
            props(&[("path", Value::from(r"C:\vhd\os.vhdx"))]),
        );

        let err = hv.delete(ResourceKind::Switch, &disk).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(hv
            .update(ResourceKind::Switch, &disk, &props(&[("notes", Value::from("x"))]))
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(hv.read(ResourceKind::Switch, &disk).await.unwrap(), None);

        assert!(hv.get(&disk).is_some());
        hv.delete(ResourceKind::Disk, &disk).await.unwrap();
        assert_eq!(hv.object_count(), 0);
    }

    #[tokio::test]
    async fn test_identity_conflict() {
        let hv = InMemoryHypervisor::new();
        hv.create(ResourceKind::Switch, &switch("s1")).await.unwrap();
        let err = hv
            .create(ResourceKind::Switch, &switch("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Conflict { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_adapter_requires_vm_and_switch() {
        let hv = InMemoryHypervisor::new();
        let nic = props(&[
            ("name", Value::from("nic0")),
            ("vmName", Value::from("web01")),
            ("switchName", Value::from("lan")),
        ]);
        let err = hv.create(ResourceKind::Adapter, &nic).await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidProperty { ref property, .. } if property == "vmName"));

        hv.seed(
            ResourceKind::Machine,
            props(&[("machineName", Value::from("web01"))]),
        );
        hv.seed(ResourceKind::Switch, switch("lan"));
        let created = hv.create(ResourceKind::Adapter, &nic).await.unwrap();
        assert_eq!(created.properties["macAddress"], Value::from("00155D000000"));
        assert_eq!(created.properties["adapterId"], Value::from(created.id.as_str()));
    }

    #[tokio::test]
    async fn test_lookup_by_identity() {
        let hv = InMemoryHypervisor::new();
        let id = hv.seed(ResourceKind::Switch, switch("s1"));
        let found = hv.lookup(ResourceKind::Switch, "s1").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(hv.lookup(ResourceKind::Disk, "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed() {
        let hv = InMemoryHypervisor::new();
        hv.fail(
            Operation::Create,
            ResourceKind::Switch,
            1,
            HypervisorError::Transport("reset".into()),
        );
        assert!(hv.create(ResourceKind::Switch, &switch("s1")).await.is_err());
        assert!(hv.create(ResourceKind::Switch, &switch("s1")).await.is_ok());
        let calls = hv.calls();
        assert!(!calls[0].ok);
        assert!(calls[1].ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlap_detection() {
        let hv = Arc::new(InMemoryHypervisor::new().with_latency(Duration::from_millis(50)));
        let machine = props(&[("machineName", Value::from("web01"))]);
        let id = hv.seed(ResourceKind::Machine, machine);

        let a = {
            let hv = hv.clone();
            let id = id.clone();
            tokio::spawn(async move {
                hv.update(
                    ResourceKind::Machine,
                    &id,
                    &props(&[("processorCount", Value::Int(2))]),
                )
                .await
            })
        };
        let b = {
            let hv = hv.clone();
            tokio::spawn(async move { hv.create(ResourceKind::Switch, &switch("s1")).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(hv.max_in_flight(), 2);
        assert!(hv.overlaps().is_empty());

        let c = {
            let hv = hv.clone();
            let id = id.clone();
            tokio::spawn(async move {
                hv.update(ResourceKind::Machine, &id, &props(&[("memorySize", Value::Int(2048))]))
                    .await
            })
        };
        hv.update(ResourceKind::Machine, &id, &props(&[("processorCount", Value::Int(4))]))
            .await
            .unwrap();
        c.await.unwrap().unwrap();
        assert_eq!(hv.overlaps(), vec!["vm:web01".to_string()]);
    }
}
