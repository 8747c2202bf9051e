//! End-to-end convergence scenarios against the in-memory hypervisor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyperv_converge::{
    Action, Change, Converger, DiffOutcome, ExecutorOptions, ExistingResourcePolicy,
    HypervisorClient, HypervisorError, InMemoryHypervisor, JsonFileStateStore, MemoryStateStore,
    ObservedState, Operation, OutputRef, Phase, PlanError, Properties, RawSpec, RemoteObject,
    ReplaceReason, ResourceError, ResourceKind, ResourceStatus, RetryPolicy, StateStore, Value,
};
use tokio::sync::watch;

const GIB: i64 = 1024 * 1024 * 1024;

fn switch(name: &str) -> RawSpec {
    RawSpec::new(ResourceKind::Switch, name)
        .with("name", name)
        .with("switchType", "Internal")
}

fn disk(name: &str, path: &str, size: i64) -> RawSpec {
    RawSpec::new(ResourceKind::Disk, name)
        .with("path", path)
        .with("sizeBytes", size)
}

fn machine(name: &str, machine_name: &str) -> RawSpec {
    RawSpec::new(ResourceKind::Machine, name).with("machineName", machine_name)
}

fn machine_with_disk(name: &str, machine_name: &str, disk: &str) -> RawSpec {
    let drive = std::collections::BTreeMap::from([(
        "path".to_string(),
        hyperv_converge::Input::from(OutputRef::new(disk, "path")),
    )]);
    machine(name, machine_name).with("hardDrives", vec![hyperv_converge::Input::from(drive)])
}

fn adapter(name: &str, vm_name: &str, switch: &str) -> RawSpec {
    RawSpec::new(ResourceKind::Adapter, name)
        .with("name", "nic0")
        .with("vmName", vm_name)
        .with("switchName", OutputRef::new(switch, "name"))
}

fn setup() -> (Arc<InMemoryHypervisor>, Arc<MemoryStateStore>) {
    (
        Arc::new(InMemoryHypervisor::new()),
        Arc::new(MemoryStateStore::new()),
    )
}

fn converger(client: &Arc<InMemoryHypervisor>, store: &Arc<MemoryStateStore>) -> Converger {
    Converger::new(client.clone(), store.clone())
}

fn position(client: &InMemoryHypervisor, operation: Operation, kind: ResourceKind) -> usize {
    client
        .calls()
        .iter()
        .position(|c| c.operation == operation && c.kind == kind)
        .unwrap()
}

#[tokio::test]
async fn test_new_switch_is_created_once() {
    let (client, store) = setup();
    let report = converger(&client, &store)
        .converge(vec![switch("s1")])
        .await
        .unwrap();

    assert!(report.is_success());
    let result = report.get("s1").unwrap();
    assert_eq!(result.action, Action::Created);
    assert_eq!(client.call_count(Operation::Create), 1);
    assert_eq!(client.object_count(), 1);

    let saved = store.load("s1").await.unwrap().unwrap();
    assert_eq!(saved.properties["switchType"], Value::from("Internal"));
    assert_eq!(saved.properties["allowManagementOs"], Value::from(false));
}

#[tokio::test]
async fn test_machine_created_after_disk() {
    let (client, store) = setup();
    let report = converger(&client, &store)
        .converge(vec![
            machine_with_disk("vm", "web01", "os"),
            disk("os", r"C:\vhd\web01.vhdx", 40 * GIB),
        ])
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(
        position(&client, Operation::Create, ResourceKind::Disk)
            < position(&client, Operation::Create, ResourceKind::Machine)
    );
    // Results stay in declaration order.
    assert_eq!(report.results[0].name, "vm");
}

#[tokio::test]
async fn test_unchanged_disk_still_gates_machine() {
    let (client, store) = setup();
    let os = disk("os", r"C:\vhd\web01.vhdx", 40 * GIB);
    converger(&client, &store)
        .converge(vec![os.clone()])
        .await
        .unwrap();
    let before = client.calls().len();

    let report = converger(&client, &store)
        .converge(vec![machine_with_disk("vm", "web01", "os"), os])
        .await
        .unwrap();

    let disk_result = report.get("os").unwrap();
    assert_eq!(disk_result.status, ResourceStatus::Converged);
    assert_eq!(
        disk_result.history,
        vec![Phase::Pending, Phase::Diffing, Phase::Skipped, Phase::Converged]
    );
    assert_eq!(report.get("vm").unwrap().action, Action::Created);

    let calls = client.calls();
    let new_calls: Vec<_> = calls[before..]
        .iter()
        .map(|c| (c.operation, c.kind))
        .collect();
    assert_eq!(
        new_calls,
        vec![
            (Operation::Lookup, ResourceKind::Machine),
            (Operation::Create, ResourceKind::Machine)
        ]
    );
    let vm = store.load("vm").await.unwrap().unwrap();
    let drives = vm.properties["hardDrives"].as_list().unwrap();
    assert_eq!(
        drives[0].as_map().unwrap()["path"],
        Value::from(r"C:\vhd\web01.vhdx")
    );
}

#[tokio::test]
async fn test_adapter_moved_to_other_vm_is_replaced() {
    let (client, store) = setup();
    let base = vec![
        machine("web01", "web01"),
        machine("web02", "web02"),
        switch("lan"),
    ];

    let mut first = base.clone();
    first.push(adapter("nic", "web01", "lan"));
    let report = converger(&client, &store).converge(first).await.unwrap();
    assert!(report.is_success());
    let old_id = report.get("nic").unwrap().observed.clone().unwrap().id;
    let before = client.calls().len();

    let mut second = base;
    second.push(adapter("nic", "web02", "lan"));
    let plan = converger(&client, &store).plan(second).await.unwrap();
    assert_eq!(
        plan.step("nic").unwrap().preview.change(),
        Some(&Change::Replace {
            reason: ReplaceReason::FieldPolicy {
                fields: vec!["vmName".to_string()]
            }
        })
    );

    let report = converger(&client, &store).apply(plan).await;
    let result = report.get("nic").unwrap();
    assert_eq!(result.status, ResourceStatus::Converged);
    assert!(matches!(result.action, Action::Replaced { .. }));
    assert_eq!(
        result.history,
        vec![
            Phase::Pending,
            Phase::Diffing,
            Phase::Deleting,
            Phase::Creating,
            Phase::Converged
        ]
    );

    let calls = client.calls();
    let ops: Vec<_> = calls[before..].iter().map(|c| c.operation).collect();
    assert_eq!(ops, vec![Operation::Delete, Operation::Create]);
    assert_eq!(calls[before].target, old_id);
    assert!(client.get(&old_id).is_none());
    assert!(client.overlaps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_independent_machines_run_concurrently() {
    let client = Arc::new(InMemoryHypervisor::new().with_latency(Duration::from_millis(50)));
    let store = Arc::new(MemoryStateStore::new());

    let report = converger(&client, &store)
        .converge(vec![machine("a", "web01"), machine("b", "web02")])
        .await
        .unwrap();

    assert_eq!(report.count(ResourceStatus::Converged), 2);
    assert_eq!(client.max_in_flight(), 2);
    assert!(client.overlaps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_is_respected() {
    let client = Arc::new(InMemoryHypervisor::new().with_latency(Duration::from_millis(50)));
    let store = Arc::new(MemoryStateStore::new());
    let options = ExecutorOptions {
        max_concurrency: 1,
        ..Default::default()
    };

    let report = Converger::new(client.clone(), store.clone())
        .with_options(options)
        .converge(vec![
            machine("a", "web01"),
            machine("b", "web02"),
            machine("c", "web03"),
        ])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(client.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_adapters_naming_vm_by_literal_and_reference_never_overlap() {
    let client = Arc::new(InMemoryHypervisor::new().with_latency(Duration::from_millis(50)));
    let store = Arc::new(MemoryStateStore::new());
    let by_ref = RawSpec::new(ResourceKind::Adapter, "nic_b")
        .with("name", "nic1")
        .with("vmName", OutputRef::new("vm", "machineName"))
        .with("switchName", OutputRef::new("lan", "name"));

    let report = converger(&client, &store)
        .converge(vec![
            switch("lan"),
            machine("vm", "web01"),
            adapter("nic_a", "web01", "lan"),
            by_ref,
        ])
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(client.overlaps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_adapters_on_external_vm_are_serialized() {
    let client = Arc::new(InMemoryHypervisor::new().with_latency(Duration::from_millis(50)));
    let store = Arc::new(MemoryStateStore::new());
    converger(&client, &store)
        .converge(vec![switch("lan"), machine("vm", "web01")])
        .await
        .unwrap();

    // `vm` comes from state, so only the resolved name ties the two together.
    let by_ref = RawSpec::new(ResourceKind::Adapter, "nic_b")
        .with("name", "nic1")
        .with("vmName", OutputRef::new("vm", "machineName"))
        .with("switchName", "lan");
    let by_name = RawSpec::new(ResourceKind::Adapter, "nic_a")
        .with("name", "nic0")
        .with("vmName", "web01")
        .with("switchName", "lan");
    let plan = converger(&client, &store)
        .plan(vec![by_name, by_ref])
        .await
        .unwrap();
    assert!(plan.graph().edges().is_empty());

    let report = converger(&client, &store).apply(plan).await;
    assert!(report.is_success());
    assert_eq!(client.call_count(Operation::Create), 4);
    assert!(client.overlaps().is_empty());
}

#[tokio::test]
async fn test_json_store_keeps_similar_names_apart() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemoryHypervisor::new());
    let specs = vec![switch("a b"), disk("a_b", r"C:\vhd\ab.vhdx", 8 * GIB)];

    for _ in 0..2 {
        let store = Arc::new(JsonFileStateStore::new(dir.path()));
        let report = Converger::new(client.clone(), store.clone())
            .converge(specs.clone())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(store.load("a b").await.unwrap().unwrap().kind, ResourceKind::Switch);
        assert_eq!(store.load("a_b").await.unwrap().unwrap().kind, ResourceKind::Disk);
    }
    assert_eq!(client.object_count(), 2);
    assert_eq!(client.call_count(Operation::Delete), 0);
}

#[tokio::test]
async fn test_disk_failure_blocks_machine_only() {
    let (client, store) = setup();
    client.fail(
        Operation::Create,
        ResourceKind::Disk,
        1,
        HypervisorError::InvalidProperty {
            property: "path".into(),
            message: "directory does not exist".into(),
        },
    );

    let report = converger(&client, &store)
        .converge(vec![
            disk("os", r"D:\missing\os.vhdx", 20 * GIB),
            machine_with_disk("vm", "web01", "os"),
            switch("lan"),
        ])
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.status("os"), Some(ResourceStatus::Failed));
    assert_eq!(report.status("lan"), Some(ResourceStatus::Converged));

    let vm = report.get("vm").unwrap();
    assert_eq!(vm.status, ResourceStatus::Blocked);
    assert_eq!(vm.blocked_by.as_deref(), Some("os"));
    assert_eq!(vm.attempts, 0);
    assert!(client.calls().iter().all(|c| c.kind != ResourceKind::Machine));

    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "os");
    assert!(matches!(errors[0].1, ResourceError::Permanent { .. }));
}

#[tokio::test]
async fn test_no_change_plan_makes_no_calls() {
    let (client, store) = setup();
    let specs = vec![
        switch("lan"),
        disk("os", r"C:\vhd\os.vhdx", 10 * GIB),
        machine_with_disk("vm", "web01", "os"),
        adapter("nic", "web01", "lan"),
    ];
    let first = converger(&client, &store)
        .converge(specs.clone())
        .await
        .unwrap();
    assert!(first.is_success());
    let before = client.calls().len();

    let plan = converger(&client, &store).plan(specs).await.unwrap();
    assert!(plan.is_no_op());
    let report = converger(&client, &store).apply(plan).await;
    assert!(report.is_success());
    assert!(report.results.iter().all(|r| r.action == Action::None));
    assert_eq!(client.calls().len(), before);
}

#[tokio::test]
async fn test_disk_grows_in_place_and_shrink_replaces() {
    let (client, store) = setup();
    let path = r"C:\vhd\data.vhdx";
    converger(&client, &store)
        .converge(vec![disk("data", path, 10 * GIB)])
        .await
        .unwrap();

    let report = converger(&client, &store)
        .converge(vec![disk("data", path, 20 * GIB)])
        .await
        .unwrap();
    assert_eq!(
        report.get("data").unwrap().action,
        Action::Updated {
            changed_fields: vec!["sizeBytes".to_string()]
        }
    );

    let report = converger(&client, &store)
        .converge(vec![disk("data", path, 5 * GIB)])
        .await
        .unwrap();
    assert_eq!(
        report.get("data").unwrap().action,
        Action::Replaced {
            reason: ReplaceReason::FieldPolicy {
                fields: vec!["sizeBytes".to_string()]
            }
        }
    );
    assert_eq!(client.object_count(), 1);
}

#[tokio::test]
async fn test_trigger_change_forces_replace() {
    let (client, store) = setup();
    converger(&client, &store)
        .converge(vec![switch("lan").trigger("v1")])
        .await
        .unwrap();

    let report = converger(&client, &store)
        .converge(vec![switch("lan").trigger("v2")])
        .await
        .unwrap();
    assert_eq!(
        report.get("lan").unwrap().action,
        Action::Replaced {
            reason: ReplaceReason::TriggerChanged
        }
    );
    let saved = store.load("lan").await.unwrap().unwrap();
    assert_eq!(saved.triggers, vec![Value::from("v2")]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let (client, store) = setup();
    client.fail(
        Operation::Create,
        ResourceKind::Switch,
        2,
        HypervisorError::Transport("connection reset".into()),
    );

    let report = converger(&client, &store)
        .converge(vec![switch("lan")])
        .await
        .unwrap();

    let result = report.get("lan").unwrap();
    assert_eq!(result.status, ResourceStatus::Converged);
    // one lookup, three creates
    assert_eq!(result.attempts, 4);
    assert_eq!(client.call_count(Operation::Create), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fails_resource() {
    let (client, store) = setup();
    client.fail(
        Operation::Create,
        ResourceKind::Switch,
        10,
        HypervisorError::from_return_code("DefineSystem", 32774),
    );
    let options = ExecutorOptions {
        retry: RetryPolicy::default().with_max_attempts(3),
        ..Default::default()
    };

    let report = Converger::new(client.clone(), store.clone())
        .with_options(options)
        .converge(vec![switch("lan")])
        .await
        .unwrap();

    let result = report.get("lan").unwrap();
    assert_eq!(result.status, ResourceStatus::Failed);
    assert_eq!(result.last_operation, Some(Operation::Create));
    assert!(matches!(
        result.error,
        Some(ResourceError::RetriesExhausted { attempts: 3, .. })
    ));
    assert!(store.load("lan").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_dispatch() {
    let client = Arc::new(InMemoryHypervisor::new().with_latency(Duration::from_millis(100)));
    let store = Arc::new(MemoryStateStore::new());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = cancel_tx.send(true);
    });

    let report = converger(&client, &store)
        .converge_with_cancel(
            vec![switch("lan"), machine("vm", "web01").depends_on("lan")],
            cancel_rx,
        )
        .await
        .unwrap();

    assert!(report.cancelled);
    // The create in flight when cancellation arrived completes.
    assert_eq!(report.status("lan"), Some(ResourceStatus::Converged));
    assert_eq!(report.status("vm"), Some(ResourceStatus::Cancelled));
    assert!(client.calls().iter().all(|c| c.kind == ResourceKind::Switch));
    assert!(store.load("lan").await.unwrap().is_some());
}

#[tokio::test]
async fn test_cycle_rejected_before_any_call() {
    let (client, store) = setup();
    let err = converger(&client, &store)
        .converge(vec![
            switch("a").depends_on("b"),
            switch("b").depends_on("c"),
            switch("c").depends_on("a"),
        ])
        .await
        .unwrap_err();

    match err {
        PlanError::Cycle(cycle) => {
            assert_eq!(cycle.path.first(), cycle.path.last());
            assert_eq!(cycle.path.len(), 4);
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn test_validation_error_rejected_before_any_call() {
    let (client, store) = setup();
    let err = converger(&client, &store)
        .converge(vec![
            switch("lan"),
            RawSpec::new(ResourceKind::Switch, "bad")
                .with("name", "bad")
                .with("switchType", "Bridged"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, PlanError::Validation(_)));
    assert!(client.calls().is_empty());
}

fn seeded_switch(client: &InMemoryHypervisor) -> String {
    client.seed(
        ResourceKind::Switch,
        Properties::from([
            ("name".to_string(), Value::from("lan")),
            ("switchType".to_string(), Value::from("Internal")),
            ("allowManagementOs".to_string(), Value::from(false)),
        ]),
    )
}

#[tokio::test]
async fn test_existing_object_is_adopted() {
    let (client, store) = setup();
    let id = seeded_switch(&client);

    let report = converger(&client, &store)
        .converge(vec![switch("lan")])
        .await
        .unwrap();

    let result = report.get("lan").unwrap();
    assert_eq!(result.action, Action::Adopted);
    assert_eq!(client.call_count(Operation::Create), 0);
    assert_eq!(store.load("lan").await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn test_existing_object_is_replaced_when_configured() {
    let (client, store) = setup();
    let id = seeded_switch(&client);
    let options = ExecutorOptions {
        existing_resources: ExistingResourcePolicy::Replace,
        ..Default::default()
    };

    let report = Converger::new(client.clone(), store.clone())
        .with_options(options)
        .converge(vec![switch("lan")])
        .await
        .unwrap();

    let result = report.get("lan").unwrap();
    assert_eq!(
        result.action,
        Action::Replaced {
            reason: ReplaceReason::Unmanaged
        }
    );
    assert!(client.get(&id).is_none());
    assert_eq!(client.object_count(), 1);
    assert_ne!(store.load("lan").await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn test_json_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemoryHypervisor::new());
    let specs = vec![switch("lan"), disk("os", r"C:\vhd\os.vhdx", 8 * GIB)];

    let store = Arc::new(JsonFileStateStore::new(dir.path()));
    let report = Converger::new(client.clone(), store)
        .converge(specs.clone())
        .await
        .unwrap();
    assert!(report.is_success());
    let before = client.calls().len();

    let reopened = Arc::new(JsonFileStateStore::new(dir.path()));
    let converger = Converger::new(client.clone(), reopened);
    let plan = converger.plan(specs).await.unwrap();
    assert!(plan.is_no_op());
    converger.apply(plan).await;
    assert_eq!(client.calls().len(), before);
}

#[tokio::test]
async fn test_external_reference_resolves_from_store() {
    let (client, store) = setup();
    converger(&client, &store)
        .converge(vec![switch("lan"), machine("vm", "web01")])
        .await
        .unwrap();

    // Only the adapter is in this run; both producers come from state.
    let nic = RawSpec::new(ResourceKind::Adapter, "nic")
        .with("name", "nic0")
        .with("vmName", OutputRef::new("vm", "machineName"))
        .with("switchName", OutputRef::new("lan", "name"));
    let plan = converger(&client, &store).plan(vec![nic]).await.unwrap();
    assert!(matches!(plan.step("nic").unwrap().preview, DiffOutcome::Ready(_)));

    let report = converger(&client, &store).apply(plan).await;
    assert!(report.is_success());
    let saved: ObservedState = store.load("nic").await.unwrap().unwrap();
    assert_eq!(saved.properties["vmName"], Value::from("web01"));
    assert!(saved.properties["macAddress"].as_str().unwrap().starts_with("00155D"));
}

/// Client whose disk creation panics.
struct PanicOnDisk(InMemoryHypervisor);

#[async_trait]
impl HypervisorClient for PanicOnDisk {
    async fn create(
        &self,
        kind: ResourceKind,
        properties: &Properties,
    ) -> hyperv_converge::Result<RemoteObject> {
        if kind == ResourceKind::Disk {
            panic!("storage driver crashed");
        }
        self.0.create(kind, properties).await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        changed: &Properties,
    ) -> hyperv_converge::Result<Properties> {
        self.0.update(kind, id, changed).await
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> hyperv_converge::Result<()> {
        self.0.delete(kind, id).await
    }

    async fn read(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> hyperv_converge::Result<Option<Properties>> {
        self.0.read(kind, id).await
    }

    async fn lookup(
        &self,
        kind: ResourceKind,
        identity: &str,
    ) -> hyperv_converge::Result<Option<RemoteObject>> {
        self.0.lookup(kind, identity).await
    }
}

#[tokio::test]
async fn test_worker_panic_is_contained() {
    let client = Arc::new(PanicOnDisk(InMemoryHypervisor::new()));
    let store = Arc::new(MemoryStateStore::new());

    let report = Converger::new(client.clone(), store)
        .converge(vec![
            switch("lan"),
            disk("os", r"C:\vhd\os.vhdx", 8 * GIB),
            machine_with_disk("vm", "web01", "os"),
        ])
        .await
        .unwrap();

    assert_eq!(report.status("lan"), Some(ResourceStatus::Converged));
    let os = report.get("os").unwrap();
    assert_eq!(os.status, ResourceStatus::Failed);
    assert!(matches!(os.error, Some(ResourceError::Aborted(_))));
    assert_eq!(report.status("vm"), Some(ResourceStatus::Blocked));
}
