//! End-to-end reconciliation tests against an in-memory scripted provider.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use cairn_reconcile::config::ConfigHasher;
use cairn_reconcile::engine::{Engine, RunOutcome};
use cairn_reconcile::error::{
    CairnError, ExecuteError, GraphError, PlanError, ProviderError, StateError,
};
use cairn_reconcile::executor::{
    ExecutionReport, Executor, ExecutorOptions, OperationStatus, RetryPolicy, RunStatus,
};
use cairn_reconcile::graph::{Declaration, ResourceGraph, ResourceId, build_graph};
use cairn_reconcile::planner::{OperationKind, Plan, PlanMode, Planner};
use cairn_reconcile::provider::{Provider, ProviderOutput, ProvisionRequest};
use cairn_reconcile::state::{
    JournalEntry, MemoryStateStore, StateRecord, StateSnapshot, StateStore,
};

// ============================================================================
// Scripted provider
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Apply(ResourceId, BTreeMap<String, Value>),
    Delete(ResourceId, String),
}

/// Provider whose behaviour is scripted per resource name.
#[derive(Default)]
struct ScriptedProvider {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    outputs: HashMap<String, BTreeMap<String, Value>>,
    cancel_after: Option<(String, watch::Sender<bool>)>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self::default()
    }

    /// Makes the next calls for `name` fail with `errors`, in order.
    fn failing(self, name: &str, errors: Vec<ProviderError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), errors.into());
        self
    }

    /// Adds a computed output returned for `name`.
    fn with_output(mut self, name: &str, key: &str, value: Value) -> Self {
        self.outputs
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self
    }

    /// Requests cancellation while applying `name`.
    fn cancelling_on(mut self, name: &str, cancel: watch::Sender<bool>) -> Self {
        self.cancel_after = Some((name.to_string(), cancel));
        self
    }

    /// Makes every apply take `delay`.
    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Most applies observed in flight at once.
    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn next_failure(&self, name: &str) -> Option<ProviderError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn create_or_update(&self, request: &ProvisionRequest) -> Result<ProviderOutput, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Apply(request.id.clone(), request.attributes.clone()));

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.next_failure(&request.id.name) {
            return Err(error);
        }
        if let Some((name, cancel)) = &self.cancel_after
            && name == &request.id.name
        {
            cancel.send(true).unwrap();
        }

        let external_id = request
            .external_id
            .clone()
            .unwrap_or_else(|| format!("/{}/{}", request.id.resource_type, request.id.name));
        Ok(ProviderOutput {
            external_id,
            attributes: self.outputs.get(&request.id.name).cloned().unwrap_or_default(),
        })
    }

    async fn delete(&self, id: &ResourceId, external_id: &str) -> Result<(), ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Delete(id.clone(), external_id.to_string()));
        match self.next_failure(&id.name) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn options() -> ExecutorOptions {
    ExecutorOptions {
        parallelism: 4,
        retry: RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        timeout: None,
    }
}

fn id(resource_type: &str, name: &str) -> ResourceId {
    ResourceId::new(resource_type, name)
}

/// Resource group, plan referencing it, app referencing both.
fn webshop(mode: &str) -> Vec<Declaration> {
    vec![
        Declaration::new("resource-group", "main")
            .with_attribute("name", "rg-webshop")
            .with_attribute("location", "westeurope"),
        Declaration::new("app-service-plan", "main")
            .with_attribute("resource_group", "${resource-group.main.name}")
            .with_attribute("sku", "B1"),
        Declaration::new("web-app", "api")
            .with_attribute("plan_id", "${app-service-plan.main.id}")
            .with_attribute("location", "${resource-group.main.location}")
            .with_attribute("app_settings", json!({ "MODE": mode })),
    ]
}

/// `count` resources with no references between them.
fn roots(count: usize) -> Vec<Declaration> {
    (0..count)
        .map(|i| Declaration::new("svc", format!("r{i}")).with_attribute("size", i))
        .collect()
}

/// A -> B -> C, each waiting on the previous one.
fn chain() -> Vec<Declaration> {
    vec![
        Declaration::new("svc", "a").with_attribute("size", 1),
        Declaration::new("svc", "b").with_attribute("parent", "${svc.a.id}"),
        Declaration::new("svc", "c").with_attribute("parent", "${svc.b.id}"),
    ]
}

fn graph(declarations: &[Declaration]) -> ResourceGraph {
    build_graph(declarations).unwrap()
}

async fn plan(declarations: &[Declaration], store: &MemoryStateStore, mode: PlanMode) -> Plan {
    let snapshot = store.load().await.unwrap();
    Planner::new().plan(&graph(declarations), &snapshot, mode).unwrap()
}

async fn execute(store: &MemoryStateStore, provider: Arc<ScriptedProvider>, plan: &Plan) -> ExecutionReport {
    Executor::new(store, provider, options()).execute(plan).await
}

async fn apply(declarations: &[Declaration], store: &MemoryStateStore) -> ExecutionReport {
    let plan = plan(declarations, store, PlanMode::Apply).await;
    execute(store, Arc::new(ScriptedProvider::new()), &plan).await
}

// ============================================================================
// Graph
// ============================================================================

#[test]
fn test_topological_order_respects_every_edge() {
    let g = graph(&webshop("prod"));
    let order = g.topological_order().unwrap();
    let position: HashMap<usize, usize> = order.iter().enumerate().map(|(p, &i)| (i, p)).collect();

    for (index, _) in g.resources().iter().enumerate() {
        for &dep in g.dependencies(index) {
            assert!(position[&dep] < position[&index]);
        }
    }
}

#[test]
fn test_cycle_names_every_member() {
    let declarations = vec![
        Declaration::new("svc", "a").with_attribute("x", "${svc.c.id}"),
        Declaration::new("svc", "b").with_attribute("x", "${svc.a.id}"),
        Declaration::new("svc", "c").with_attribute("x", "${svc.b.id}"),
    ];
    match build_graph(&declarations) {
        Err(GraphError::CyclicDependency { cycle }) => {
            for member in ["svc.a", "svc.b", "svc.c"] {
                assert!(cycle.iter().any(|c| c == member), "{member} missing from {cycle:?}");
            }
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

// ============================================================================
// Apply
// ============================================================================

#[tokio::test]
async fn test_webshop_scenario() {
    let store = MemoryStateStore::new();

    let first = plan(&webshop("prod"), &store, PlanMode::Apply).await;
    assert_eq!(
        first.kinds(),
        vec![OperationKind::Create, OperationKind::Create, OperationKind::Create]
    );
    assert_eq!(
        first.operations.iter().map(|op| op.id.to_string()).collect::<Vec<_>>(),
        vec!["resource-group.main", "app-service-plan.main", "web-app.api"]
    );

    let report = execute(&store, Arc::new(ScriptedProvider::new()), &first).await;
    assert_eq!(report.status, RunStatus::Success);

    let again = plan(&webshop("prod"), &store, PlanMode::Apply).await;
    assert_eq!(again.kinds(), vec![OperationKind::NoOp; 3]);
    assert!(again.is_empty());

    let changed = plan(&webshop("staging"), &store, PlanMode::Apply).await;
    assert_eq!(
        changed.kinds(),
        vec![OperationKind::NoOp, OperationKind::NoOp, OperationKind::Update]
    );
    let update = &changed.operations[2];
    assert_eq!(update.changes.len(), 1);
    assert_eq!(update.changes[0].attribute, "app_settings");
    assert_eq!(update.changes[0].new, Some(json!({ "MODE": "staging" })));

    let provider = Arc::new(ScriptedProvider::new());
    let report = execute(&store, Arc::clone(&provider), &changed).await;
    assert!(report.is_success());
    assert_eq!(provider.calls().len(), 1);
    match &provider.calls()[0] {
        Call::Apply(target, _) => assert_eq!(target, &id("web-app", "api")),
        Call::Delete(..) => panic!("unexpected delete"),
    }
}

#[tokio::test]
async fn test_stored_hash_matches_plan_and_content() {
    let store = MemoryStateStore::new();
    let planned = plan(&webshop("prod"), &store, PlanMode::Apply).await;
    execute(&store, Arc::new(ScriptedProvider::new()), &planned).await;

    let hasher = ConfigHasher::new();
    for op in &planned.operations {
        let record = store.get(&op.id).await.unwrap().unwrap();
        assert_eq!(
            record.content_hash,
            hasher.hash_resource(&op.id.resource_type, &record.attributes)
        );
        if let Some(planned_hash) = &op.planned_hash {
            assert_eq!(&record.content_hash, planned_hash);
        }
    }
}

#[tokio::test]
async fn test_deferred_external_id_reaches_dependent() {
    let store = MemoryStateStore::new();
    let planned = plan(&webshop("prod"), &store, PlanMode::Apply).await;
    assert!(planned.operations[2].has_deferred());

    let provider = Arc::new(ScriptedProvider::new());
    execute(&store, Arc::clone(&provider), &planned).await;

    let app_call = provider
        .calls()
        .into_iter()
        .find_map(|call| match call {
            Call::Apply(target, attrs) if target.name == "api" => Some(attrs),
            _ => None,
        })
        .unwrap();
    assert_eq!(app_call["plan_id"], json!("/app-service-plan/main"));
    assert_eq!(app_call["location"], json!("westeurope"));
}

#[tokio::test]
async fn test_computed_output_interpolated_at_execution() {
    let declarations = vec![
        Declaration::new("storage-account", "logs")
            .with_attribute("tier", "Standard")
            .with_output("endpoint"),
        Declaration::new("sql-auditing-policy", "orders")
            .with_attribute("target", "${storage-account.logs.endpoint}audit"),
    ];
    let store = MemoryStateStore::new();
    let planned = plan(&declarations, &store, PlanMode::Apply).await;

    let provider = Arc::new(
        ScriptedProvider::new().with_output("logs", "endpoint", json!("https://logs.example.net/")),
    );
    let report = execute(&store, provider, &planned).await;
    assert!(report.is_success());

    let policy = store.get(&id("sql-auditing-policy", "orders")).await.unwrap().unwrap();
    assert_eq!(policy.attributes["target"], json!("https://logs.example.net/audit"));

    // Unchanged outputs resolve from state on the next plan
    let again = plan(&declarations, &store, PlanMode::Apply).await;
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_failure_is_contained_to_dependents() {
    let mut declarations = chain();
    declarations.push(Declaration::new("svc", "solo").with_attribute("size", 2));

    let store = MemoryStateStore::new();
    let planned = plan(&declarations, &store, PlanMode::Apply).await;
    let provider = Arc::new(
        ScriptedProvider::new().failing("b", vec![ProviderError::permanent("quota exceeded")]),
    );
    let report = execute(&store, Arc::clone(&provider), &planned).await;

    assert_eq!(report.status, RunStatus::PartialFailure);
    let status = |name: &str| report.outcome(&id("svc", name)).map(|o| o.status);
    assert_eq!(status("a"), Some(OperationStatus::Succeeded));
    assert_eq!(status("b"), Some(OperationStatus::Failed));
    assert_eq!(status("c"), Some(OperationStatus::Skipped));
    assert_eq!(status("solo"), Some(OperationStatus::Succeeded));
    assert_eq!(report.outcome(&id("svc", "b")).map(|o| o.attempts), Some(1));

    let snapshot = store.load().await.unwrap();
    assert!(snapshot.contains(&id("svc", "a")));
    assert!(!snapshot.contains(&id("svc", "b")));
    assert!(!snapshot.contains(&id("svc", "c")));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = MemoryStateStore::new();
    let planned = plan(&chain(), &store, PlanMode::Apply).await;
    let provider = Arc::new(ScriptedProvider::new().failing(
        "b",
        vec![
            ProviderError::transient("throttled"),
            ProviderError::Transient {
                message: String::from("busy"),
                retry_after_secs: Some(0),
            },
        ],
    ));
    let report = execute(&store, Arc::clone(&provider), &planned).await;

    assert!(report.is_success());
    assert_eq!(report.outcome(&id("svc", "b")).map(|o| o.attempts), Some(3));
    assert_eq!(provider.calls().len(), 5);
}

#[tokio::test]
async fn test_exhausted_retries_fail() {
    let store = MemoryStateStore::new();
    let planned = plan(&chain(), &store, PlanMode::Apply).await;
    let provider = Arc::new(
        ScriptedProvider::new().failing("a", vec![ProviderError::transient("down"); 10]),
    );
    let report = execute(&store, provider, &planned).await;

    assert_eq!(
        report.statuses(),
        vec![OperationStatus::Failed, OperationStatus::Skipped, OperationStatus::Skipped]
    );
    assert_eq!(report.outcomes[0].attempts, 4);
}

#[tokio::test]
async fn test_commit_precedes_dependent_dispatch() {
    let store = MemoryStateStore::new();
    apply(&chain(), &store).await;

    assert_eq!(
        store.journal().await,
        vec![
            JournalEntry::Commit(id("svc", "a")),
            JournalEntry::Commit(id("svc", "b")),
            JournalEntry::Commit(id("svc", "c")),
        ]
    );
}

#[tokio::test]
async fn test_orphaned_record_is_reported() {
    let store = MemoryStateStore::new();
    apply(&chain(), &store).await;

    let trimmed: Vec<Declaration> = chain().into_iter().take(2).collect();
    let snapshot = store.load().await.unwrap();
    let err = Planner::new()
        .plan(&graph(&trimmed), &snapshot, PlanMode::Apply)
        .unwrap_err();
    assert_eq!(
        err,
        PlanError::InconsistentState {
            orphans: vec![String::from("svc.c")]
        }
    );

    // Forgetting the record resolves it
    store.remove(&id("svc", "c")).await.unwrap();
    let snapshot = store.load().await.unwrap();
    let replanned = Planner::new()
        .plan(&graph(&trimmed), &snapshot, PlanMode::Apply)
        .unwrap();
    assert!(replanned.is_empty());
}

#[tokio::test]
async fn test_cancellation_stops_scheduling() {
    let (tx, rx) = watch::channel(false);
    let store = MemoryStateStore::new();
    let planned = plan(&chain(), &store, PlanMode::Apply).await;
    let provider = Arc::new(ScriptedProvider::new().cancelling_on("a", tx));

    let report = Executor::new(&store, provider, options())
        .with_cancellation(rx)
        .execute(&planned)
        .await;

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(
        report.statuses(),
        vec![
            OperationStatus::Succeeded,
            OperationStatus::Cancelled,
            OperationStatus::Cancelled
        ]
    );
    // The in-flight operation still committed
    assert!(store.get(&id("svc", "a")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_run_timeout_lets_in_flight_work_finish() {
    let store = MemoryStateStore::new();
    let planned = plan(&chain(), &store, PlanMode::Apply).await;
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(200)));

    let report = Executor::new(
        &store,
        Arc::clone(&provider) as Arc<dyn Provider>,
        ExecutorOptions {
            timeout: Some(Duration::from_millis(50)),
            ..options()
        },
    )
    .execute(&planned)
    .await;

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(
        report.statuses(),
        vec![
            OperationStatus::Succeeded,
            OperationStatus::Cancelled,
            OperationStatus::Cancelled
        ]
    );
    assert_eq!(provider.calls().len(), 1);
    assert!(store.get(&id("svc", "a")).await.unwrap().is_some());
    assert!(store.get(&id("svc", "b")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_independent_roots_overlap_up_to_parallelism() {
    let store = MemoryStateStore::new();
    let planned = plan(&roots(5), &store, PlanMode::Apply).await;
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(50)));

    let report = Executor::new(
        &store,
        Arc::clone(&provider) as Arc<dyn Provider>,
        ExecutorOptions {
            parallelism: 2,
            ..options()
        },
    )
    .execute(&planned)
    .await;

    assert!(report.is_success());
    assert_eq!(provider.calls().len(), 5);
    assert_eq!(provider.peak(), 2);
}

#[tokio::test]
async fn test_dependent_chain_never_overlaps() {
    let store = MemoryStateStore::new();
    let planned = plan(&chain(), &store, PlanMode::Apply).await;
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(20)));

    let report = execute(&store, Arc::clone(&provider), &planned).await;

    assert!(report.is_success());
    assert_eq!(provider.peak(), 1);
}

#[tokio::test]
async fn test_single_worker_follows_plan_order() {
    let store = MemoryStateStore::new();
    let planned = plan(&webshop("prod"), &store, PlanMode::Apply).await;
    let provider = Arc::new(ScriptedProvider::new());
    let report = Executor::new(
        &store,
        Arc::clone(&provider) as Arc<dyn Provider>,
        ExecutorOptions {
            parallelism: 1,
            ..options()
        },
    )
    .execute(&planned)
    .await;

    assert!(report.is_success());
    let order: Vec<ResourceId> = provider
        .calls()
        .into_iter()
        .map(|call| match call {
            Call::Apply(target, _) | Call::Delete(target, _) => target,
        })
        .collect();
    assert_eq!(
        order,
        planned.operations.iter().map(|op| op.id.clone()).collect::<Vec<_>>()
    );
}

// ============================================================================
// Destroy
// ============================================================================

#[tokio::test]
async fn test_destroy_deletes_dependents_first() {
    let store = MemoryStateStore::new();
    apply(&chain(), &store).await;

    let planned = plan(&chain(), &store, PlanMode::Destroy).await;
    assert_eq!(planned.kinds(), vec![OperationKind::Delete; 3]);
    assert_eq!(
        planned.operations.iter().map(|op| op.id.name.as_str()).collect::<Vec<_>>(),
        vec!["c", "b", "a"]
    );

    let provider = Arc::new(ScriptedProvider::new());
    let report = execute(&store, Arc::clone(&provider), &planned).await;
    assert!(report.is_success());
    assert_eq!(
        provider.calls(),
        vec![
            Call::Delete(id("svc", "c"), String::from("/svc/c")),
            Call::Delete(id("svc", "b"), String::from("/svc/b")),
            Call::Delete(id("svc", "a"), String::from("/svc/a")),
        ]
    );
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_delete_keeps_dependencies() {
    let store = MemoryStateStore::new();
    apply(&chain(), &store).await;

    let planned = plan(&chain(), &store, PlanMode::Destroy).await;
    let provider = Arc::new(
        ScriptedProvider::new().failing("c", vec![ProviderError::permanent("locked resource")]),
    );
    let report = execute(&store, provider, &planned).await;

    assert_eq!(
        report.statuses(),
        vec![OperationStatus::Failed, OperationStatus::Skipped, OperationStatus::Skipped]
    );
    assert_eq!(store.load().await.unwrap().len(), 3);
}

// ============================================================================
// Engine
// ============================================================================

#[tokio::test]
async fn test_engine_runs_and_releases_lock() {
    let store = MemoryStateStore::new();
    let g = graph(&webshop("prod"));
    let engine = Engine::new(&store, Arc::new(ScriptedProvider::new()), options());

    let outcome = engine.run(&g, PlanMode::Apply, |_| true).await.unwrap();
    assert!(outcome.report().is_some_and(ExecutionReport::is_success));
    assert!(!store.is_locked().await.unwrap());

    let destroyed = engine.run(&g, PlanMode::Destroy, |_| true).await.unwrap();
    assert!(matches!(destroyed, RunOutcome::Executed { .. }));
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_engine_declined_plan_changes_nothing() {
    let store = MemoryStateStore::new();
    let provider = Arc::new(ScriptedProvider::new());
    let engine = Engine::new(&store, Arc::clone(&provider) as Arc<dyn Provider>, options());

    let outcome = engine
        .run(&graph(&chain()), PlanMode::Apply, |plan| {
            assert_eq!(plan.summary().create, 3);
            false
        })
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Declined(_)));
    assert!(provider.calls().is_empty());
    assert!(store.load().await.unwrap().is_empty());
    assert!(!store.is_locked().await.unwrap());
}

#[tokio::test]
async fn test_engine_refuses_when_locked() {
    let store = MemoryStateStore::new();
    store.acquire_lock("someone-else", "apply").await.unwrap();

    let engine = Engine::new(&store, Arc::new(ScriptedProvider::new()), options());
    let err = engine
        .run(&graph(&chain()), PlanMode::Apply, |_| true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CairnError::State(StateError::LockedByOther { ref holder, .. }) if holder == "someone-else"
    ));
}

#[tokio::test]
async fn test_engine_converged_run_skips_confirmation() {
    let record = |name: &str, attrs: Value| {
        let attributes: BTreeMap<String, Value> = serde_json::from_value(attrs).unwrap();
        let hash = ConfigHasher::new().hash_resource("svc", &attributes);
        StateRecord::new(id("svc", name), attributes, format!("/svc/{name}"), BTreeMap::new(), hash)
    };
    let store = MemoryStateStore::with_snapshot(StateSnapshot::from_records([
        record("a", json!({ "size": 1 })),
        record("b", json!({ "parent": "/svc/a" })),
        record("c", json!({ "parent": "/svc/b" })),
    ]));

    let engine = Engine::new(&store, Arc::new(ScriptedProvider::new()), options());
    let outcome = engine
        .run(&graph(&chain()), PlanMode::Apply, |_| panic!("nothing to confirm"))
        .await
        .unwrap();

    assert!(outcome.plan().is_empty());
    assert_eq!(outcome.report().map(|r| r.status), Some(RunStatus::Success));
    assert!(store.journal().await.is_empty());
}

#[tokio::test]
async fn test_engine_aborts_when_already_cancelled() {
    let store = MemoryStateStore::new();
    let (_tx, rx) = watch::channel(true);
    let engine =
        Engine::new(&store, Arc::new(ScriptedProvider::new()), options()).with_cancellation(rx);

    let err = engine
        .run(&graph(&chain()), PlanMode::Apply, |_| true)
        .await
        .unwrap_err();
    assert!(matches!(err, CairnError::Execute(ExecuteError::Aborted { .. })));
    assert!(!store.is_locked().await.unwrap());
}

#[tokio::test]
async fn test_engine_keeps_lock_through_long_run() {
    let store = MemoryStateStore::new();
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(150)));
    let engine = Engine::new(&store, provider, options())
        .with_holder("long-run")
        .with_lock_renewal(Duration::from_millis(20));
    let g = graph(&chain());

    // The lock runs out mid-run; renewal must win before anyone else asks
    let intruder = async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        store.expire_lock().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.acquire_lock("intruder", "apply").await
    };
    let (outcome, intrusion) = tokio::join!(engine.run(&g, PlanMode::Apply, |_| true), intruder);

    assert!(matches!(
        intrusion,
        Err(CairnError::State(StateError::LockedByOther { ref holder, .. })) if holder == "long-run"
    ));
    assert!(outcome.unwrap().report().is_some_and(ExecutionReport::is_success));
    assert!(!store.is_locked().await.unwrap());
}

#[tokio::test]
async fn test_engine_stops_when_lock_is_taken_over() {
    let store = MemoryStateStore::new();
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(200)));
    let engine = Engine::new(&store, Arc::clone(&provider) as Arc<dyn Provider>, options())
        .with_lock_renewal(Duration::from_millis(20));
    let g = graph(&chain());

    let takeover = async {
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.force_unlock().await.unwrap();
        store.acquire_lock("intruder", "apply").await.unwrap()
    };
    let (outcome, _) = tokio::join!(engine.run(&g, PlanMode::Apply, |_| true), takeover);

    let outcome = outcome.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(
        report.statuses(),
        vec![
            OperationStatus::Succeeded,
            OperationStatus::Cancelled,
            OperationStatus::Cancelled
        ]
    );
    assert_eq!(provider.calls().len(), 1);
    // The other holder's lock survives the first run's release
    let lock = store.get_lock_info().await.unwrap().unwrap();
    assert_eq!(lock.holder, "intruder");
}
