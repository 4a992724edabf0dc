//! Plan execution.
//!
//! A single coordinator owns every operation status and is the only writer
//! to the state store. Provider calls run on a bounded pool of tasks. An
//! operation is dispatched once everything it waits on has succeeded, and its
//! record is committed before any of its dependents becomes ready.

mod report;
mod retry;

pub use report::{ExecutionReport, OperationOutcome, OperationStatus, RunStatus, StateDelta};
pub use retry::RetryPolicy;

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::{Id as TaskId, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ExecutionConfig};
use crate::error::ProviderError;
use crate::graph::{AttributeValue, Reference, ResourceId, template};
use crate::planner::{Operation, OperationKind, Plan};
use crate::provider::{Provider, ProviderOutput, ProvisionRequest};
use crate::state::{StateRecord, StateStore};

/// Executor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum number of provider calls in flight.
    pub parallelism: usize,
    /// Retry policy for transient provider failures.
    pub retry: RetryPolicy,
    /// Stop scheduling once this much time has passed.
    pub timeout: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl ExecutorOptions {
    /// Builds options from execution settings.
    #[must_use]
    pub const fn from_config(config: &ExecutionConfig) -> Self {
        let timeout = match config.timeout_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };
        Self {
            parallelism: config.parallelism,
            retry: RetryPolicy::from_config(config),
            timeout,
        }
    }
}

/// Executes plans against a provider and a state store.
pub struct Executor<'a, S: StateStore + ?Sized> {
    store: &'a S,
    provider: Arc<dyn Provider>,
    options: ExecutorOptions,
    cancel: Option<watch::Receiver<bool>>,
    hasher: ConfigHasher,
}

/// Provider work handed to a worker task.
enum Work {
    Apply(ProvisionRequest),
    Delete { id: ResourceId, external_id: String },
}

/// What a worker task reports back.
struct Completion {
    index: usize,
    attempts: u32,
    elapsed: Duration,
    result: Result<Option<ProviderOutput>, ProviderError>,
    /// Retries were left when the run stopped.
    abandoned: bool,
}

/// Attributes resolved for an in-flight create or update.
struct Prepared {
    attributes: BTreeMap<String, Value>,
    hash: String,
}

enum Step {
    /// Nothing to send; the recorded state already matches.
    Unchanged,
    /// Call the provider.
    Call(Work, Option<Prepared>),
}

enum Event {
    Joined(Option<Result<(TaskId, Completion), tokio::task::JoinError>>),
    Stop(&'static str),
}

impl<'a, S: StateStore + ?Sized> Executor<'a, S> {
    /// Creates an executor.
    #[must_use]
    pub fn new(store: &'a S, provider: Arc<dyn Provider>, options: ExecutorOptions) -> Self {
        Self {
            store,
            provider,
            options,
            cancel: None,
            hasher: ConfigHasher::new(),
        }
    }

    /// Stops scheduling new operations once `cancel` turns true.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Executes `plan` and reports the outcome of every operation.
    ///
    /// Failures are contained: a failed operation only affects the
    /// operations that transitively wait on it.
    pub async fn execute(&self, plan: &Plan) -> ExecutionReport {
        let started_at = Utc::now();
        info!(
            mode = %plan.mode,
            operations = plan.len(),
            parallelism = self.options.parallelism,
            "Executing plan"
        );

        let mut run = Run::new(plan);
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let mut tasks: JoinSet<Completion> = JoinSet::new();
        let mut in_flight: HashMap<TaskId, usize> = HashMap::new();
        let mut cancel = self.cancel.clone();
        let deadline = self.options.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut stopped = cancel.as_ref().is_some_and(|rx| *rx.borrow());
        // Tells workers sitting in a retry backoff to give up
        let (halt, halted) = watch::channel(stopped);

        loop {
            // A completion and a stop signal can be ready together
            if !stopped && cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                warn!(in_flight = tasks.len(), "Cancellation requested; waiting for in-flight operations");
                stopped = true;
                halt.send_replace(true);
            }
            if !stopped {
                self.dispatch(&mut run, &semaphore, &halted, &mut tasks, &mut in_flight);
            }
            if tasks.is_empty() {
                break;
            }

            let event = tokio::select! {
                joined = tasks.join_next_with_id() => Event::Joined(joined),
                () = cancellation(&mut cancel), if !stopped => Event::Stop("Cancellation requested"),
                () = deadline_reached(deadline), if !stopped => Event::Stop("Run timeout reached"),
            };

            match event {
                Event::Joined(Some(Ok((task_id, completion)))) => {
                    in_flight.remove(&task_id);
                    self.complete(&mut run, completion).await;
                }
                Event::Joined(Some(Err(e))) => {
                    if let Some(index) = in_flight.remove(&e.id()) {
                        run.fail(index, 0, Duration::ZERO, format!("Worker task failed: {e}"));
                    }
                }
                Event::Joined(None) => {}
                Event::Stop(reason) => {
                    warn!(in_flight = tasks.len(), "{reason}; waiting for in-flight operations");
                    stopped = true;
                    halt.send_replace(true);
                }
            }
        }

        let status = run.finish(stopped);
        let report = ExecutionReport {
            mode: plan.mode,
            status,
            started_at,
            finished_at: Utc::now(),
            outcomes: run.outcomes,
        };
        info!(
            status = %report.status,
            succeeded = report.count(OperationStatus::Succeeded),
            failed = report.count(OperationStatus::Failed),
            skipped = report.count(OperationStatus::Skipped),
            cancelled = report.count(OperationStatus::Cancelled),
            "Execution finished"
        );
        report
    }

    /// Starts every ready operation a permit is available for.
    fn dispatch(
        &self,
        run: &mut Run<'_>,
        semaphore: &Arc<Semaphore>,
        halted: &watch::Receiver<bool>,
        tasks: &mut JoinSet<Completion>,
        in_flight: &mut HashMap<TaskId, usize>,
    ) {
        let plan = run.plan;
        while let Some(index) = run.ready.first().copied() {
            let Some(op) = plan.operations.get(index) else {
                run.ready.remove(&index);
                continue;
            };

            let (work, prepared) = match self.prepare(run, op) {
                Ok(Step::Unchanged) => {
                    run.ready.remove(&index);
                    debug!(resource = %op.id, "Already converged");
                    run.succeed(index, op.prior.clone(), 0, Duration::ZERO);
                    continue;
                }
                Ok(Step::Call(work, prepared)) => (work, prepared),
                Err(reason) => {
                    run.ready.remove(&index);
                    error!(resource = %op.id, error = %reason, "Cannot prepare operation");
                    run.fail(index, 0, Duration::ZERO, reason);
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };

            run.ready.remove(&index);
            run.start(index, prepared);
            debug!(resource = %op.id, kind = %op.kind, "Dispatching operation");

            let provider = Arc::clone(&self.provider);
            let retry = self.options.retry;
            let mut halt = halted.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let (attempts, result) = match &work {
                    Work::Apply(request) => {
                        let (attempts, result) = retry
                            .run(&request.id, &mut halt, || provider.create_or_update(request))
                            .await;
                        (attempts, result.map(Some))
                    }
                    Work::Delete { id, external_id } => {
                        let (attempts, result) = retry
                            .run(id, &mut halt, || provider.delete(id, external_id))
                            .await;
                        (attempts, result.map(|()| None))
                    }
                };
                let abandoned = result
                    .as_ref()
                    .is_err_and(|e| retry.gave_up_early(attempts, e));
                Completion {
                    index,
                    attempts,
                    elapsed: started.elapsed(),
                    result,
                    abandoned,
                }
            });
            in_flight.insert(handle.id(), index);
        }
    }

    /// Resolves deferred values and decides whether the provider is needed.
    fn prepare(&self, run: &Run<'_>, op: &Operation) -> Result<Step, String> {
        match op.kind {
            OperationKind::NoOp => Ok(Step::Unchanged),
            OperationKind::Delete => {
                let external_id = op
                    .external_id
                    .clone()
                    .or_else(|| op.prior.as_ref().map(|r| r.external_id.clone()))
                    .ok_or_else(|| format!("No external id recorded for {}", op.id))?;
                let work = Work::Delete {
                    id: op.id.clone(),
                    external_id,
                };
                Ok(Step::Call(work, None))
            }
            OperationKind::Create | OperationKind::Update => {
                let attributes = run.resolve(op)?;
                let hash = self.hasher.hash_resource(&op.id.resource_type, &attributes);

                // Deferred values can turn out identical to what is recorded
                if op.kind == OperationKind::Update
                    && op
                        .previous_hash
                        .as_deref()
                        .is_some_and(|prev| ConfigHasher::hashes_match(prev, &hash))
                {
                    return Ok(Step::Unchanged);
                }

                let request = ProvisionRequest {
                    id: op.id.clone(),
                    external_id: op.external_id.clone(),
                    attributes: attributes.clone(),
                };
                Ok(Step::Call(
                    Work::Apply(request),
                    Some(Prepared { attributes, hash }),
                ))
            }
        }
    }

    /// Records a worker result, committing state before releasing dependents.
    async fn complete(&self, run: &mut Run<'_>, completion: Completion) {
        let Completion {
            index,
            attempts,
            elapsed,
            result,
            abandoned,
        } = completion;
        let plan = run.plan;
        let Some(op) = plan.operations.get(index) else {
            return;
        };
        let prepared = run.prepared.remove(&index);

        if abandoned && let Err(e) = &result {
            warn!(resource = %op.id, attempts, error = %e, "Retries abandoned; run stopped");
            run.abandon(index, attempts, elapsed, e.to_string());
            return;
        }

        let committed = match result {
            Ok(output) => self.commit(op, prepared, output).await,
            Err(e) => Err(e.to_string()),
        };

        match committed {
            Ok(record) => {
                info!(
                    resource = %op.id,
                    kind = %op.kind,
                    attempts,
                    duration_ms = millis(elapsed),
                    "Operation succeeded"
                );
                run.succeed(index, record, attempts, elapsed);
            }
            Err(reason) => {
                error!(
                    resource = %op.id,
                    kind = %op.kind,
                    attempts,
                    error = %reason,
                    "Operation failed"
                );
                run.fail(index, attempts, elapsed, reason);
            }
        }
    }

    /// Persists the effect of a successful provider call.
    async fn commit(
        &self,
        op: &Operation,
        prepared: Option<Prepared>,
        output: Option<ProviderOutput>,
    ) -> Result<Option<StateRecord>, String> {
        if op.kind == OperationKind::Delete {
            self.store
                .remove(&op.id)
                .await
                .map_err(|e| format!("State commit failed: {e}"))?;
            return Ok(None);
        }

        let Some(prepared) = prepared else {
            return Err(format!("No resolved attributes for {}", op.id));
        };
        let Some(output) = output else {
            return Err(format!("Provider returned no result for {}", op.id));
        };

        let record = StateRecord::new(
            op.id.clone(),
            prepared.attributes,
            output.external_id,
            output.attributes,
            prepared.hash,
        )
        .replacing(op.prior.as_ref());

        self.store
            .commit(&op.id, &record)
            .await
            .map_err(|e| format!("State commit failed: {e}"))?;
        Ok(Some(record))
    }
}

/// Coordinator bookkeeping for one run.
struct Run<'p> {
    plan: &'p Plan,
    positions: BTreeMap<&'p ResourceId, usize>,
    dependents: Vec<Vec<usize>>,
    remaining: Vec<usize>,
    ready: BTreeSet<usize>,
    prepared: HashMap<usize, Prepared>,
    records: Vec<Option<StateRecord>>,
    outcomes: Vec<OperationOutcome>,
}

impl<'p> Run<'p> {
    fn new(plan: &'p Plan) -> Self {
        let len = plan.operations.len();
        let mut dependents = vec![Vec::new(); len];
        let mut remaining = Vec::with_capacity(len);

        for (index, op) in plan.operations.iter().enumerate() {
            let waits: BTreeSet<usize> = op.waits_on.iter().copied().collect();
            remaining.push(waits.len());
            for wait in waits {
                if let Some(list) = dependents.get_mut(wait) {
                    list.push(index);
                }
            }
        }

        let ready = (0..len).filter(|&i| remaining[i] == 0).collect();
        Self {
            plan,
            positions: plan
                .operations
                .iter()
                .enumerate()
                .map(|(i, op)| (&op.id, i))
                .collect(),
            dependents,
            remaining,
            ready,
            prepared: HashMap::new(),
            records: vec![None; len],
            outcomes: plan
                .operations
                .iter()
                .enumerate()
                .map(|(i, op)| OperationOutcome::pending(i, op.id.clone(), op.kind))
                .collect(),
        }
    }

    /// Substitutes values produced by operations that already succeeded.
    fn resolve(&self, op: &Operation) -> Result<BTreeMap<String, Value>, String> {
        let lookup = |reference: &Reference| self.lookup(reference);
        op.desired
            .iter()
            .map(|(name, value)| match value {
                AttributeValue::Known(v) => Ok((name.clone(), v.clone())),
                AttributeValue::Deferred { template: raw, .. } => {
                    match template::resolve(raw, &lookup) {
                        Ok(AttributeValue::Known(v)) => Ok((name.clone(), v)),
                        Ok(AttributeValue::Deferred { pending, .. }) => Err(format!(
                            "{name} still waits on {}",
                            pending
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", ")
                        )),
                        Err(e) => Err(format!("Cannot resolve {name}: {e}")),
                    }
                }
            })
            .collect()
    }

    fn lookup(&self, reference: &Reference) -> Option<Value> {
        let index = *self.positions.get(&reference.target)?;
        let record = self.records.get(index)?.as_ref()?;
        let value = record
            .attributes
            .get(&reference.attribute)
            .cloned()
            .or_else(|| record.output(&reference.attribute));
        if value.is_none() {
            warn!(reference = %reference, "Provider returned no value for output; substituting null");
        }
        Some(value.unwrap_or(Value::Null))
    }

    fn start(&mut self, index: usize, prepared: Option<Prepared>) {
        self.outcomes[index].status = OperationStatus::InFlight;
        if let Some(prepared) = prepared {
            self.prepared.insert(index, prepared);
        }
    }

    fn succeed(&mut self, index: usize, record: Option<StateRecord>, attempts: u32, elapsed: Duration) {
        let op = &self.plan.operations[index];
        let outcome = &mut self.outcomes[index];
        outcome.status = OperationStatus::Succeeded;
        outcome.attempts = attempts;
        outcome.duration_ms = millis(elapsed);
        outcome.delta = Some(StateDelta {
            before_hash: op.previous_hash.clone(),
            after_hash: record.as_ref().map(|r| r.content_hash.clone()),
            external_id: record
                .as_ref()
                .map(|r| r.external_id.clone())
                .or_else(|| op.external_id.clone()),
        });
        self.records[index] = record;

        for &dependent in &self.dependents[index] {
            self.remaining[dependent] = self.remaining[dependent].saturating_sub(1);
            if self.remaining[dependent] == 0
                && self.outcomes[dependent].status == OperationStatus::Pending
            {
                self.ready.insert(dependent);
            }
        }
    }

    fn fail(&mut self, index: usize, attempts: u32, elapsed: Duration, reason: String) {
        let outcome = &mut self.outcomes[index];
        outcome.status = OperationStatus::Failed;
        outcome.attempts = attempts;
        outcome.duration_ms = millis(elapsed);
        outcome.error = Some(reason);
        self.skip_dependents(index);
    }

    /// Settles an operation whose retries were cut short by a stopped run.
    /// Its dependents stay pending and are cancelled when the run finishes.
    fn abandon(&mut self, index: usize, attempts: u32, elapsed: Duration, reason: String) {
        let outcome = &mut self.outcomes[index];
        outcome.status = OperationStatus::Cancelled;
        outcome.attempts = attempts;
        outcome.duration_ms = millis(elapsed);
        outcome.error = Some(reason);
    }

    /// Marks every transitive dependent of `index` as skipped.
    fn skip_dependents(&mut self, index: usize) {
        let root = self.plan.operations[index].id.to_string();
        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();

        while let Some(next) = queue.pop_front() {
            if self.outcomes[next].status != OperationStatus::Pending {
                continue;
            }
            self.ready.remove(&next);
            let outcome = &mut self.outcomes[next];
            outcome.status = OperationStatus::Skipped;
            outcome.error = Some(format!("Skipped because {root} did not succeed"));
            debug!(resource = %outcome.id, blocked_by = %root, "Skipping operation");
            queue.extend(self.dependents[next].iter().copied());
        }
    }

    /// Settles operations that never ran and derives the run status.
    ///
    /// The run counts as cancelled only if some operation was left undone
    /// by the stop.
    fn finish(&mut self, stopped: bool) -> RunStatus {
        for outcome in &mut self.outcomes {
            if outcome.status != OperationStatus::Pending {
                continue;
            }
            if stopped {
                outcome.status = OperationStatus::Cancelled;
            } else {
                outcome.status = OperationStatus::Skipped;
                outcome.error = Some(String::from("Dependencies never completed"));
            }
        }

        if self
            .outcomes
            .iter()
            .any(|o| o.status == OperationStatus::Cancelled)
        {
            RunStatus::Cancelled
        } else if self
            .outcomes
            .iter()
            .all(|o| o.status == OperationStatus::Succeeded)
        {
            RunStatus::Success
        } else {
            RunStatus::PartialFailure
        }
    }
}

/// Resolves once cancellation is requested; never resolves without a channel.
pub(crate) async fn cancellation(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel.as_mut() {
        Some(rx) => retry::signalled(rx).await,
        None => std::future::pending().await,
    }
}

async fn deadline_reached(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
