//! Run orchestration.
//!
//! Ties the stages together for one apply or destroy run: take the state
//! lock, load a snapshot, plan, ask for confirmation, make sure the state has
//! not moved underneath the plan, execute, and release the lock.
//!
//! The lock is renewed while the executor runs. Losing it stops the run.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{ExecuteError, Result};
use crate::executor::{self, ExecutionReport, Executor, ExecutorOptions};
use crate::graph::ResourceGraph;
use crate::planner::{Plan, PlanMode, Planner};
use crate::provider::Provider;
use crate::state::{LOCK_RENEWAL_SECS, LockInfo, StateStore};

/// Drives reconciliation runs.
pub struct Engine<'a, S: StateStore + ?Sized> {
    /// State store.
    store: &'a S,
    /// Provider used by the executor.
    provider: Arc<dyn Provider>,
    /// Executor settings.
    options: ExecutorOptions,
    /// Planner.
    planner: Planner,
    /// Lock holder name; generated when empty.
    holder: String,
    /// Cancellation signal forwarded to the executor.
    cancel: Option<watch::Receiver<bool>>,
    /// Interval between lock renewals during execution.
    lock_renewal: Duration,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The plan was shown and not confirmed. Nothing was executed.
    Declined(Plan),
    /// The plan was executed.
    Executed {
        /// The executed plan.
        plan: Plan,
        /// What happened.
        report: ExecutionReport,
    },
}

impl RunOutcome {
    /// Returns the plan of the run.
    #[must_use]
    pub const fn plan(&self) -> &Plan {
        match self {
            Self::Declined(plan) | Self::Executed { plan, .. } => plan,
        }
    }

    /// Returns the execution report, if the plan ran.
    #[must_use]
    pub const fn report(&self) -> Option<&ExecutionReport> {
        match self {
            Self::Declined(_) => None,
            Self::Executed { report, .. } => Some(report),
        }
    }
}

impl<'a, S: StateStore + ?Sized> Engine<'a, S> {
    /// Creates a new engine.
    #[must_use]
    pub fn new(store: &'a S, provider: Arc<dyn Provider>, options: ExecutorOptions) -> Self {
        Self {
            store,
            provider,
            options,
            planner: Planner::new(),
            holder: String::new(),
            cancel: None,
            lock_renewal: Duration::from_secs(LOCK_RENEWAL_SECS),
        }
    }

    /// Sets the lock holder name.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Forwards a cancellation signal to the executor.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Sets how often the state lock is renewed while operations run.
    #[must_use]
    pub fn with_lock_renewal(mut self, interval: Duration) -> Self {
        self.lock_renewal = interval.max(Duration::from_millis(1));
        self
    }

    /// Computes a plan without taking the lock or executing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or planning fails.
    pub async fn plan(&self, graph: &ResourceGraph, mode: PlanMode) -> Result<Plan> {
        let snapshot = self.store.load().await?;
        debug!(records = snapshot.len(), "Loaded state snapshot");
        Ok(self.planner.plan(graph, &snapshot, mode)?)
    }

    /// Plans and, once `confirm` accepts the plan, executes it under the
    /// state lock.
    ///
    /// An empty plan is executed without asking.
    ///
    /// # Errors
    ///
    /// Returns an error if cancellation was requested before the run
    /// started, the lock is held elsewhere or lost while waiting for
    /// confirmation, planning fails, or the state changed between planning
    /// and execution. Operation failures are
    /// reported in the [`ExecutionReport`], not as errors.
    pub async fn run<F>(&self, graph: &ResourceGraph, mode: PlanMode, confirm: F) -> Result<RunOutcome>
    where
        F: FnOnce(&Plan) -> bool,
    {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Err(ExecuteError::Aborted {
                reason: String::from("cancellation requested before the run started"),
            }
            .into());
        }

        let lock = self.store.acquire_lock(&self.holder, &mode.to_string()).await?;
        debug!(lock_id = %lock.lock_id, holder = %lock.holder, "Acquired state lock");

        let result = self.run_locked(&lock, graph, mode, confirm).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!(lock_id = %lock.lock_id, "Failed to release state lock: {e}");
        }
        result
    }

    async fn run_locked<F>(
        &self,
        lock: &LockInfo,
        graph: &ResourceGraph,
        mode: PlanMode,
        confirm: F,
    ) -> Result<RunOutcome>
    where
        F: FnOnce(&Plan) -> bool,
    {
        let plan = self.plan(graph, mode).await?;

        if plan.is_empty() {
            info!("No changes required - state is converged");
        } else if !confirm(&plan) {
            info!("Plan declined");
            return Ok(RunOutcome::Declined(plan));
        }

        // Confirmation can take longer than the lock lives
        self.store.renew_lock(&lock.lock_id).await?;

        let current = self.store.load().await?.fingerprint();
        if current != plan.state_fingerprint {
            return Err(ExecuteError::StalePlan {
                planned: plan.state_fingerprint,
                current,
            }
            .into());
        }

        let report = self.execute(lock, &plan).await;
        Ok(RunOutcome::Executed { plan, report })
    }

    /// Runs the executor while keeping the lock alive.
    ///
    /// User cancellation and a lost lock both reach the executor through one
    /// stop channel.
    async fn execute(&self, lock: &LockInfo, plan: &Plan) -> ExecutionReport {
        let mut cancel = self.cancel.clone();
        let (stop, stopped) = watch::channel(cancel.as_ref().is_some_and(|rx| *rx.borrow()));
        let runner = Executor::new(self.store, Arc::clone(&self.provider), self.options)
            .with_cancellation(stopped);
        let execution = runner.execute(plan);
        tokio::pin!(execution);

        let mut renewal = tokio::time::interval_at(Instant::now() + self.lock_renewal, self.lock_renewal);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lost = false;

        loop {
            tokio::select! {
                report = &mut execution => return report,
                _ = renewal.tick(), if !lost => {
                    match self.store.renew_lock(&lock.lock_id).await {
                        Ok(renewed) => debug!(expires_at = %renewed.expires_at, "Lock renewed during execution"),
                        Err(e) => {
                            error!(lock_id = %lock.lock_id, "State lock lost, stopping the run: {e}");
                            lost = true;
                            stop.send_replace(true);
                        }
                    }
                }
                () = executor::cancellation(&mut cancel), if !*stop.borrow() => {
                    stop.send_replace(true);
                }
            }
        }
    }
}
