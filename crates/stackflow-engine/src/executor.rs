//! Plan execution
//!
//! The scheduler loop owns all bookkeeping (step status, readiness counters and
//! the table of resolved outputs). Workers spawned on a [`JoinSet`] only talk to
//! the provider and the state store, and report back a [`Completion`].

use crate::action::{ApplyReport, Plan, StepOp, StepOutcome, StepStatus};
use crate::error::{EngineError, Result};
use crate::planner::{config_delta, config_hash};
use crate::provider::{
    Outputs, ProviderError, ProviderResult, ResolvedConfig, ResourceProvider, RetryConfig,
};
use crate::state::{StateRecord, StateStore};
use stackflow_core::{OutputReference, ResourceAddress, ResourceKind};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Owner side of a cancellation signal
#[derive(Debug)]
pub struct Cancellation {
    tx: watch::Sender<bool>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // sender gone without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Progress notifications emitted while applying
#[derive(Debug, Clone)]
pub enum ApplyEvent {
    Started {
        address: ResourceAddress,
        op: StepOp,
    },
    Retrying {
        address: ResourceAddress,
        op: StepOp,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Finished(StepOutcome),
}

type EventSender = Option<mpsc::UnboundedSender<ApplyEvent>>;

fn emit(events: &EventSender, event: ApplyEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum number of steps in flight
    pub concurrency: usize,

    pub retry: RetryConfig,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}

/// Applies plans through a provider, recording results in a state store
pub struct Executor {
    provider: Arc<dyn ResourceProvider>,
    store: Arc<dyn StateStore>,
    options: ExecutorOptions,
    events: EventSender,
}

/// Work handed to a worker task
struct Job {
    index: usize,
    address: ResourceAddress,
    kind: ResourceKind,
    op: StepOp,
    prior: Option<StateRecord>,
    config: ResolvedConfig,
    dependencies: Vec<ResourceAddress>,
}

/// What a successful step changed
enum Committed {
    Outputs(Outputs),
    Removed,
    Unchanged,
}

enum StepError {
    Provider(ProviderError),
    Cancelled,
    State(EngineError),
}

impl StepError {
    fn describe(&self) -> String {
        match self {
            StepError::Provider(e) => e.to_string(),
            StepError::Cancelled => "cancelled".to_string(),
            StepError::State(e) => e.to_string(),
        }
    }
}

struct Completion {
    index: usize,
    attempts: u32,
    result: std::result::Result<(Committed, String), StepError>,
}

enum Wake {
    Joined(Option<std::result::Result<Completion, tokio::task::JoinError>>),
    Cancelled,
}

impl Executor {
    pub fn new(provider: Arc<dyn ResourceProvider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            options: ExecutorOptions::default(),
            events: None,
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Send progress events to the given channel
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ApplyEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Apply a plan
    ///
    /// Returns a report for partial failures. Only a state conflict (or another
    /// state store failure) aborts the run with an error.
    #[instrument(skip_all, fields(provider = self.provider.name(), steps = plan.steps.len()))]
    pub async fn apply(&self, plan: &Plan, cancel: CancelToken) -> Result<ApplyReport> {
        let started = Instant::now();
        let steps = &plan.steps;
        let count = steps.len();

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (index, step) in steps.iter().enumerate() {
            for &before in &step.after {
                if before >= count || before == index {
                    return Err(EngineError::PlanConflict(format!(
                        "step {} ({}) waits for invalid step {}",
                        index, step.address, before
                    )));
                }
                dependents[before].push(index);
            }
        }

        let mut status = vec![StepStatus::Pending; count];
        let mut outcomes: Vec<Option<StepOutcome>> = vec![None; count];
        let mut waiting: Vec<usize> = steps.iter().map(|s| s.after.len()).collect();
        let mut ready: BTreeSet<usize> = (0..count).filter(|i| waiting[*i] == 0).collect();

        // Outputs of resources that keep their recorded instance.
        let mut outputs: BTreeMap<ResourceAddress, Outputs> = plan
            .steps
            .iter()
            .filter(|s| matches!(s.op, StepOp::NoOp | StepOp::Update))
            .filter_map(|s| plan.changes.get(s.change))
            .filter_map(|c| c.prior.as_ref())
            .map(|r| (r.address.clone(), r.outputs.clone()))
            .collect();

        let concurrency = self.options.concurrency.max(1);
        let mut join_set: JoinSet<Completion> = JoinSet::new();
        let mut watcher = cancel.clone();
        let mut cancelled = cancel.is_cancelled();
        let mut fatal: Option<EngineError> = None;

        loop {
            while !cancelled && fatal.is_none() && join_set.len() < concurrency {
                let Some(index) = ready.pop_first() else {
                    break;
                };

                let job = match self.prepare(plan, index, &outputs) {
                    Ok(job) => job,
                    Err(err) => {
                        warn!(address = %steps[index].address, "Step cannot start: {}", err);
                        let message = err.to_string();
                        if !matches!(err, EngineError::Config(_)) {
                            fatal = Some(err);
                        }
                        self.settle_failure(
                            plan,
                            index,
                            0,
                            message,
                            &dependents,
                            &mut status,
                            &mut outcomes,
                        );
                        continue;
                    }
                };

                status[index] = StepStatus::InProgress;
                info!(address = %job.address, op = %job.op, "Step started");
                emit(
                    &self.events,
                    ApplyEvent::Started {
                        address: job.address.clone(),
                        op: job.op,
                    },
                );

                join_set.spawn(run_job(
                    job,
                    Arc::clone(&self.provider),
                    Arc::clone(&self.store),
                    self.options.retry.clone(),
                    cancel.clone(),
                    self.events.clone(),
                ));
            }

            if join_set.is_empty() {
                break;
            }

            let wake = tokio::select! {
                joined = join_set.join_next() => Wake::Joined(joined),
                _ = watcher.cancelled(), if !cancelled => Wake::Cancelled,
            };

            match wake {
                Wake::Cancelled => {
                    warn!("Cancellation requested, waiting for in-flight steps");
                    cancelled = true;
                }
                Wake::Joined(None) => {}
                Wake::Joined(Some(Err(join_error))) => {
                    error!("Worker task failed: {}", join_error);
                    if fatal.is_none() {
                        fatal = Some(EngineError::StateError(format!(
                            "worker task failed: {}",
                            join_error
                        )));
                    }
                }
                Wake::Joined(Some(Ok(completion))) => {
                    let index = completion.index;
                    let address = steps[index].address.clone();
                    match completion.result {
                        Ok((committed, message)) => {
                            match committed {
                                Committed::Outputs(new_outputs) => {
                                    outputs.insert(address.clone(), new_outputs);
                                }
                                Committed::Removed => {
                                    outputs.remove(&address);
                                }
                                Committed::Unchanged => {}
                            }
                            info!(%address, op = %steps[index].op, "Step succeeded");
                            self.record(
                                plan,
                                index,
                                StepStatus::Succeeded,
                                completion.attempts,
                                message,
                                None,
                                &mut status,
                                &mut outcomes,
                            );
                            for &next in &dependents[index] {
                                waiting[next] -= 1;
                                if waiting[next] == 0 && status[next] == StepStatus::Pending {
                                    ready.insert(next);
                                }
                            }
                        }
                        Err(StepError::Cancelled) => {
                            self.record(
                                plan,
                                index,
                                StepStatus::Skipped,
                                completion.attempts,
                                "cancelled".to_string(),
                                None,
                                &mut status,
                                &mut outcomes,
                            );
                        }
                        Err(err) => {
                            let message = err.describe();
                            warn!(%address, op = %steps[index].op, "Step failed: {}", message);
                            if let StepError::State(state_error) = err {
                                if fatal.is_none() {
                                    fatal = Some(state_error);
                                }
                            }
                            self.settle_failure(
                                plan,
                                index,
                                completion.attempts,
                                message,
                                &dependents,
                                &mut status,
                                &mut outcomes,
                            );
                        }
                    }
                }
            }
        }

        for index in 0..count {
            match status[index] {
                StepStatus::Pending => {
                    let reason = if cancelled { "cancelled" } else { "not started" };
                    self.record(
                        plan,
                        index,
                        StepStatus::Skipped,
                        0,
                        reason.to_string(),
                        None,
                        &mut status,
                        &mut outcomes,
                    );
                }
                StepStatus::InProgress => {
                    self.record(
                        plan,
                        index,
                        StepStatus::Failed,
                        0,
                        String::new(),
                        Some("worker task aborted".to_string()),
                        &mut status,
                        &mut outcomes,
                    );
                }
                _ => {}
            }
        }

        if let Some(err) = fatal {
            error!("Apply aborted: {}", err);
            return Err(err);
        }

        let report = ApplyReport {
            outcomes: outcomes.into_iter().flatten().collect(),
            duration_ms: started.elapsed().as_millis() as u64,
            cancelled,
        };
        info!(summary = %report, "Apply finished");
        Ok(report)
    }

    /// Resolve a ready step into a job
    fn prepare(
        &self,
        plan: &Plan,
        index: usize,
        outputs: &BTreeMap<ResourceAddress, Outputs>,
    ) -> Result<Job> {
        let step = &plan.steps[index];
        let change = plan.changes.get(step.change).ok_or_else(|| {
            EngineError::PlanConflict(format!("step {} has no change entry", index))
        })?;

        let mut dependencies: Vec<ResourceAddress> = step
            .after
            .iter()
            .map(|i| &plan.steps[*i])
            .filter(|s| s.op != StepOp::Destroy)
            .map(|s| s.address.clone())
            .collect();
        dependencies.sort();
        dependencies.dedup();

        let no_prior = || {
            EngineError::PlanConflict(format!(
                "{} {} has no recorded state",
                step.op, step.address
            ))
        };

        let (prior, config) = match step.op {
            StepOp::Create | StepOp::Update => {
                let desired = change.desired.as_ref().ok_or_else(|| {
                    EngineError::PlanConflict(format!(
                        "{} has no desired declaration",
                        step.address
                    ))
                })?;
                let lookup = |reference: &OutputReference| {
                    outputs
                        .get(&reference.target)
                        .and_then(|o| o.get(&reference.attribute))
                        .cloned()
                };
                let config = desired.resolve_config(&lookup)?;
                let prior = match step.op {
                    StepOp::Update => Some(change.prior.clone().ok_or_else(no_prior)?),
                    _ => None,
                };
                (prior, config)
            }
            StepOp::Destroy => (
                Some(change.prior.clone().ok_or_else(no_prior)?),
                ResolvedConfig::new(),
            ),
            StepOp::NoOp => (change.prior.clone(), ResolvedConfig::new()),
        };

        debug!(address = %step.address, op = %step.op, "Step prepared");
        Ok(Job {
            index,
            address: step.address.clone(),
            kind: change.kind,
            op: step.op,
            prior,
            config,
            dependencies,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        plan: &Plan,
        index: usize,
        new_status: StepStatus,
        attempts: u32,
        message: String,
        error: Option<String>,
        status: &mut [StepStatus],
        outcomes: &mut [Option<StepOutcome>],
    ) {
        let step = &plan.steps[index];
        status[index] = new_status;
        let outcome = StepOutcome {
            step: index,
            address: step.address.clone(),
            op: step.op,
            status: new_status,
            attempts,
            message,
            error,
        };
        emit(&self.events, ApplyEvent::Finished(outcome.clone()));
        outcomes[index] = Some(outcome);
    }

    /// Mark a step failed and skip everything downstream of it
    #[allow(clippy::too_many_arguments)]
    fn settle_failure(
        &self,
        plan: &Plan,
        index: usize,
        attempts: u32,
        message: String,
        dependents: &[Vec<usize>],
        status: &mut [StepStatus],
        outcomes: &mut [Option<StepOutcome>],
    ) {
        self.record(
            plan,
            index,
            StepStatus::Failed,
            attempts,
            String::new(),
            Some(message),
            status,
            outcomes,
        );

        let failed = &plan.steps[index];
        let reason = format!("{} {} failed", failed.op, failed.address);
        let mut pending: Vec<usize> = dependents[index].clone();
        while let Some(next) = pending.pop() {
            if status[next] != StepStatus::Pending {
                continue;
            }
            debug!(address = %plan.steps[next].address, "Skipping step: {}", reason);
            self.record(
                plan,
                next,
                StepStatus::Skipped,
                0,
                reason.clone(),
                None,
                status,
                outcomes,
            );
            pending.extend(dependents[next].iter().copied());
        }
    }
}

/// Context for retrying a single provider call
struct RetryContext<'a> {
    address: &'a ResourceAddress,
    op: StepOp,
    retry: &'a RetryConfig,
    events: &'a EventSender,
}

/// Call the provider, retrying transient failures with exponential backoff
///
/// With a token, cancellation interrupts the backoff wait.
async fn call_with_retry<T, F, Fut>(
    ctx: &RetryContext<'_>,
    mut cancel: Option<&mut CancelToken>,
    attempts: &mut u32,
    mut call: F,
) -> std::result::Result<T, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        *attempts = (*attempts).max(attempt);

        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < ctx.retry.max_attempts => {
                let delay = ctx.retry.delay_for(attempt);
                warn!(
                    address = %ctx.address,
                    op = %ctx.op,
                    attempt,
                    "Provider call failed, retrying in {:?}: {}",
                    delay,
                    e
                );
                emit(
                    ctx.events,
                    ApplyEvent::Retrying {
                        address: ctx.address.clone(),
                        op: ctx.op,
                        attempt,
                        delay,
                        error: e.to_string(),
                    },
                );

                match cancel.as_mut() {
                    Some(token) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => return Err(StepError::Cancelled),
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
            Err(e) => return Err(StepError::Provider(e)),
        }
    }
}

async fn run_job(
    job: Job,
    provider: Arc<dyn ResourceProvider>,
    store: Arc<dyn StateStore>,
    retry: RetryConfig,
    mut cancel: CancelToken,
    events: EventSender,
) -> Completion {
    let mut attempts = 0;
    let ctx = RetryContext {
        address: &job.address,
        op: job.op,
        retry: &retry,
        events: &events,
    };
    let result = execute(
        &job,
        provider.as_ref(),
        store.as_ref(),
        &ctx,
        &mut cancel,
        &mut attempts,
    )
    .await;

    Completion {
        index: job.index,
        attempts,
        result,
    }
}

fn missing_prior(job: &Job) -> StepError {
    StepError::State(EngineError::PlanConflict(format!(
        "{} {} has no recorded state",
        job.op, job.address
    )))
}

/// Run the provider calls for one step and commit the result
async fn execute(
    job: &Job,
    provider: &dyn ResourceProvider,
    store: &dyn StateStore,
    ctx: &RetryContext<'_>,
    cancel: &mut CancelToken,
    attempts: &mut u32,
) -> std::result::Result<(Committed, String), StepError> {
    let address = &job.address;
    let kind = job.kind;
    let config = &job.config;

    match job.op {
        StepOp::NoOp => {
            if let Some(prior) = &job.prior {
                if prior.dependencies != job.dependencies {
                    let mut record = prior.clone();
                    record.dependencies = job.dependencies.clone();
                    store.save(&record).await.map_err(StepError::State)?;
                    debug!(address = %job.address, "Refreshed recorded dependencies");
                }
            }
            Ok((Committed::Unchanged, "unchanged".to_string()))
        }

        StepOp::Create => {
            let handle = call_with_retry(ctx, Some(cancel), attempts, move || {
                provider.create(address, kind, config)
            })
            .await?;
            info!(address = %job.address, %handle, "Resource created");

            let mut describe_attempts = 0;
            let created = &handle;
            let described = call_with_retry(ctx, None, &mut describe_attempts, move || {
                provider.describe(created, kind)
            })
            .await;

            let base = StateRecord::new(job.address.clone(), job.kind, handle.clone())
                .with_dependencies(job.dependencies.iter().cloned());

            match described {
                Ok(outputs) => {
                    let record = base
                        .with_config(config_hash(job.kind, &job.config), job.config.clone())
                        .with_outputs(outputs.clone());
                    store.save(&record).await.map_err(StepError::State)?;
                    Ok((Committed::Outputs(outputs), format!("created ({})", handle)))
                }
                Err(err) => {
                    // The resource exists: record it with an empty hash so the
                    // next plan reconciles it.
                    let record = base.with_config(String::new(), job.config.clone());
                    store.save(&record).await.map_err(StepError::State)?;
                    Err(err)
                }
            }
        }

        StepOp::Update => {
            let prior = job.prior.as_ref().ok_or_else(|| missing_prior(job))?;
            let delta = config_delta(&prior.applied_config, &job.config);

            // A resolved output can land in an immutable field.
            let immutable: Vec<&str> = delta
                .keys()
                .map(String::as_str)
                .filter(|field| kind.requires_replacement(field))
                .collect();
            if !immutable.is_empty() {
                return Err(StepError::Provider(ProviderError::terminal(format!(
                    "{} cannot be changed in place; plan again to replace",
                    immutable.join(", ")
                ))));
            }

            if delta.is_empty() {
                debug!(address = %job.address, "No field changes after resolution");
            } else {
                let delta = &delta;
                call_with_retry(ctx, Some(cancel), attempts, move || {
                    provider.update(&prior.handle, kind, delta)
                })
                .await?;
                info!(address = %job.address, fields = delta.len(), "Resource updated");
            }

            let mut describe_attempts = 0;
            let described = call_with_retry(ctx, None, &mut describe_attempts, move || {
                provider.describe(&prior.handle, kind)
            })
            .await;

            let mut record = prior.clone();
            record.applied_config = job.config.clone();
            record.dependencies = job.dependencies.clone();

            match described {
                Ok(outputs) => {
                    record.config_hash = config_hash(job.kind, &job.config);
                    record.outputs = outputs.clone();
                    store.save(&record).await.map_err(StepError::State)?;
                    Ok((Committed::Outputs(outputs), "updated".to_string()))
                }
                Err(err) => {
                    record.config_hash = String::new();
                    store.save(&record).await.map_err(StepError::State)?;
                    Err(err)
                }
            }
        }

        StepOp::Destroy => {
            let prior = job.prior.as_ref().ok_or_else(|| missing_prior(job))?;

            let result = call_with_retry(ctx, Some(cancel), attempts, move || {
                provider.destroy(&prior.handle, prior.kind)
            })
            .await;
            match result {
                Ok(()) => info!(address = %job.address, "Resource destroyed"),
                Err(StepError::Provider(e)) if e.is_not_found() => {
                    warn!(address = %job.address, "Resource already gone: {}", e);
                }
                Err(e) => return Err(e),
            }

            store
                .delete(&prior.address, prior.revision)
                .await
                .map_err(StepError::State)?;
            Ok((Committed::Removed, "destroyed".to_string()))
        }
    }
}
