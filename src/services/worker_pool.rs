use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::adapters::{CollectorError, CollectorRegistry};
use crate::error::{with_retry, FailureCategory, HarvestError, RetryConfig};
use crate::models::{BlockMapping, Task, TaskId, TaskOutcome};
use crate::services::artifact_store::{Artifact, ArtifactStore};
use crate::services::block_resolver::{BlockResolver, ResolverError};
use crate::services::checkpoint::Checkpoint;
use crate::services::connection_pool::{ConnectionPool, PoolError};

/// Cooperative stop flag. Workers check it between tasks only.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Planned tasks never dispatched because a stop was requested.
    pub not_started: usize,
    pub failures_by_category: BTreeMap<FailureCategory, usize>,
    pub stopped: bool,
}

impl RunSummary {
    fn count(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Failed { category, .. } => {
                self.failed += 1;
                *self.failures_by_category.entry(*category).or_default() += 1;
            }
        }
    }
}

/// A chain that could not be reached while warming the block cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFailure {
    pub reason: String,
    pub category: FailureCategory,
}

impl ChainFailure {
    pub fn from_resolver(err: &ResolverError) -> Self {
        let category = match err {
            ResolverError::Pool(PoolError::NoEndpointAvailable { .. }) => {
                FailureCategory::NoEndpoint
            }
            _ => FailureCategory::Resolution,
        };
        Self {
            reason: err.to_string(),
            category,
        }
    }

    fn to_error(&self, chain: &str) -> CollectorError {
        match self.category {
            FailureCategory::NoEndpoint => CollectorError::NoEndpoint(chain.to_string()),
            _ => CollectorError::Resolution(self.reason.clone()),
        }
    }
}

/// Everything a task needs, shared by all workers.
pub struct WorkerContext {
    pub pool: Arc<ConnectionPool>,
    pub resolver: Arc<BlockResolver>,
    pub collectors: CollectorRegistry,
    pub artifacts: ArtifactStore,
    pub checkpoint: Arc<Checkpoint>,
    pub task_timeout: Duration,
    /// Applied around each collector call for transient errors only.
    pub retry: RetryConfig,
    /// Tasks on these chains use cached blocks only and otherwise fail
    /// straight away with the recorded failure.
    pub unreachable_chains: HashMap<String, ChainFailure>,
}

enum TaskFailure {
    Task(CollectorError),
    Fatal(HarvestError),
}

impl From<CollectorError> for TaskFailure {
    fn from(err: CollectorError) -> Self {
        TaskFailure::Task(err)
    }
}

/// Run `tasks` with at most `concurrency` in flight. Task failures become
/// checkpoint records; only persistence errors end the run early, in which
/// case in-flight tasks are aborted.
pub async fn run(
    tasks: Vec<Task>,
    ctx: Arc<WorkerContext>,
    concurrency: usize,
    stop: StopSignal,
) -> Result<RunSummary, HarvestError> {
    let total = tasks.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut join_set: JoinSet<Result<TaskOutcome, HarvestError>> = JoinSet::new();
    let mut summary = RunSummary::default();

    info!(tasks = total, concurrency = concurrency.max(1), "Starting worker pool");

    let mut dispatched = 0usize;
    for task in tasks {
        if stop.is_stopped() {
            break;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if stop.is_stopped() {
            break;
        }

        let ctx = ctx.clone();
        let span = tracing::info_span!("task", unit = %task.unit.name, date = %task.date);
        join_set.spawn(
            async move {
                let _permit = permit;
                execute(&ctx, task).await
            }
            .instrument(span),
        );
        dispatched += 1;

        while let Some(joined) = join_set.try_join_next() {
            reap(joined, &mut summary, &mut join_set)?;
        }
    }

    while let Some(joined) = join_set.join_next().await {
        reap(joined, &mut summary, &mut join_set)?;
    }

    summary.not_started = total - dispatched;
    summary.stopped = stop.is_stopped();
    ctx.checkpoint.flush().await?;

    if summary.stopped {
        warn!(
            completed = summary.completed,
            failed = summary.failed,
            not_started = summary.not_started,
            "Stopped on request, checkpoint flushed"
        );
    } else {
        info!(
            completed = summary.completed,
            failed = summary.failed,
            "Worker pool finished"
        );
    }
    Ok(summary)
}

fn reap(
    joined: Result<Result<TaskOutcome, HarvestError>, tokio::task::JoinError>,
    summary: &mut RunSummary,
    join_set: &mut JoinSet<Result<TaskOutcome, HarvestError>>,
) -> Result<(), HarvestError> {
    match joined {
        Ok(Ok(outcome)) => {
            summary.count(&outcome);
            Ok(())
        }
        Ok(Err(err)) => {
            error!(error = %err, "Fatal error, aborting in-flight tasks");
            join_set.abort_all();
            Err(err)
        }
        Err(join_error) => {
            // not recorded, so the task is redone on the next run
            error!(error = %join_error, "Worker task panicked");
            summary.failed += 1;
            *summary
                .failures_by_category
                .entry(FailureCategory::Other)
                .or_default() += 1;
            Ok(())
        }
    }
}

/// Execute one task: resolve, collect, write the artifact, then record.
/// The artifact is durable before the checkpoint says the task completed.
async fn execute(ctx: &WorkerContext, task: Task) -> Result<TaskOutcome, HarvestError> {
    let id = task.id();
    debug!("Task started");

    let collected = tokio::time::timeout(ctx.task_timeout, collect_one(ctx, &task)).await;
    let outcome = match collected {
        Ok(Ok((mapping, data))) => {
            let artifact = Artifact::new(&task.unit, &mapping, data);
            ctx.artifacts.write(&artifact).await?;
            info!(block = mapping.block, "Task completed");
            TaskOutcome::Completed
        }
        Ok(Err(TaskFailure::Task(err))) => failed(&id, err),
        Ok(Err(TaskFailure::Fatal(err))) => return Err(err),
        Err(_) => failed(&id, CollectorError::Timeout(ctx.task_timeout.as_secs())),
    };

    ctx.checkpoint.record(&id, &outcome).await?;
    Ok(outcome)
}

fn failed(id: &TaskId, err: CollectorError) -> TaskOutcome {
    warn!(task = %id, category = %err.category(), error = %err, "Task failed");
    TaskOutcome::failed(err.to_string(), err.category())
}

async fn collect_one(ctx: &WorkerContext, task: &Task) -> Result<(BlockMapping, Value), TaskFailure> {
    let unit = &task.unit;
    let chain = unit.chain.as_str();
    let collector = ctx.collectors.get(unit.protocol_family)?;

    let mapping = match ctx.unreachable_chains.get(chain) {
        Some(failure) => match ctx.resolver.cached(chain, task.date).await {
            Ok(Some(mapping)) => mapping,
            Ok(None) => return Err(TaskFailure::Task(failure.to_error(chain))),
            Err(err) => return Err(resolution_failure(chain, err)),
        },
        None => ctx
            .resolver
            .resolve(chain, task.date)
            .await
            .map_err(|err| resolution_failure(chain, err))?,
    };

    let operation = format!("collect {}", task.id());
    let collector = collector.as_ref();
    let mapping_ref = &mapping;
    let data = with_retry(
        &operation,
        &ctx.retry,
        |err: &CollectorError| match err {
            CollectorError::Rpc(rpc) => rpc.is_transient() || rpc.is_unauthorized(),
            _ => false,
        },
        || async move {
            let handle = ctx.pool.next(chain).map_err(|err| match err {
                PoolError::Rpc(rpc) => CollectorError::Rpc(rpc),
                _ => CollectorError::NoEndpoint(chain.to_string()),
            })?;

            match collector.collect(unit, mapping_ref, &handle).await {
                Err(CollectorError::Rpc(rpc)) if rpc.is_unauthorized() && !handle.is_public() => {
                    ctx.pool.blacklist(chain, handle.label(), &rpc.to_string());
                    Err(CollectorError::Rpc(rpc))
                }
                other => other,
            }
        },
    )
    .await?;

    Ok((mapping, data))
}

fn resolution_failure(chain: &str, err: ResolverError) -> TaskFailure {
    if err.is_persistence() {
        return TaskFailure::Fatal(err.into());
    }
    match err {
        ResolverError::Pool(PoolError::NoEndpointAvailable { .. }) => {
            TaskFailure::Task(CollectorError::NoEndpoint(chain.to_string()))
        }
        other => TaskFailure::Task(CollectorError::Resolution(other.to_string())),
    }
}
