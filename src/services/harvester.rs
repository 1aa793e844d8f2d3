use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use chrono_tz::Tz;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::adapters::{CollectorRegistry, RegistryProbeCollector};
use crate::config::Settings;
use crate::error::{HarvestError, RetryConfig};
use crate::models::{TaskId, Unit};
use crate::services::artifact_store::ArtifactStore;
use crate::services::block_resolver::BlockResolver;
use crate::services::checkpoint::Checkpoint;
use crate::services::connection_pool::ConnectionPool;
use crate::services::deployment_probe::{Deployment, DeploymentProbe};
use crate::services::task_graph::{plan, PlanOptions};
use crate::services::worker_pool::{self, ChainFailure, RunSummary, StopSignal, WorkerContext};
use crate::utils::time::DateRange;

/// Which units a command applies to. Empty lists mean "no filter".
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub chains: Vec<String>,
    pub exclude_chains: Vec<String>,
    pub units: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub range: DateRange,
    pub workers: Option<usize>,
    pub resume: bool,
    pub selection: Selection,
}

#[derive(Debug, Clone)]
pub struct BuildCacheOptions {
    pub range: DateRange,
    pub chains: Vec<String>,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectReport {
    pub run_id: Uuid,
    pub planned: usize,
    pub already_completed: usize,
    pub exhausted: Vec<TaskId>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainCacheReport {
    pub resolved: usize,
    pub error: Option<String>,
}

/// Result of asking one endpoint for its latest block.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub label: String,
    pub public: bool,
    /// Blacklisted credentials are reported but not called.
    pub blacklisted: bool,
    pub latest_block: Option<u64>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl EndpointStatus {
    pub fn is_healthy(&self) -> bool {
        self.latest_block.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainEndpointReport {
    pub chain: String,
    pub endpoints: Vec<EndpointStatus>,
}

impl ChainEndpointReport {
    /// At least one endpoint answered.
    pub fn is_reachable(&self) -> bool {
        self.endpoints.iter().any(EndpointStatus::is_healthy)
    }
}

/// Wires configuration, endpoints, the resolver and collectors together for
/// the top-level commands.
pub struct Harvester {
    settings: Arc<Settings>,
    pool: Arc<ConnectionPool>,
    resolver: Arc<BlockResolver>,
    collectors: CollectorRegistry,
    timezone: Tz,
    run_id: Uuid,
}

impl Harvester {
    /// Live endpoints from configuration; every family is collected with the
    /// registry probe.
    pub fn new(settings: Settings) -> Result<Self, HarvestError> {
        let pool = Arc::new(ConnectionPool::from_settings(&settings)?);
        let collectors = CollectorRegistry::new().with_fallback(Arc::new(RegistryProbeCollector));
        Self::with_components(settings, pool, collectors)
    }

    pub fn with_components(
        settings: Settings,
        pool: Arc<ConnectionPool>,
        collectors: CollectorRegistry,
    ) -> Result<Self, HarvestError> {
        let timezone = settings.timezone()?;
        let resolver = Arc::new(BlockResolver::new(
            pool.clone(),
            settings.cache_dir(),
            timezone,
        ));

        Ok(Self {
            settings: Arc::new(settings),
            pool,
            resolver,
            collectors,
            timezone,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn resolver(&self) -> &Arc<BlockResolver> {
        &self.resolver
    }

    /// Apply unit and chain filters. Unknown names and an empty result are
    /// configuration errors, as is a selection where no chain has endpoints.
    pub fn select_units(&self, selection: &Selection) -> Result<Vec<Unit>, HarvestError> {
        for name in &selection.units {
            if self.settings.unit(name).is_none() {
                return Err(HarvestError::ConfigError(format!("unknown unit {}", name)));
            }
        }
        let include = self.canonical_chains(&selection.chains)?;
        let exclude = self.canonical_chains(&selection.exclude_chains)?;

        let units: Vec<Unit> = self
            .settings
            .units
            .iter()
            .filter(|u| selection.units.is_empty() || selection.units.contains(&u.name))
            .filter(|u| include.is_empty() || include.contains(&u.chain))
            .filter(|u| !exclude.contains(&u.chain))
            .cloned()
            .collect();

        if units.is_empty() {
            return Err(HarvestError::ConfigError(
                "no units match the requested filters".to_string(),
            ));
        }

        let chains: BTreeSet<&str> = units.iter().map(|u| u.chain.as_str()).collect();
        let mut usable = 0;
        for chain in &chains {
            if self.pool.has_endpoints(chain) {
                usable += 1;
            } else {
                warn!(chain = %chain, "No usable endpoint, its tasks will fail");
            }
        }
        if usable == 0 {
            return Err(HarvestError::ConfigError(format!(
                "no credentials or public endpoints for any requested chain ({})",
                chains.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }

        Ok(units)
    }

    pub async fn collect(
        &self,
        options: &CollectOptions,
        stop: StopSignal,
    ) -> Result<CollectReport, HarvestError> {
        let span = tracing::info_span!("run", run_id = %self.run_id);
        self.collect_inner(options, stop).instrument(span).await
    }

    async fn collect_inner(
        &self,
        options: &CollectOptions,
        stop: StopSignal,
    ) -> Result<CollectReport, HarvestError> {
        let units = self.select_units(&options.selection)?;

        let checkpoint_path = self.settings.checkpoint_path();
        let checkpoint = if options.resume {
            Checkpoint::load(checkpoint_path, self.run_id)?
        } else {
            Checkpoint::fresh(checkpoint_path, self.run_id)?
        };
        let checkpoint = Arc::new(checkpoint);
        let snapshot = checkpoint.snapshot().await;

        let plan = plan(
            &units,
            &options.range,
            &snapshot,
            &PlanOptions {
                retry_failed: options.resume,
                max_task_attempts: self.settings.run.max_task_attempts,
            },
        );

        info!(
            units = units.len(),
            start = %options.range.start(),
            end = %options.range.end(),
            pending = plan.pending.len(),
            skipped = plan.skipped.len(),
            already_completed = plan.already_completed,
            exhausted = plan.exhausted.len(),
            "Collection planned"
        );
        for id in &plan.exhausted {
            warn!(task = %id, "Retry budget exhausted, not replanned");
        }

        let mut dates_by_chain: BTreeMap<String, BTreeSet<NaiveDate>> = BTreeMap::new();
        for task in &plan.pending {
            dates_by_chain
                .entry(task.unit.chain.clone())
                .or_default()
                .insert(task.date);
        }
        let unreachable_chains = self.warm_cache(&dates_by_chain, &stop).await?;

        let ctx = Arc::new(WorkerContext {
            pool: self.pool.clone(),
            resolver: self.resolver.clone(),
            collectors: self.collectors.clone(),
            artifacts: ArtifactStore::new(self.settings.artifact_dir()),
            checkpoint,
            task_timeout: self.settings.task_timeout(),
            retry: RetryConfig::from(&self.settings.run.retry),
            unreachable_chains,
        });

        let workers = options.workers.unwrap_or(self.settings.run.workers).max(1);
        let planned = plan.pending.len();
        let mut summary = worker_pool::run(plan.pending, ctx, workers, stop).await?;
        summary.skipped = plan.skipped.len();

        Ok(CollectReport {
            run_id: self.run_id,
            planned,
            already_completed: plan.already_completed,
            exhausted: plan.exhausted,
            summary,
        })
    }

    /// Resolve every chain's pending dates up front, chains in parallel and
    /// dates in order. Only persistence errors stop the run. Chains that
    /// could not be reached at all are returned so their remaining tasks
    /// fail without another search; other failures are left for the
    /// individual tasks to record.
    async fn warm_cache(
        &self,
        dates_by_chain: &BTreeMap<String, BTreeSet<NaiveDate>>,
        stop: &StopSignal,
    ) -> Result<HashMap<String, ChainFailure>, HarvestError> {
        let warmups = dates_by_chain
            .iter()
            .filter(|(chain, _)| self.pool.has_endpoints(chain))
            .map(|(chain, dates)| async move {
                if stop.is_stopped() {
                    return (chain, Ok(Vec::new()));
                }
                let dates: Vec<NaiveDate> = dates.iter().copied().collect();
                (chain, self.resolver.resolve_range(chain, &dates, false).await)
            });

        let mut unreachable = HashMap::new();
        for (chain, result) in join_all(warmups).await {
            match result {
                Ok(mappings) => {
                    info!(chain = %chain, dates = mappings.len(), "Block cache ready")
                }
                Err(err) if err.is_persistence() => return Err(err.into()),
                Err(err) if err.is_unreachable() => {
                    warn!(chain = %chain, error = %err, "Chain unreachable, uncached dates will fail");
                    unreachable.insert(chain.clone(), ChainFailure::from_resolver(&err));
                }
                Err(err) => warn!(chain = %chain, error = %err, "Block cache warm-up incomplete"),
            }
        }
        Ok(unreachable)
    }

    /// Populate block caches without collecting anything.
    pub async fn build_cache(
        &self,
        options: &BuildCacheOptions,
    ) -> Result<BTreeMap<String, ChainCacheReport>, HarvestError> {
        let chains = if options.chains.is_empty() {
            self.pool.chains()
        } else {
            self.canonical_chains(&options.chains)?.into_iter().collect()
        };
        let dates = options.range.dates();

        let builds = chains.iter().map(|chain| {
            let dates = &dates;
            async move {
                if !self.pool.has_endpoints(chain) {
                    return (chain.clone(), Err(None));
                }
                let result = self.resolver.resolve_range(chain, dates, options.force).await;
                (chain.clone(), result.map_err(Some))
            }
        });

        let mut report = BTreeMap::new();
        for (chain, result) in join_all(builds).await {
            let entry = match result {
                Ok(mappings) => {
                    info!(chain = %chain, dates = mappings.len(), force = options.force, "Block cache built");
                    ChainCacheReport {
                        resolved: mappings.len(),
                        error: None,
                    }
                }
                Err(Some(err)) if err.is_persistence() => return Err(err.into()),
                Err(Some(err)) => {
                    warn!(chain = %chain, error = %err, "Block cache build failed");
                    let resolved = self.cached_count(&chain, &dates).await;
                    ChainCacheReport {
                        resolved,
                        error: Some(err.to_string()),
                    }
                }
                Err(None) => {
                    warn!(chain = %chain, "No usable endpoint, chain skipped");
                    ChainCacheReport {
                        resolved: 0,
                        error: Some(format!("no endpoint available for chain {}", chain)),
                    }
                }
            };
            report.insert(chain, entry);
        }
        Ok(report)
    }

    /// Ask every endpoint of the given chains (all chains when empty) for
    /// its latest block, once and without retries.
    pub async fn check_endpoints(
        &self,
        chains: &[String],
    ) -> Result<Vec<ChainEndpointReport>, HarvestError> {
        let chains: Vec<String> = if chains.is_empty() {
            self.pool.chains()
        } else {
            self.canonical_chains(chains)?.into_iter().collect()
        };

        let mut reports = Vec::with_capacity(chains.len());
        for chain in chains {
            let checks = self.pool.endpoints(&chain)?.into_iter().map(|handle| {
                let blacklisted = self.pool.is_blacklisted(&chain, handle.label());
                async move {
                    let mut status = EndpointStatus {
                        label: handle.label().to_string(),
                        public: handle.is_public(),
                        blacklisted,
                        latest_block: None,
                        latency_ms: None,
                        error: None,
                    };
                    if blacklisted {
                        return status;
                    }
                    let started = Instant::now();
                    match handle.latest_block().await {
                        Ok(block) => status.latest_block = Some(block),
                        Err(err) => status.error = Some(err.to_string()),
                    }
                    status.latency_ms = Some(started.elapsed().as_millis() as u64);
                    status
                }
            });
            let endpoints = join_all(checks).await;

            let report = ChainEndpointReport { chain, endpoints };
            let healthy = report.endpoints.iter().filter(|e| e.is_healthy()).count();
            if report.is_reachable() {
                info!(chain = %report.chain, healthy, total = report.endpoints.len(), "Endpoints checked");
            } else {
                warn!(chain = %report.chain, total = report.endpoints.len(), "No endpoint answered");
            }
            reports.push(report);
        }
        Ok(reports)
    }

    pub async fn probe_deployment(&self, unit: &str) -> Result<Deployment, HarvestError> {
        let unit = self
            .settings
            .unit(unit)
            .ok_or_else(|| HarvestError::ConfigError(format!("unknown unit {}", unit)))?;
        let probe = DeploymentProbe::new(self.pool.clone(), self.timezone);
        let deployment = probe.find_deployment(unit).await?;

        if let Some(configured) = unit.deployment_date {
            if configured != deployment.date {
                warn!(
                    unit = %unit.name,
                    configured = %configured,
                    found = %deployment.date,
                    "Configured deployment date differs from on-chain deployment"
                );
            }
        }
        Ok(deployment)
    }

    async fn cached_count(&self, chain: &str, dates: &[NaiveDate]) -> usize {
        let mut count = 0;
        for date in dates {
            if let Ok(Some(_)) = self.resolver.cached(chain, *date).await {
                count += 1;
            }
        }
        count
    }

    fn canonical_chains(&self, names: &[String]) -> Result<BTreeSet<String>, HarvestError> {
        names
            .iter()
            .map(|name| {
                let canonical = self.settings.canonical_chain(name);
                if self.settings.chains.contains_key(&canonical) {
                    Ok(canonical)
                } else {
                    Err(HarvestError::ConfigError(format!("unknown chain {}", name)))
                }
            })
            .collect()
    }
}
