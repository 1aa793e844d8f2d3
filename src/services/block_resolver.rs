use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::models::BlockMapping;
use crate::services::connection_pool::{ConnectionPool, PoolError};
use crate::error::FailureCategory;
use crate::utils::fs::{read_json_if_exists, write_json_atomic_async};
use crate::utils::time::{day_window, DayWindow, TimeError};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error(transparent)]
    Time(#[from] TimeError),

    #[error("Endpoint error while resolving blocks: {0}")]
    Pool(#[from] PoolError),

    #[error("{chain} {date} is not finalized: tip timestamp {tip_timestamp} is not past {closing_instant}")]
    DateNotFinalized {
        chain: String,
        date: NaiveDate,
        tip_timestamp: i64,
        closing_instant: i64,
    },

    #[error("{chain} {date} ends before block 1")]
    BeforeGenesis { chain: String, date: NaiveDate },

    #[error("Non-monotonic block timestamps on {chain}: {detail}")]
    NonMonotonic { chain: String, detail: String },

    #[error("Block cache {path} unusable: {message}")]
    Persistence { path: String, message: String },
}

impl ResolverError {
    pub fn is_persistence(&self) -> bool {
        match self {
            ResolverError::Persistence { .. } => true,
            ResolverError::Pool(err) => err.is_persistence(),
            _ => false,
        }
    }

    /// No endpoint of the chain answered, so any other date on it would
    /// fail the same way.
    pub fn is_unreachable(&self) -> bool {
        match self {
            ResolverError::Pool(err) => matches!(
                err.category(),
                FailureCategory::Connection
                    | FailureCategory::Timeout
                    | FailureCategory::RateLimit
                    | FailureCategory::Auth
                    | FailureCategory::NoEndpoint
            ),
            _ => false,
        }
    }
}

/// One cache record, stored under its date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBlock {
    pub block: u64,
    pub timestamp: i64,
    pub ts_start_utc: i64,
    pub ts_end_utc: i64,
}

impl CachedBlock {
    fn to_mapping(self, chain: &str, date: NaiveDate) -> BlockMapping {
        BlockMapping {
            chain: chain.to_string(),
            date,
            block: self.block,
            timestamp: self.timestamp,
            window: DayWindow {
                start_utc: self.ts_start_utc,
                end_utc: self.ts_end_utc,
            },
        }
    }
}

pub type BlockCache = BTreeMap<NaiveDate, CachedBlock>;

/// Read a chain's cache file. A missing file is an empty cache.
pub fn load_block_cache(path: &Path) -> Result<BlockCache, ResolverError> {
    read_json_if_exists::<BlockCache>(path)
        .map(Option::unwrap_or_default)
        .map_err(|err| persistence(path, err))
}

fn persistence(path: &Path, err: io::Error) -> ResolverError {
    ResolverError::Persistence {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

struct ChainCache {
    path: PathBuf,
    entries: Option<BlockCache>,
}

impl ChainCache {
    fn entries(&mut self) -> Result<&mut BlockCache, ResolverError> {
        if self.entries.is_none() {
            self.entries = Some(load_block_cache(&self.path)?);
        }
        Ok(self.entries.get_or_insert_with(BlockCache::new))
    }
}

/// Maps civil dates to end-of-day blocks. The on-disk cache is the source of
/// truth: a cached date is never searched again unless forced.
pub struct BlockResolver {
    pool: Arc<ConnectionPool>,
    cache_dir: PathBuf,
    timezone: Tz,
    chains: StdMutex<HashMap<String, Arc<Mutex<ChainCache>>>>,
}

impl BlockResolver {
    pub fn new(pool: Arc<ConnectionPool>, cache_dir: impl Into<PathBuf>, timezone: Tz) -> Self {
        Self {
            pool,
            cache_dir: cache_dir.into(),
            timezone,
            chains: StdMutex::new(HashMap::new()),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn cache_path(&self, chain: &str) -> PathBuf {
        self.cache_dir.join(format!("{}_blocks.json", chain))
    }

    pub async fn resolve(&self, chain: &str, date: NaiveDate) -> Result<BlockMapping, ResolverError> {
        self.resolve_with(chain, date, false).await
    }

    /// Cached lookup only; never touches the network.
    pub async fn cached(
        &self,
        chain: &str,
        date: NaiveDate,
    ) -> Result<Option<BlockMapping>, ResolverError> {
        let cache = self.chain_cache(chain);
        let mut cache = cache.lock().await;
        Ok(cache
            .entries()?
            .get(&date)
            .map(|entry| entry.to_mapping(chain, date)))
    }

    /// Resolve `date`, recomputing and overwriting a cached entry when
    /// `force` is set.
    pub async fn resolve_with(
        &self,
        chain: &str,
        date: NaiveDate,
        force: bool,
    ) -> Result<BlockMapping, ResolverError> {
        let window = day_window(date, &self.timezone)?;
        let cache = self.chain_cache(chain);
        // Held through the search and the write, so the neighbour checks
        // and the saved file always see the same map. Searches on one chain
        // therefore run one at a time; other chains are unaffected.
        let mut cache = cache.lock().await;
        let path = cache.path.clone();
        let entries = cache.entries()?;

        if !force {
            if let Some(entry) = entries.get(&date) {
                debug!(chain = %chain, %date, block = entry.block, "Block cache hit");
                return Ok(entry.to_mapping(chain, date));
            }
        }

        let previous = entries.range(..date).next_back().map(|(d, e)| (*d, *e));
        let following = entries
            .range((Bound::Excluded(date), Bound::Unbounded))
            .next()
            .map(|(d, e)| (*d, *e));

        let (block, timestamp) = self
            .search(chain, date, window.closing_instant(), previous.map(|(_, e)| e.block))
            .await?;

        if let Some((prev_date, prev)) = previous {
            if block < prev.block {
                return Err(self.non_monotonic(
                    chain,
                    format!(
                        "{} resolves to {} but earlier date {} is cached at {}",
                        date, block, prev_date, prev.block
                    ),
                ));
            }
        }
        if let Some((next_date, next)) = following {
            if block > next.block {
                return Err(self.non_monotonic(
                    chain,
                    format!(
                        "{} resolves to {} but later date {} is cached at {}",
                        date, block, next_date, next.block
                    ),
                ));
            }
        }

        let entry = CachedBlock {
            block,
            timestamp,
            ts_start_utc: window.start_utc,
            ts_end_utc: window.end_utc,
        };
        entries.insert(date, entry);
        write_json_atomic_async(&path, &*entries)
            .await
            .map_err(|err| persistence(&path, err))?;

        info!(chain = %chain, %date, block, timestamp, "Resolved end-of-day block");
        Ok(entry.to_mapping(chain, date))
    }

    /// Resolve many dates in ascending order. Each search starts from the
    /// previous date's block.
    pub async fn resolve_range(
        &self,
        chain: &str,
        dates: &[NaiveDate],
        force: bool,
    ) -> Result<Vec<BlockMapping>, ResolverError> {
        let mut ordered = dates.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut mappings = Vec::with_capacity(ordered.len());
        for date in ordered {
            mappings.push(self.resolve_with(chain, date, force).await?);
        }
        Ok(mappings)
    }

    /// Highest block in `[1, latest]` with `timestamp <= target`, keeping the
    /// invariant `ts(lo) <= target < ts(hi)` and failing on any probe that
    /// falls outside `[ts(lo), ts(hi)]`.
    async fn search(
        &self,
        chain: &str,
        date: NaiveDate,
        target: i64,
        lower_hint: Option<u64>,
    ) -> Result<(u64, i64), ResolverError> {
        let latest = self
            .pool
            .call_with_retry(chain, "latest_block", |handle| async move {
                handle.latest_block().await
            })
            .await?;
        let tip_timestamp = self.timestamp(chain, latest).await?;

        if tip_timestamp <= target {
            return Err(ResolverError::DateNotFinalized {
                chain: chain.to_string(),
                date,
                tip_timestamp,
                closing_instant: target,
            });
        }

        let mut lo = lower_hint.filter(|b| *b >= 1 && *b < latest).unwrap_or(1);
        let mut ts_lo = self.timestamp(chain, lo).await?;
        if ts_lo > target && lo > 1 {
            debug!(chain = %chain, hint = lo, "Lower bound hint is past target, searching from block 1");
            lo = 1;
            ts_lo = self.timestamp(chain, lo).await?;
        }
        if ts_lo > target {
            return Err(ResolverError::BeforeGenesis {
                chain: chain.to_string(),
                date,
            });
        }

        let mut hi = latest;
        let mut ts_hi = tip_timestamp;
        let mut probes = 0u32;

        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            let ts_mid = self.timestamp(chain, mid).await?;
            probes += 1;

            if ts_mid < ts_lo || ts_mid > ts_hi {
                return Err(self.non_monotonic(
                    chain,
                    format!(
                        "block {} has timestamp {} outside [{} @ {}, {} @ {}]",
                        mid, ts_mid, ts_lo, lo, ts_hi, hi
                    ),
                ));
            }

            if ts_mid <= target {
                lo = mid;
                ts_lo = ts_mid;
            } else {
                hi = mid;
                ts_hi = ts_mid;
            }
        }

        debug!(chain = %chain, %date, block = lo, probes, "Binary search converged");
        Ok((lo, ts_lo))
    }

    async fn timestamp(&self, chain: &str, block: u64) -> Result<i64, ResolverError> {
        let ts = self
            .pool
            .call_with_retry(chain, "block_timestamp", move |handle| async move {
                handle.block_timestamp(block).await
            })
            .await?;
        Ok(ts)
    }

    fn non_monotonic(&self, chain: &str, detail: String) -> ResolverError {
        error!(chain = %chain, detail = %detail, "Block timestamps are not monotonic, refusing to resolve");
        ResolverError::NonMonotonic {
            chain: chain.to_string(),
            detail,
        }
    }

    fn chain_cache(&self, chain: &str) -> Arc<Mutex<ChainCache>> {
        let mut chains = self
            .chains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        chains
            .entry(chain.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChainCache {
                    path: self.cache_path(chain),
                    entries: None,
                }))
            })
            .clone()
    }
}
