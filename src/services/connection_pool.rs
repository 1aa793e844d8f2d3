use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blockchain::{AlloyChainClient, ChainClient, RpcError};
use crate::config::Settings;
use crate::error::{with_retry, FailureCategory, RetryConfig};
use crate::models::ChainEndpoint;
use crate::services::rate_limiter::{RateLimiter, RateLimiterError};
use crate::utils::blocks::chunk_ranges;
use crate::utils::fs::{read_json_if_exists, write_json_atomic};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No endpoint available for chain {chain}")]
    NoEndpointAvailable { chain: String },

    #[error("Chain {0} is not configured")]
    UnknownChain(String),

    #[error("Invalid endpoint configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Key blacklist at {path} could not be read: {message}")]
    Persistence { path: String, message: String },
}

impl PoolError {
    pub fn is_persistence(&self) -> bool {
        matches!(self, PoolError::Persistence { .. })
    }

    /// Another attempt may succeed, possibly on a different credential.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::Rpc(err) => {
                err.is_transient()
                    || err.is_unauthorized()
                    || err.category() == FailureCategory::Timeout
            }
            _ => false,
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            PoolError::NoEndpointAvailable { .. } => FailureCategory::NoEndpoint,
            PoolError::Rpc(err) => err.category(),
            _ => FailureCategory::Other,
        }
    }
}

impl From<RateLimiterError> for PoolError {
    fn from(err: RateLimiterError) -> Self {
        PoolError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub reason: String,
    pub blacklisted_at: DateTime<Utc>,
}

/// chain -> credential label -> entry
pub type Blacklist = BTreeMap<String, BTreeMap<String, BlacklistEntry>>;

struct EndpointSlot {
    label: String,
    public: bool,
    client: Arc<dyn ChainClient>,
    limiter: Arc<RateLimiter>,
}

struct ChainPool {
    credentials: Vec<Arc<EndpointSlot>>,
    public: Vec<Arc<EndpointSlot>>,
    cursor: AtomicUsize,
    public_cursor: AtomicUsize,
    log_chunk_size: u64,
}

impl ChainPool {
    fn new(log_chunk_size: u64) -> Self {
        Self {
            credentials: Vec::new(),
            public: Vec::new(),
            cursor: AtomicUsize::new(0),
            public_cursor: AtomicUsize::new(0),
            log_chunk_size: log_chunk_size.max(1),
        }
    }
}

/// A selected endpoint. Every call goes through the endpoint's rate limiter
/// and is bounded by the RPC timeout.
#[derive(Clone)]
pub struct EndpointHandle {
    chain: String,
    slot: Arc<EndpointSlot>,
    timeout: Duration,
    log_chunk_size: u64,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("chain", &self.chain)
            .field("label", &self.slot.label)
            .field("public", &self.slot.public)
            .finish()
    }
}

impl EndpointHandle {
    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn label(&self) -> &str {
        &self.slot.label
    }

    pub fn is_public(&self) -> bool {
        self.slot.public
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.slot.limiter
    }

    pub fn log_chunk_size(&self) -> u64 {
        self.log_chunk_size
    }

    /// Inclusive block ranges no wider than this chain's log query limit.
    pub fn chunk_ranges(&self, from: u64, to: u64) -> Vec<(u64, u64)> {
        chunk_ranges(from, to, self.log_chunk_size)
    }

    pub async fn latest_block(&self) -> Result<u64, RpcError> {
        self.paced(self.slot.client.latest_block()).await
    }

    pub async fn block_timestamp(&self, block: u64) -> Result<i64, RpcError> {
        self.paced(self.slot.client.block_timestamp(block)).await
    }

    pub async fn code_size_at(&self, address: Address, block: u64) -> Result<usize, RpcError> {
        self.paced(self.slot.client.code_size_at(address, block))
            .await
    }

    pub async fn balance_at(&self, address: Address, block: u64) -> Result<U256, RpcError> {
        self.paced(self.slot.client.balance_at(address, block)).await
    }

    async fn paced<T, F>(&self, request: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        self.slot.limiter.acquire().await;

        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => {
                self.slot.limiter.report_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if err.is_rate_limited() {
                    self.slot.limiter.report_rate_limited();
                }
                Err(err)
            }
            Err(_) => Err(RpcError::Timeout {
                endpoint: self.slot.label.clone(),
                message: format!("no response within {}ms", self.timeout.as_millis()),
            }),
        }
    }
}

/// Per-chain rotation over keyed credentials, with public endpoints as the
/// fallback once no usable credential remains.
pub struct ConnectionPool {
    chains: HashMap<String, ChainPool>,
    blacklist: Mutex<Blacklist>,
    blacklist_path: Option<PathBuf>,
    rpc_timeout: Duration,
    retry: RetryConfig,
}

impl ConnectionPool {
    pub fn builder() -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::default()
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, PoolError> {
        let mut builder = Self::builder()
            .rpc_timeout(settings.rpc_timeout())
            .retry(RetryConfig::from(&settings.run.retry))
            .blacklist_path(settings.blacklist_path());

        for (name, chain_settings) in &settings.chains {
            let endpoint = ChainEndpoint::from_settings(
                name,
                chain_settings,
                settings.calls_per_second_for(name),
            )
            .map_err(|e| PoolError::Config(e.to_string()))?;

            builder = builder.chain(name, endpoint.log_chunk_size);
            for credential in &endpoint.credentials {
                let client = AlloyChainClient::new(credential.url.clone(), credential.label.clone());
                builder = builder.credential(
                    name,
                    &credential.label,
                    Arc::new(client),
                    credential.calls_per_second,
                )?;
            }
            for (i, url) in endpoint.public_endpoints.iter().enumerate() {
                let label = format!("public-{}", i);
                let client = AlloyChainClient::new(url.clone(), label.clone());
                builder = builder.public_endpoint(
                    name,
                    &label,
                    Arc::new(client),
                    settings.run.public_calls_per_second,
                )?;
            }

            if !endpoint.has_endpoints() {
                warn!(chain = %name, "No endpoints configured, tasks on this chain will fail");
            }
        }

        builder.build()
    }

    pub fn chains(&self) -> Vec<String> {
        let mut chains: Vec<String> = self.chains.keys().cloned().collect();
        chains.sort();
        chains
    }

    pub fn is_configured(&self, chain: &str) -> bool {
        self.chains.contains_key(chain)
    }

    /// True when `next(chain)` would currently succeed.
    pub fn has_endpoints(&self, chain: &str) -> bool {
        self.chains.get(chain).map_or(false, |pool| {
            !pool.public.is_empty() || !self.active_credentials(chain, pool).is_empty()
        })
    }

    /// Round-robin over usable credentials; public endpoints only when there
    /// are none. Selection does not consume rate budget.
    pub fn next(&self, chain: &str) -> Result<EndpointHandle, PoolError> {
        let pool = self
            .chains
            .get(chain)
            .ok_or_else(|| PoolError::UnknownChain(chain.to_string()))?;

        let active = self.active_credentials(chain, pool);
        let slot = if !active.is_empty() {
            let index = pool.cursor.fetch_add(1, Ordering::Relaxed) % active.len();
            active[index].clone()
        } else if !pool.public.is_empty() {
            let index = pool.public_cursor.fetch_add(1, Ordering::Relaxed) % pool.public.len();
            pool.public[index].clone()
        } else {
            return Err(PoolError::NoEndpointAvailable {
                chain: chain.to_string(),
            });
        };

        Ok(self.handle(chain, pool, slot))
    }

    /// Every endpoint of `chain`, credentials first in configuration order,
    /// blacklisted ones included.
    pub fn endpoints(&self, chain: &str) -> Result<Vec<EndpointHandle>, PoolError> {
        let pool = self
            .chains
            .get(chain)
            .ok_or_else(|| PoolError::UnknownChain(chain.to_string()))?;
        Ok(pool
            .credentials
            .iter()
            .chain(pool.public.iter())
            .map(|slot| self.handle(chain, pool, slot.clone()))
            .collect())
    }

    fn handle(&self, chain: &str, pool: &ChainPool, slot: Arc<EndpointSlot>) -> EndpointHandle {
        EndpointHandle {
            chain: chain.to_string(),
            slot,
            timeout: self.rpc_timeout,
            log_chunk_size: pool.log_chunk_size,
        }
    }

    /// Issue one logical request, rotating endpoints between attempts.
    /// Credentials that answer with an authentication failure are
    /// blacklisted before the next attempt.
    pub async fn call_with_retry<T, F, Fut>(
        &self,
        chain: &str,
        operation: &str,
        request: F,
    ) -> Result<T, PoolError>
    where
        F: Fn(EndpointHandle) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let request = &request;
        with_retry(
            operation,
            &self.retry,
            |err: &PoolError| err.is_retryable(),
            || async move {
                let handle = self.next(chain)?;
                let label = handle.label().to_string();
                let public = handle.is_public();

                match request(handle).await {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        if err.is_unauthorized() && !public {
                            self.blacklist(chain, &label, &err.to_string());
                        }
                        Err(PoolError::Rpc(err))
                    }
                }
            },
        )
        .await
    }

    /// Remove a credential from rotation for this and future runs. Failing to
    /// persist the blacklist is logged and otherwise ignored.
    ///
    /// The file is written while the lock is held so concurrent updates land
    /// in order and the last write always carries every entry.
    pub fn blacklist(&self, chain: &str, label: &str, reason: &str) {
        let mut blacklist = self.lock_blacklist();
        let entries = blacklist.entry(chain.to_string()).or_default();
        if entries.contains_key(label) {
            return;
        }
        entries.insert(
            label.to_string(),
            BlacklistEntry {
                reason: reason.to_string(),
                blacklisted_at: Utc::now(),
            },
        );

        warn!(chain = %chain, label = %label, reason = %reason, "Credential blacklisted");
        self.persist_blacklist(&blacklist);
    }

    pub fn is_blacklisted(&self, chain: &str, label: &str) -> bool {
        self.lock_blacklist()
            .get(chain)
            .map_or(false, |entries| entries.contains_key(label))
    }

    pub fn blacklisted(&self) -> Blacklist {
        self.lock_blacklist().clone()
    }

    /// Clear one chain's entries, or all of them. Returns how many were removed.
    pub fn clear_blacklist(&self, chain: Option<&str>) -> usize {
        let mut blacklist = self.lock_blacklist();
        let removed = match chain {
            Some(chain) => blacklist.remove(chain).map_or(0, |entries| entries.len()),
            None => {
                let count = blacklist.values().map(|entries| entries.len()).sum();
                blacklist.clear();
                count
            }
        };

        if removed > 0 {
            info!(chain = ?chain, removed, "Credential blacklist cleared");
            self.persist_blacklist(&blacklist);
        }
        removed
    }

    fn active_credentials(&self, chain: &str, pool: &ChainPool) -> Vec<Arc<EndpointSlot>> {
        let blacklist = self.lock_blacklist();
        let banned = blacklist.get(chain);
        pool.credentials
            .iter()
            .filter(|slot| banned.map_or(true, |entries| !entries.contains_key(&slot.label)))
            .cloned()
            .collect()
    }

    fn persist_blacklist(&self, blacklist: &Blacklist) {
        if let Some(path) = &self.blacklist_path {
            if let Err(err) = write_json_atomic(path, blacklist) {
                warn!(path = %path.display(), error = %err, "Failed to persist key blacklist");
            }
        }
    }

    fn lock_blacklist(&self) -> std::sync::MutexGuard<'_, Blacklist> {
        self.blacklist
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ConnectionPoolBuilder {
    chains: HashMap<String, ChainPool>,
    blacklist_path: Option<PathBuf>,
    rpc_timeout: Duration,
    retry: RetryConfig,
}

impl Default for ConnectionPoolBuilder {
    fn default() -> Self {
        Self {
            chains: HashMap::new(),
            blacklist_path: None,
            rpc_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl ConnectionPoolBuilder {
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn blacklist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.blacklist_path = Some(path.into());
        self
    }

    /// Register a chain, possibly without any endpoint.
    pub fn chain(mut self, chain: &str, log_chunk_size: u64) -> Self {
        self.chains
            .entry(chain.to_string())
            .or_insert_with(|| ChainPool::new(log_chunk_size))
            .log_chunk_size = log_chunk_size.max(1);
        self
    }

    pub fn credential(
        mut self,
        chain: &str,
        label: &str,
        client: Arc<dyn ChainClient>,
        calls_per_second: f64,
    ) -> Result<Self, PoolError> {
        let limiter = RateLimiter::new(format!("{}/{}", chain, label), calls_per_second)?;
        self.pool_mut(chain).credentials.push(Arc::new(EndpointSlot {
            label: label.to_string(),
            public: false,
            client,
            limiter: Arc::new(limiter),
        }));
        Ok(self)
    }

    pub fn public_endpoint(
        mut self,
        chain: &str,
        label: &str,
        client: Arc<dyn ChainClient>,
        calls_per_second: Option<f64>,
    ) -> Result<Self, PoolError> {
        let name = format!("{}/{}", chain, label);
        let limiter = match calls_per_second {
            Some(rate) => RateLimiter::new(name, rate)?,
            None => RateLimiter::unlimited(name),
        };
        self.pool_mut(chain).public.push(Arc::new(EndpointSlot {
            label: label.to_string(),
            public: true,
            client,
            limiter: Arc::new(limiter),
        }));
        Ok(self)
    }

    pub fn build(self) -> Result<ConnectionPool, PoolError> {
        let blacklist = match &self.blacklist_path {
            Some(path) => match read_json_if_exists::<Blacklist>(path) {
                Ok(loaded) => loaded.unwrap_or_default(),
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    warn!(path = %path.display(), error = %err, "Ignoring unreadable key blacklist");
                    Blacklist::new()
                }
                Err(err) => {
                    return Err(PoolError::Persistence {
                        path: path.display().to_string(),
                        message: err.to_string(),
                    })
                }
            },
            None => Blacklist::new(),
        };

        let banned: usize = blacklist.values().map(|entries| entries.len()).sum();
        debug!(
            chains = self.chains.len(),
            blacklisted = banned,
            "Connection pool ready"
        );

        Ok(ConnectionPool {
            chains: self.chains,
            blacklist: Mutex::new(blacklist),
            blacklist_path: self.blacklist_path,
            rpc_timeout: self.rpc_timeout,
            retry: self.retry,
        })
    }

    fn pool_mut(&mut self, chain: &str) -> &mut ChainPool {
        self.chains
            .entry(chain.to_string())
            .or_insert_with(|| ChainPool::new(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::SimulatedChain;
    use tempfile::TempDir;

    fn chain() -> Arc<SimulatedChain> {
        Arc::new(SimulatedChain::regular(1_700_000_000, 12, 100))
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_round_robin_over_credentials() {
        let pool = ConnectionPool::builder()
            .credential("ethereum", "a", chain(), 100.0)
            .unwrap()
            .credential("ethereum", "b", chain(), 100.0)
            .unwrap()
            .public_endpoint("ethereum", "public-0", chain(), None)
            .unwrap()
            .build()
            .unwrap();

        let labels: Vec<String> = (0..4)
            .map(|_| pool.next("ethereum").unwrap().label().to_string())
            .collect();
        assert_eq!(labels, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_public_fallback_and_no_endpoint() {
        let pool = ConnectionPool::builder()
            .public_endpoint("base", "public-0", chain(), None)
            .unwrap()
            .chain("linea", 10)
            .build()
            .unwrap();

        let handle = pool.next("base").unwrap();
        assert!(handle.is_public());

        assert!(!pool.has_endpoints("linea"));
        assert!(matches!(
            pool.next("linea"),
            Err(PoolError::NoEndpointAvailable { .. })
        ));
        assert!(matches!(pool.next("fantom"), Err(PoolError::UnknownChain(_))));
    }

    #[test]
    fn test_blacklist_persists_and_clears() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".key_blacklist.json");

        let build = || {
            ConnectionPool::builder()
                .blacklist_path(&path)
                .credential("ethereum", "a", chain(), 100.0)
                .unwrap()
                .credential("ethereum", "b", chain(), 100.0)
                .unwrap()
                .build()
                .unwrap()
        };

        let pool = build();
        pool.blacklist("ethereum", "a", "401 Unauthorized");
        assert!(path.exists());
        for _ in 0..3 {
            assert_eq!(pool.next("ethereum").unwrap().label(), "b");
        }

        let reloaded = build();
        assert!(reloaded.is_blacklisted("ethereum", "a"));
        reloaded.blacklist("ethereum", "b", "401 Unauthorized");
        assert!(!reloaded.has_endpoints("ethereum"));

        assert_eq!(reloaded.clear_blacklist(Some("ethereum")), 2);
        assert!(reloaded.has_endpoints("ethereum"));
        assert!(!build().is_blacklisted("ethereum", "a"));
    }

    #[test]
    fn test_endpoints_lists_every_slot() {
        let pool = ConnectionPool::builder()
            .credential("ethereum", "a", chain(), 100.0)
            .unwrap()
            .credential("ethereum", "b", chain(), 100.0)
            .unwrap()
            .public_endpoint("ethereum", "public-0", chain(), None)
            .unwrap()
            .build()
            .unwrap();
        pool.blacklist("ethereum", "a", "401");

        let labels: Vec<(String, bool)> = pool
            .endpoints("ethereum")
            .unwrap()
            .iter()
            .map(|handle| (handle.label().to_string(), handle.is_public()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("a".to_string(), false),
                ("b".to_string(), false),
                ("public-0".to_string(), true),
            ]
        );
        assert!(matches!(pool.endpoints("fantom"), Err(PoolError::UnknownChain(_))));
    }

    #[test]
    fn test_concurrent_blacklisting_keeps_every_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".key_blacklist.json");

        let build = || {
            let mut builder = ConnectionPool::builder().blacklist_path(&path);
            for i in 0..16 {
                builder = builder
                    .credential("ethereum", &format!("k{}", i), chain(), 100.0)
                    .unwrap();
            }
            builder.build().unwrap()
        };

        let pool = build();
        std::thread::scope(|scope| {
            for i in 0..16 {
                let pool = &pool;
                scope.spawn(move || pool.blacklist("ethereum", &format!("k{}", i), "401"));
            }
        });

        let on_disk: Blacklist = read_json_if_exists(&path).unwrap().unwrap();
        assert_eq!(on_disk["ethereum"].len(), 16);

        let reloaded = build();
        for i in 0..16 {
            assert!(reloaded.is_blacklisted("ethereum", &format!("k{}", i)));
        }
        assert!(!reloaded.has_endpoints("ethereum"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_call_with_retry_rotates_past_unauthorized_key() {
        let bad = chain();
        bad.fail_next(RpcError::Unauthorized {
            endpoint: "bad".to_string(),
            message: "401".to_string(),
        });
        let good = chain();

        let pool = ConnectionPool::builder()
            .retry(fast_retry())
            .credential("ethereum", "bad", bad.clone(), 1000.0)
            .unwrap()
            .credential("ethereum", "good", good.clone(), 1000.0)
            .unwrap()
            .build()
            .unwrap();

        let latest = pool
            .call_with_retry("ethereum", "latest_block", |handle| async move {
                handle.latest_block().await
            })
            .await
            .unwrap();

        assert_eq!(latest, 99);
        assert!(pool.is_blacklisted("ethereum", "bad"));
        assert_eq!(good.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_response_starts_backoff() {
        let flaky = chain();
        flaky.fail_next(RpcError::RateLimited {
            endpoint: "a".to_string(),
            message: "429".to_string(),
        });
        let pool = ConnectionPool::builder()
            .credential("ethereum", "a", flaky, 1000.0)
            .unwrap()
            .build()
            .unwrap();

        let handle = pool.next("ethereum").unwrap();
        assert!(handle.block_timestamp(1).await.unwrap_err().is_rate_limited());
        assert!(handle.limiter().backoff_remaining().is_some());
    }

    #[tokio::test]
    async fn test_rpc_timeout_is_enforced() {
        let slow = Arc::new(
            SimulatedChain::regular(0, 12, 10).with_latency(Duration::from_millis(200)),
        );
        let pool = ConnectionPool::builder()
            .rpc_timeout(Duration::from_millis(20))
            .credential("ethereum", "slow", slow, 1000.0)
            .unwrap()
            .build()
            .unwrap();

        let err = pool.next("ethereum").unwrap().latest_block().await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::Timeout);
    }

    #[test]
    fn test_chunk_ranges_follow_chain_setting() {
        let pool = ConnectionPool::builder()
            .chain("bsc", 5)
            .public_endpoint("bsc", "public-0", chain(), None)
            .unwrap()
            .build()
            .unwrap();

        let handle = pool.next("bsc").unwrap();
        assert_eq!(handle.log_chunk_size(), 5);
        assert_eq!(handle.chunk_ranges(1, 12), vec![(1, 5), (6, 10), (11, 12)]);
    }
}
