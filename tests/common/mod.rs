#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use csu_harvester::adapters::{Collector, CollectorError};
use csu_harvester::blockchain::{RpcError, SimulatedChain};
use csu_harvester::config::{ChainSettings, RetrySettings, Settings};
use csu_harvester::error::RetryConfig;
use csu_harvester::models::{BlockMapping, ProtocolFamily, Unit};
use csu_harvester::services::{ConnectionPool, EndpointHandle};
use csu_harvester::utils::time::{day_window, parse_timezone};
use serde_json::{json, Value};

pub const AAVE_POOL: &str = "0x87870Bca3F3fD6335C3F4ce8392D69350B4fA4E2";
pub const COMET_USDC: &str = "0xc3d688B66703497DAA19211EEdff47f25384cdc3";
pub const SPARK_GNOSIS: &str = "0x2a002054A06546bB5a264D57A81347e23Af91D18";
pub const BLOCK_TIME: i64 = 600;

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn new_york() -> Tz {
    parse_timezone("America/New_York").unwrap()
}

pub fn unit(
    name: &str,
    chain: &str,
    address: &str,
    family: ProtocolFamily,
    deployment: Option<&str>,
) -> Unit {
    Unit {
        name: name.to_string(),
        chain: chain.to_string(),
        registry_address: address.to_string(),
        protocol_family: family,
        deployment_date: deployment.map(date),
    }
}

pub fn aave() -> Unit {
    unit("aave_v3_ethereum", "ethereum", AAVE_POOL, ProtocolFamily::AaveV3, None)
}

pub fn comet() -> Unit {
    unit(
        "compound_v3_usdc_ethereum",
        "ethereum",
        COMET_USDC,
        ProtocolFamily::CompoundV3,
        None,
    )
}

/// Ten-minute blocks from an hour before 2024-11-30 (New York) for a week.
pub fn week_chain() -> Arc<SimulatedChain> {
    let genesis = day_window(date("2024-11-30"), &new_york()).unwrap().start_utc - 3600;
    Arc::new(SimulatedChain::regular(genesis, BLOCK_TIME, 7 * 144))
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_factor: 0.0,
        backoff_multiplier: 1.0,
    }
}

/// Settings rooted at `data_dir` with the given chains registered and no
/// real endpoints.
pub fn settings(data_dir: &Path, chains: &[&str], units: Vec<Unit>) -> Settings {
    let mut settings = Settings::default();
    settings.run.data_dir = data_dir.to_path_buf();
    settings.run.workers = 2;
    settings.run.retry = RetrySettings {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_factor: 0.0,
        backoff_multiplier: 1.0,
    };
    for chain in chains {
        settings
            .chains
            .insert(chain.to_string(), ChainSettings::default());
    }
    settings.units = units;
    settings
}

/// One fast credential per simulated chain; `bare` chains are registered
/// without any endpoint.
pub fn pool(simulated: &[(&str, Arc<SimulatedChain>)], bare: &[&str]) -> Arc<ConnectionPool> {
    let mut builder = ConnectionPool::builder()
        .retry(fast_retry())
        .rpc_timeout(Duration::from_secs(5));
    for (chain, client) in simulated {
        builder = builder
            .chain(chain, 10)
            .credential(chain, "sim", client.clone(), 10_000.0)
            .unwrap();
    }
    for chain in bare {
        builder = builder.chain(chain, 10);
    }
    Arc::new(builder.build().unwrap())
}

/// Collector that returns the block it was asked about, failing for chosen
/// units and optionally sleeping first.
#[derive(Default)]
pub struct ScriptedCollector {
    failing: Mutex<HashSet<String>>,
    failure: Mutex<Option<CollectorError>>,
    transient_failures: AtomicU64,
    delay: Option<Duration>,
    calls: AtomicU64,
}

impl ScriptedCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_unit(&self, unit: &str, error: CollectorError) {
        self.failing.lock().unwrap().insert(unit.to_string());
        *self.failure.lock().unwrap() = Some(error);
    }

    /// The next `count` calls fail with a connection error.
    pub fn fail_transiently(&self, count: u64) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn collect(
        &self,
        unit: &Unit,
        mapping: &BlockMapping,
        endpoint: &EndpointHandle,
    ) -> Result<Value, CollectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(CollectorError::Rpc(RpcError::Connection {
                endpoint: endpoint.label().to_string(),
                message: "connection reset by peer".to_string(),
            }));
        }

        if self.failing.lock().unwrap().contains(&unit.name) {
            if let Some(error) = self.failure.lock().unwrap().clone() {
                return Err(error);
            }
        }

        Ok(json!({
            "unit": unit.name,
            "block": mapping.block,
            "endpoint": endpoint.label(),
        }))
    }
}
