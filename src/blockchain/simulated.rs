//! Deterministic in-memory chain. Block `n` has the timestamp at index `n`;
//! block 0 is genesis.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::blockchain::{ChainClient, RpcError};

const SIMULATED_CODE_SIZE: usize = 2048;

#[derive(Debug, Default)]
struct ChainState {
    timestamps: Vec<i64>,
    deployments: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    failures: VecDeque<RpcError>,
    outage: Option<RpcError>,
}

#[derive(Debug, Default)]
pub struct SimulatedChain {
    state: Mutex<ChainState>,
    calls: AtomicU64,
    latency: Option<Duration>,
}

impl SimulatedChain {
    pub fn with_timestamps(timestamps: Vec<i64>) -> Self {
        Self {
            state: Mutex::new(ChainState {
                timestamps,
                ..Default::default()
            }),
            calls: AtomicU64::new(0),
            latency: None,
        }
    }

    /// `count` blocks spaced `block_time` seconds apart starting at `genesis`.
    pub fn regular(genesis: i64, block_time: i64, count: u64) -> Self {
        let timestamps = (0..count as i64).map(|n| genesis + n * block_time).collect();
        Self::with_timestamps(timestamps)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn deploy(&self, address: Address, block: u64) {
        self.lock().deployments.insert(address, block);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.lock().balances.insert(address, balance);
    }

    pub fn set_timestamp(&self, block: u64, timestamp: i64) {
        if let Some(slot) = self.lock().timestamps.get_mut(block as usize) {
            *slot = timestamp;
        }
    }

    /// Append blocks to the tip.
    pub fn extend(&self, timestamps: impl IntoIterator<Item = i64>) {
        self.lock().timestamps.extend(timestamps);
    }

    /// The next call fails with `error` instead of answering.
    pub fn fail_next(&self, error: RpcError) {
        self.lock().failures.push_back(error);
    }

    /// Every call fails with `error` until called again with `None`.
    pub fn set_outage(&self, error: Option<RpcError>) {
        self.lock().outage = error;
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_call_count(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn begin_call(&self) -> Result<(), RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        if let Some(err) = &state.outage {
            return Err(err.clone());
        }
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn latest_block(&self) -> Result<u64, RpcError> {
        self.begin_call().await?;
        let len = self.lock().timestamps.len() as u64;
        Ok(len.saturating_sub(1))
    }

    async fn block_timestamp(&self, block: u64) -> Result<i64, RpcError> {
        self.begin_call().await?;
        self.lock()
            .timestamps
            .get(block as usize)
            .copied()
            .ok_or(RpcError::BlockNotFound(block))
    }

    async fn code_size_at(&self, address: Address, block: u64) -> Result<usize, RpcError> {
        self.begin_call().await?;
        let state = self.lock();
        if block as usize >= state.timestamps.len() {
            return Err(RpcError::BlockNotFound(block));
        }
        Ok(match state.deployments.get(&address) {
            Some(deployed) if block >= *deployed => SIMULATED_CODE_SIZE,
            _ => 0,
        })
    }

    async fn balance_at(&self, address: Address, block: u64) -> Result<U256, RpcError> {
        self.begin_call().await?;
        let state = self.lock();
        if block as usize >= state.timestamps.len() {
            return Err(RpcError::BlockNotFound(block));
        }
        Ok(state.balances.get(&address).copied().unwrap_or(U256::ZERO))
    }
}
