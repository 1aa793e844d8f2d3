use std::sync::Arc;

use alloy::primitives::Address;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::Unit;
use crate::services::connection_pool::{ConnectionPool, PoolError};
use crate::utils::time::date_of_timestamp;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Unit {unit} has invalid registry address {address}")]
    InvalidAddress { unit: String, address: String },

    #[error("No contract code at {address} on {chain} as of the latest block")]
    NotDeployed { chain: String, address: String },

    #[error("Block timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    pub unit: String,
    pub chain: String,
    pub block: u64,
    pub timestamp: i64,
    /// Civil date of `block` in the configured timezone.
    pub date: NaiveDate,
}

/// Finds the first block at which a unit's registry has bytecode. Useful for
/// filling in missing or estimated deployment dates.
pub struct DeploymentProbe {
    pool: Arc<ConnectionPool>,
    timezone: Tz,
}

impl DeploymentProbe {
    pub fn new(pool: Arc<ConnectionPool>, timezone: Tz) -> Self {
        Self { pool, timezone }
    }

    pub async fn find_deployment(&self, unit: &Unit) -> Result<Deployment, ProbeError> {
        let chain = unit.chain.as_str();
        let address = unit.address().ok_or_else(|| ProbeError::InvalidAddress {
            unit: unit.name.clone(),
            address: unit.registry_address.clone(),
        })?;

        let latest = self
            .pool
            .call_with_retry(chain, "latest_block", |handle| async move {
                handle.latest_block().await
            })
            .await?;

        if !self.has_code(chain, address, latest).await? {
            return Err(ProbeError::NotDeployed {
                chain: chain.to_string(),
                address: unit.registry_address.clone(),
            });
        }

        // invariant: no code at lo, code at hi
        let mut lo = 0u64;
        let mut hi = latest;
        let mut probes = 0u32;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            probes += 1;
            if self.has_code(chain, address, mid).await? {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        let timestamp = self
            .pool
            .call_with_retry(chain, "block_timestamp", move |handle| async move {
                handle.block_timestamp(hi).await
            })
            .await?;
        let date = date_of_timestamp(timestamp, &self.timezone)
            .ok_or(ProbeError::InvalidTimestamp(timestamp))?;

        debug!(unit = %unit.name, probes, "Deployment search converged");
        info!(unit = %unit.name, chain = %chain, block = hi, %date, "Deployment found");

        Ok(Deployment {
            unit: unit.name.clone(),
            chain: chain.to_string(),
            block: hi,
            timestamp,
            date,
        })
    }

    async fn has_code(&self, chain: &str, address: Address, block: u64) -> Result<bool, ProbeError> {
        let size = self
            .pool
            .call_with_retry(chain, "code_size_at", move |handle| async move {
                handle.code_size_at(address, block).await
            })
            .await?;
        Ok(size > 0)
    }
}
