use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::blockchain::RpcError;
use crate::error::FailureCategory;
use crate::models::{BlockMapping, ProtocolFamily, Unit};
use crate::services::connection_pool::EndpointHandle;

/// Common error type for all collectors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectorError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Task timed out after {0}s")]
    Timeout(u64),

    #[error("No endpoint available for chain {0}")]
    NoEndpoint(String),

    #[error("Registry {address} has no code at block {block}")]
    NotDeployed { address: String, block: u64 },

    #[error("no collector for protocol family {0}")]
    Unsupported(ProtocolFamily),

    #[error("Block resolution failed: {0}")]
    Resolution(String),

    #[error("Invalid unit data: {0}")]
    InvalidData(String),
}

impl CollectorError {
    pub fn category(&self) -> FailureCategory {
        match self {
            CollectorError::Rpc(err) => err.category(),
            CollectorError::Decode(_) | CollectorError::InvalidData(_) => FailureCategory::Decode,
            CollectorError::Timeout(_) => FailureCategory::Timeout,
            CollectorError::NoEndpoint(_) => FailureCategory::NoEndpoint,
            CollectorError::NotDeployed { .. } => FailureCategory::NotDeployed,
            CollectorError::Resolution(_) => FailureCategory::Resolution,
            CollectorError::Unsupported(_) => FailureCategory::Other,
        }
    }

    /// Rate limits and dropped connections; everything else is recorded as
    /// a failed task without another attempt.
    pub fn is_transient(&self) -> bool {
        self.category().is_transient()
    }
}

/// Common interface for all protocol collectors. A collector reads the state
/// of one unit at one block and returns the artifact payload.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Get the collector name
    fn name(&self) -> &'static str;

    async fn collect(
        &self,
        unit: &Unit,
        mapping: &BlockMapping,
        endpoint: &EndpointHandle,
    ) -> Result<Value, CollectorError>;
}

/// Typed dispatch from protocol family to collector.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: HashMap<ProtocolFamily, Arc<dyn Collector>>,
    fallback: Option<Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, family: ProtocolFamily, collector: Arc<dyn Collector>) -> Self {
        self.collectors.insert(family, collector);
        self
    }

    /// Used for every family without a dedicated collector.
    pub fn with_fallback(mut self, collector: Arc<dyn Collector>) -> Self {
        self.fallback = Some(collector);
        self
    }

    pub fn get(&self, family: ProtocolFamily) -> Result<Arc<dyn Collector>, CollectorError> {
        self.collectors
            .get(&family)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or(CollectorError::Unsupported(family))
    }

    pub fn families(&self) -> Vec<ProtocolFamily> {
        let mut families: Vec<_> = self.collectors.keys().copied().collect();
        families.sort();
        families
    }
}
