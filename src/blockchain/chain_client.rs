use alloy::{
    eips::{BlockId, BlockNumberOrTag},
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::error::{classify_failure, FailureCategory};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("Rate limited by {endpoint}: {message}")]
    RateLimited { endpoint: String, message: String },

    #[error("Unauthorized at {endpoint}: {message}")]
    Unauthorized { endpoint: String, message: String },

    #[error("Request to {endpoint} timed out: {message}")]
    Timeout { endpoint: String, message: String },

    #[error("Archive state unavailable at {endpoint}: {message}")]
    ArchiveUnavailable { endpoint: String, message: String },

    #[error("Connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Block {0} not found")]
    BlockNotFound(u64),

    #[error("RPC request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },
}

impl RpcError {
    /// Map a transport or JSON-RPC error message onto a typed variant.
    pub fn from_message(endpoint: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let endpoint = endpoint.to_string();
        match classify_failure(&message) {
            FailureCategory::RateLimit => RpcError::RateLimited { endpoint, message },
            FailureCategory::Auth => RpcError::Unauthorized { endpoint, message },
            FailureCategory::ArchiveUnavailable => {
                RpcError::ArchiveUnavailable { endpoint, message }
            }
            FailureCategory::Connection => RpcError::Connection { endpoint, message },
            FailureCategory::Timeout => RpcError::Timeout { endpoint, message },
            _ => RpcError::Request { endpoint, message },
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            RpcError::RateLimited { .. } => FailureCategory::RateLimit,
            RpcError::Unauthorized { .. } => FailureCategory::Auth,
            RpcError::Timeout { .. } => FailureCategory::Timeout,
            RpcError::ArchiveUnavailable { .. } => FailureCategory::ArchiveUnavailable,
            RpcError::Connection { .. } => FailureCategory::Connection,
            RpcError::BlockNotFound(_) | RpcError::Request { .. } => FailureCategory::Other,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RpcError::RateLimited { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RpcError::Unauthorized { .. })
    }

    /// Worth repeating on the same or another endpoint within one call.
    pub fn is_transient(&self) -> bool {
        self.category().is_transient()
    }
}

/// Read-only view of one chain endpoint. Every method is a single RPC call.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block(&self) -> Result<u64, RpcError>;

    /// Unix seconds of `block`.
    async fn block_timestamp(&self, block: u64) -> Result<i64, RpcError>;

    /// Size of the deployed bytecode at `address` as of `block`; zero when no
    /// contract exists yet.
    async fn code_size_at(&self, address: Address, block: u64) -> Result<usize, RpcError>;

    async fn balance_at(&self, address: Address, block: u64) -> Result<U256, RpcError>;
}

/// `ChainClient` over an alloy HTTP provider.
#[derive(Debug, Clone)]
pub struct AlloyChainClient {
    provider: RootProvider<Http<Client>>,
    label: String,
}

impl AlloyChainClient {
    pub fn new(url: Url, label: impl Into<String>) -> Self {
        let provider = ProviderBuilder::new().on_http(url);
        Self {
            provider,
            label: label.into(),
        }
    }

    fn error(&self, err: impl std::fmt::Display) -> RpcError {
        RpcError::from_message(&self.label, err.to_string())
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn latest_block(&self) -> Result<u64, RpcError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| self.error(e))
    }

    async fn block_timestamp(&self, block: u64) -> Result<i64, RpcError> {
        let header = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block), false)
            .await
            .map_err(|e| self.error(e))?
            .ok_or(RpcError::BlockNotFound(block))?;

        i64::try_from(header.header.timestamp).map_err(|_| RpcError::Request {
            endpoint: self.label.clone(),
            message: format!("timestamp of block {} overflows", block),
        })
    }

    async fn code_size_at(&self, address: Address, block: u64) -> Result<usize, RpcError> {
        let code = self
            .provider
            .get_code_at(address)
            .block_id(BlockId::number(block))
            .await
            .map_err(|e| self.error(e))?;
        Ok(code.len())
    }

    async fn balance_at(&self, address: Address, block: u64) -> Result<U256, RpcError> {
        self.provider
            .get_balance(address)
            .block_id(BlockId::number(block))
            .await
            .map_err(|e| self.error(e))
    }
}
