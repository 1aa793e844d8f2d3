use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapters::traits::{Collector, CollectorError};
use crate::models::{BlockMapping, Unit};
use crate::services::connection_pool::EndpointHandle;

/// Protocol-agnostic snapshot of a unit's registry contract: bytecode size
/// and native balance at the resolved block. Fails when the contract does
/// not exist yet, which also catches optimistic deployment dates.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryProbeCollector;

#[async_trait]
impl Collector for RegistryProbeCollector {
    fn name(&self) -> &'static str {
        "registry_probe"
    }

    async fn collect(
        &self,
        unit: &Unit,
        mapping: &BlockMapping,
        endpoint: &EndpointHandle,
    ) -> Result<Value, CollectorError> {
        let address = unit.address().ok_or_else(|| {
            CollectorError::InvalidData(format!(
                "{} has invalid registry address {}",
                unit.name, unit.registry_address
            ))
        })?;

        let code_size = endpoint.code_size_at(address, mapping.block).await?;
        if code_size == 0 {
            return Err(CollectorError::NotDeployed {
                address: unit.registry_address.clone(),
                block: mapping.block,
            });
        }
        let balance = endpoint.balance_at(address, mapping.block).await?;

        Ok(json!({
            "registry_code_size": code_size,
            "native_balance_wei": balance.to_string(),
        }))
    }
}
