use std::fmt;

use alloy::primitives::Address;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Lending protocol family a unit belongs to. Selects the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    AaveV3,
    SparkLend,
    CompoundV2,
    CompoundV3,
    Venus,
    Benqi,
    Moonwell,
    Kinetic,
    Tectonic,
    Sumer,
    Fluid,
    Gearbox,
    Cap,
    Lista,
    Euler,
    #[serde(other)]
    Other,
}

impl ProtocolFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolFamily::AaveV3 => "aave_v3",
            ProtocolFamily::SparkLend => "spark_lend",
            ProtocolFamily::CompoundV2 => "compound_v2",
            ProtocolFamily::CompoundV3 => "compound_v3",
            ProtocolFamily::Venus => "venus",
            ProtocolFamily::Benqi => "benqi",
            ProtocolFamily::Moonwell => "moonwell",
            ProtocolFamily::Kinetic => "kinetic",
            ProtocolFamily::Tectonic => "tectonic",
            ProtocolFamily::Sumer => "sumer",
            ProtocolFamily::Fluid => "fluid",
            ProtocolFamily::Gearbox => "gearbox",
            ProtocolFamily::Cap => "cap",
            ProtocolFamily::Lista => "lista",
            ProtocolFamily::Euler => "euler",
            ProtocolFamily::Other => "other",
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Credit Supply Unit: one lending market on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub chain: String,
    /// Pool, comptroller or vault registry contract, checksummed or not.
    pub registry_address: String,
    pub protocol_family: ProtocolFamily,
    /// Optional lower bound; several values are estimates.
    #[serde(default)]
    pub deployment_date: Option<NaiveDate>,
}

impl Unit {
    pub fn address(&self) -> Option<Address> {
        self.registry_address.parse().ok()
    }

    /// True when a snapshot for `date` can exist. Units without a known
    /// deployment date are assumed live on every date.
    pub fn is_deployed_on(&self, date: NaiveDate) -> bool {
        self.deployment_date.map_or(true, |deployed| date >= deployed)
    }
}
