use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::utils::time::DayWindow;

/// The block that represents the end of one civil day on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapping {
    pub chain: String,
    pub date: NaiveDate,
    pub block: u64,
    /// Unix seconds of `block`.
    pub timestamp: i64,
    pub window: DayWindow,
}
