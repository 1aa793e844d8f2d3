use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FailureCategory;
use crate::models::Unit;
use crate::utils::time::{parse_date, DATE_FORMAT};

/// Stable identity of a work item. Rendered as `unit:YYYY-MM-DD`, which is
/// also its checkpoint representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub unit: String,
    pub date: NaiveDate,
}

impl TaskId {
    pub fn new(unit: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            unit: unit.into(),
            date,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.date.format(DATE_FORMAT))
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (unit, date) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("task id '{}' is not of the form unit:date", s))?;
        if unit.is_empty() {
            return Err(format!("task id '{}' has an empty unit", s));
        }
        let date = parse_date(date).map_err(|e| e.to_string())?;
        Ok(TaskId::new(unit, date))
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    SkippedPredeployment,
    Completed,
    Failed { reason: String },
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::SkippedPredeployment => "skipped_predeployment",
            TaskState::Completed => "completed",
            TaskState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub unit: Unit,
    pub date: NaiveDate,
    pub state: TaskState,
}

impl Task {
    pub fn pending(unit: Unit, date: NaiveDate) -> Self {
        Self {
            unit,
            date,
            state: TaskState::Pending,
        }
    }

    pub fn id(&self) -> TaskId {
        TaskId::new(self.unit.name.clone(), self.date)
    }
}

/// Result of executing one task, as reported to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed {
        reason: String,
        category: FailureCategory,
    },
}

impl TaskOutcome {
    pub fn failed(reason: impl Into<String>, category: FailureCategory) -> Self {
        TaskOutcome::Failed {
            reason: reason.into(),
            category,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}
