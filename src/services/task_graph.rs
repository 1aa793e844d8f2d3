use tracing::debug;

use crate::models::{Task, TaskId, TaskState, Unit};
use crate::services::checkpoint::CheckpointSnapshot;
use crate::utils::time::DateRange;

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    /// Re-include tasks the checkpoint records as failed.
    pub retry_failed: bool,
    /// Failed tasks with this many failed runs are not retried.
    pub max_task_attempts: u32,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            retry_failed: true,
            max_task_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Tasks to execute, units in configuration order then dates ascending.
    pub pending: Vec<Task>,
    pub skipped: Vec<Task>,
    pub already_completed: usize,
    /// Failed tasks left alone because retrying was not requested.
    pub held_failed: Vec<TaskId>,
    /// Failed tasks whose attempt budget is spent.
    pub exhausted: Vec<TaskId>,
}

impl Plan {
    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.pending.iter().map(Task::id).collect()
    }
}

/// Expand `units x range` into the tasks that still need to run. Planning is
/// a pure function of its inputs, so replanning never duplicates work.
pub fn plan(
    units: &[Unit],
    range: &DateRange,
    checkpoint: &CheckpointSnapshot,
    options: &PlanOptions,
) -> Plan {
    let dates = range.dates();
    let mut plan = Plan::default();

    for unit in units {
        for &date in &dates {
            if !unit.is_deployed_on(date) {
                plan.skipped.push(Task {
                    unit: unit.clone(),
                    date,
                    state: TaskState::SkippedPredeployment,
                });
                continue;
            }

            let id = TaskId::new(unit.name.clone(), date);
            if checkpoint.is_completed(&id) {
                plan.already_completed += 1;
                continue;
            }

            if let Some(failure) = checkpoint.failure(&id) {
                if !options.retry_failed {
                    plan.held_failed.push(id);
                    continue;
                }
                if failure.attempts >= options.max_task_attempts {
                    plan.exhausted.push(id);
                    continue;
                }
            }

            plan.pending.push(Task::pending(unit.clone(), date));
        }
    }

    debug!(
        pending = plan.pending.len(),
        skipped = plan.skipped.len(),
        completed = plan.already_completed,
        held = plan.held_failed.len(),
        exhausted = plan.exhausted.len(),
        "Task plan built"
    );
    plan
}
