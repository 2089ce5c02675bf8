//! Event facet step changers
//!
//! An event facet parks at `EventTransmit` and emits a pending task on the
//! queue. Only an external continuation (`continue_step`) advances it; the
//! transmit changer then moves it to its terminal state.

use crate::entities::TaskRecord;
use crate::evaluator::{EvaluatorError, ExecutionContext};
use crate::states::StepState;
use crate::step::StepDefinition;

/// Emit the event task and park the step.
pub async fn on_created(
    mut step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    let mut task = TaskRecord::new(step.facet_name.clone(), context.task_list.clone());
    task.runner_id = context.runner_id.clone();
    task.workflow_id = context.workflow_id.clone();
    task.step_id = step.id.clone();
    task.data_type = "event".to_string();
    task.data = Some(step.param_values());
    context.changes.add_created_task(task);

    step.set_state(StepState::EventTransmit);
    Ok(step)
}

/// Advance a continued event step out of its parked state. Reached only
/// when an external party set `request_transition`; the return attributes
/// were already written by `continue_step` (or directly by an external
/// agent ahead of an `afl:resume` task).
pub async fn on_transmit(
    mut step: StepDefinition,
    _context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    step.request_state_change(false);
    step.set_state(StepState::EventComplete);
    Ok(step)
}
