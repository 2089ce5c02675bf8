//! Workflow root step changers

use super::child_error_message;
use crate::evaluator::{EvaluatorError, ExecutionContext};
use crate::states::StepState;
use crate::step::{ObjectType, StepDefinition};

/// Expand the workflow root: one block step per body block, ordered by
/// `block-N` statement ids.
pub async fn on_created(
    mut step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    let body_len = context.workflow_ast.body.len();

    for index in 0..body_len {
        let child = StepDefinition::create(step.workflow_id.clone(), ObjectType::Block, "")
            .with_statement_id(format!("block-{index}"))
            .with_container(step.id.clone());
        context.changes.add_created_step(child);
    }

    step.set_state(StepState::StatementBlocksContinue);
    Ok(step)
}

/// Poll the body blocks. When every block completes, the final block's
/// returns become the workflow's outputs; any block error propagates to
/// the root.
pub async fn on_blocks_continue(
    mut step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    let body_len = context.workflow_ast.body.len();
    let blocks: Vec<StepDefinition> = context
        .children_of(&step.id)
        .await?
        .into_iter()
        .filter(|c| c.object_type == ObjectType::Block)
        .collect();

    if let Some(failed) = blocks.iter().find(|c| c.is_error()) {
        let message = child_error_message(failed);
        step.mark_error(message);
        return Ok(step);
    }

    if blocks.len() == body_len && blocks.iter().all(|c| c.is_complete()) {
        let final_id = format!("block-{}", body_len.saturating_sub(1));
        if let Some(final_block) = blocks
            .iter()
            .find(|c| c.statement_id.as_deref() == Some(final_id.as_str()))
        {
            for (name, attr) in &final_block.attributes.returns {
                step.attributes.returns.insert(name.clone(), attr.clone());
            }
        }
        step.set_state(StepState::WorkflowComplete);
        return Ok(step);
    }

    Ok(step)
}
