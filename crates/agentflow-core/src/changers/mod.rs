//! State changers
//!
//! One changer per (object type, state) pair. A changer may mutate the
//! step's attributes, advance its state, and create child steps or tasks
//! on the iteration's change set. Dispatch is a match over the pair; the
//! evaluator calls [`dispatch`] for every actionable step it processes.

mod block;
mod event;
mod facet;
mod statement;
mod workflow;

use std::collections::HashMap;

use crate::evaluator::{EvaluatorError, ExecutionContext};
use crate::expr::Scope;
use crate::states::StepState;
use crate::step::{ObjectType, StepDefinition};
use crate::value::{Value, ValueMap};

/// Dispatch a step to the state changer for its (object type, state) pair.
/// Changers return the (possibly mutated) step; the evaluator detects
/// progress from the state transition and the transition's dirty flag.
/// Unhandled pairs leave the step untouched.
pub async fn dispatch(
    step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    match (step.object_type, step.state) {
        (ObjectType::Workflow, StepState::Created) => workflow::on_created(step, context).await,
        (ObjectType::Workflow, StepState::StatementBlocksContinue)
        | (ObjectType::Workflow, StepState::MixinBlocksContinue) => {
            workflow::on_blocks_continue(step, context).await
        }

        (ObjectType::Block, StepState::Created)
        | (ObjectType::ForeachBody, StepState::Created) => {
            block::on_created(step, context).await
        }
        (ObjectType::Block, StepState::BlockExecutionContinue)
        | (ObjectType::ForeachBody, StepState::BlockExecutionContinue) => {
            block::on_execution_continue(step, context).await
        }

        (ObjectType::Statement, StepState::Created) => {
            statement::on_created(step, context).await
        }
        (ObjectType::Statement, StepState::StatementBlocksContinue) => {
            statement::on_blocks_continue(step, context).await
        }

        (ObjectType::Facet, StepState::Created) => facet::on_created(step, context).await,

        (ObjectType::EventFacet, StepState::Created) => event::on_created(step, context).await,
        (ObjectType::EventFacet, StepState::EventTransmit) => {
            event::on_transmit(step, context).await
        }

        _ => Ok(step),
    }
}

/// Name resolution inside one block: block-step parameters (including a
/// foreach binding), then the workflow root's persisted parameters, then
/// AST-declared defaults, then completed sibling statements by bind name.
/// The root-step layer is what makes resume work on a worker that never
/// saw the original inputs.
pub struct BlockScope {
    defaults: ValueMap,
    workflow_params: ValueMap,
    block_params: ValueMap,
    statements: HashMap<String, ValueMap>,
}

impl Scope for BlockScope {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.block_params.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.workflow_params.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.defaults.get(name) {
            return Some(value.clone());
        }
        self.statements
            .get(name)
            .map(|returns| Value::Map(returns.clone()))
    }

    fn lookup_member(&self, object: &str, member: &str) -> Option<Value> {
        if let Some(returns) = self.statements.get(object) {
            return returns.get(member).cloned();
        }
        match self.lookup(object) {
            Some(Value::Map(map)) => map.get(member).cloned(),
            _ => None,
        }
    }
}

/// Build the evaluation scope for a block step.
pub(crate) async fn build_block_scope(
    context: &mut ExecutionContext,
    block_step: &StepDefinition,
) -> Result<BlockScope, EvaluatorError> {
    let ast = context
        .get_block_ast(block_step.clone())
        .await?
        .ok_or_else(|| {
            EvaluatorError::MissingAst(format!("no AST for block step {}", block_step.id))
        })?;
    let graph = context.block_graph(&block_step.id, &ast)?;

    let mut statements = HashMap::new();
    for stmt in graph.ordered_statements() {
        let bind_name = stmt.bind_name().to_string();
        if let Some(step) = context
            .get_completed_step_by_name(&bind_name, &block_step.id, &graph)
            .await?
        {
            statements.insert(bind_name, step.return_values());
        }
    }

    Ok(BlockScope {
        defaults: context.workflow_defaults.clone(),
        workflow_params: context.workflow_params().await?,
        block_params: block_step.param_values(),
        statements,
    })
}

/// Error message carried up from a failed child step.
pub(crate) fn child_error_message(child: &StepDefinition) -> String {
    child
        .transition
        .error
        .clone()
        .unwrap_or_else(|| format!("child step {} failed", child.id))
}
