//! Block and foreach-body step changers

use indexmap::IndexMap;

use super::{build_block_scope, child_error_message};
use crate::dependency::DependencyGraph;
use crate::evaluator::{EvaluatorError, ExecutionContext};
use crate::expr::evaluate;
use crate::states::StepState;
use crate::step::{ObjectType, StepDefinition};
use crate::value::Value;

/// Expand a block: build the dependency graph and create its statement
/// steps in dependency order, or spawn one sub-block per foreach element.
pub async fn on_created(
    mut step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    let ast = context
        .get_block_ast(step.clone())
        .await?
        .ok_or_else(|| EvaluatorError::MissingAst(format!("no AST for block step {}", step.id)))?;

    if let Some(foreach) = ast.foreach.clone() {
        let scope = build_block_scope(context, &step).await?;
        let items = match evaluate(&foreach.source, &scope)? {
            Value::List(items) => items,
            other => return Err(EvaluatorError::ForeachSource(other.type_name())),
        };

        let body = ast.body_without_foreach();
        for (index, item) in items.into_iter().enumerate() {
            let mut sub = StepDefinition::create(
                step.workflow_id.clone(),
                ObjectType::ForeachBody,
                "",
            )
            .with_statement_id(format!("item-{index}"))
            .with_container(step.id.clone())
            .with_block(step.id.clone())
            .with_foreach_var(foreach.var.clone());
            sub.set_param(foreach.var.clone(), item);

            context.set_block_ast_cache(sub.id.clone(), body.clone());
            context.changes.add_created_step(sub);
        }
    } else {
        let graph = DependencyGraph::build(&ast)?;
        for stmt in graph.ordered_statements() {
            let child = StepDefinition::create(
                step.workflow_id.clone(),
                ObjectType::Statement,
                stmt.call.target.clone(),
            )
            .with_statement_id(stmt.id.clone())
            .with_container(step.id.clone())
            .with_block(step.id.clone());
            context.changes.add_created_step(child);
        }
        context.set_block_graph(step.id.clone(), graph);
    }

    step.set_state(StepState::BlockExecutionContinue);
    Ok(step)
}

/// Poll a block's members. Once every member completes, evaluate the yield
/// map into the block's returns (foreach blocks aggregate per-iteration
/// values into ordered lists). Member errors propagate.
pub async fn on_execution_continue(
    mut step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    let ast = context
        .get_block_ast(step.clone())
        .await?
        .ok_or_else(|| EvaluatorError::MissingAst(format!("no AST for block step {}", step.id)))?;

    let members: Vec<StepDefinition> = context
        .members_of_block(&step.id)
        .await?
        .into_iter()
        .filter(|m| {
            m.container_id.as_deref() == Some(step.id.as_str())
                && matches!(
                    m.object_type,
                    ObjectType::Statement | ObjectType::ForeachBody
                )
        })
        .collect();

    if let Some(failed) = members.iter().find(|m| m.is_error()) {
        let message = child_error_message(failed);
        step.mark_error(message);
        return Ok(step);
    }

    if ast.foreach.is_some() {
        if !members.iter().all(|m| m.is_complete()) {
            return Ok(step);
        }

        // Aggregate per-name lists in sub-block creation order.
        let mut ordered = members;
        ordered.sort_by_key(|m| {
            m.statement_id
                .as_deref()
                .and_then(|sid| sid.strip_prefix("item-"))
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(usize::MAX)
        });

        let names: Vec<String> = match &ast.yields {
            Some(yields) => yields.keys().cloned().collect(),
            None => ordered
                .first()
                .map(|m| m.attributes.returns.keys().cloned().collect())
                .unwrap_or_default(),
        };

        let mut aggregated: IndexMap<String, Vec<Value>> = IndexMap::new();
        for name in &names {
            aggregated.insert(name.clone(), Vec::with_capacity(ordered.len()));
        }
        for member in &ordered {
            let returns = member.return_values();
            for name in &names {
                let value = returns.get(name).cloned().unwrap_or(Value::Null);
                if let Some(list) = aggregated.get_mut(name) {
                    list.push(value);
                }
            }
        }
        for (name, values) in aggregated {
            step.set_return(name, Value::List(values));
        }
        step.set_state(StepState::BlockComplete);
        return Ok(step);
    }

    let expected = ast.steps.len();
    if members.len() == expected && members.iter().all(|m| m.is_complete()) {
        if let Some(yields) = &ast.yields {
            let scope = build_block_scope(context, &step).await?;
            for (name, expr) in yields {
                let value = evaluate(expr, &scope)?;
                step.set_return(name.clone(), value);
            }
        }
        step.set_state(StepState::BlockComplete);
        return Ok(step);
    }

    Ok(step)
}
