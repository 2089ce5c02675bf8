//! Statement step changers

use super::{build_block_scope, child_error_message};
use crate::ast::FacetBody;
use crate::evaluator::{EvaluatorError, ExecutionContext, ResolvedFacet};
use crate::expr::evaluate;
use crate::states::StepState;
use crate::step::{ObjectType, StepDefinition};
use crate::value::ValueMap;

/// Resolve and invoke the statement's facet once every dependency-graph
/// predecessor has completed. Creates exactly one child step: an event
/// facet, a pure facet, or a nested block.
pub async fn on_created(
    mut step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    let block_id = step
        .block_id
        .clone()
        .ok_or_else(|| EvaluatorError::Invariant(format!("statement {} has no block", step.id)))?;
    let statement_id = step.statement_id.clone().ok_or_else(|| {
        EvaluatorError::Invariant(format!("statement step {} has no statement id", step.id))
    })?;

    let block_step = context
        .find_step(&block_id)
        .await?
        .ok_or_else(|| EvaluatorError::MissingAst(format!("block step {block_id} not found")))?;
    let ast = context
        .get_block_ast(block_step.clone())
        .await?
        .ok_or_else(|| EvaluatorError::MissingAst(format!("no AST for block step {block_id}")))?;
    let graph = context.block_graph(&block_id, &ast)?;

    let stmt = graph
        .statement(&statement_id)
        .ok_or_else(|| {
            EvaluatorError::MissingAst(format!(
                "statement {statement_id} not in block {block_id} AST"
            ))
        })?
        .clone();

    // Readiness: every direct predecessor in the dependency graph must be
    // complete before this statement may run.
    let members = context.members_of_block(&block_id).await?;
    for predecessor in graph.predecessors(&statement_id) {
        let done = members.iter().any(|m| {
            m.object_type == ObjectType::Statement
                && m.statement_id.as_deref() == Some(predecessor.id.as_str())
                && m.is_complete()
        });
        if !done {
            return Ok(step);
        }
    }

    let scope = build_block_scope(context, &block_step).await?;

    // Qualified facet resolution, then implicit arguments overlaid by the
    // statement's explicit arguments.
    let target = stmt.call.target.clone();
    let qualified = if target.contains('.') {
        target.clone()
    } else {
        context.resolve_qualified_name(&target)
    };
    let resolved = context
        .facet_definition(&qualified)
        .or_else(|| context.facet_definition(&target))
        .ok_or_else(|| EvaluatorError::UnknownFacet(target.clone()))?;

    let mut args = ValueMap::new();
    if let Some(implicit) = context.implicit_args(&qualified) {
        for arg in &implicit.args {
            args.insert(arg.name.clone(), evaluate(&arg.value, &scope)?);
        }
    }
    for arg in &stmt.call.args {
        args.insert(arg.name.clone(), evaluate(&arg.value, &scope)?);
    }

    step.facet_name = qualified.clone();

    let child = if stmt.body.is_some() {
        // Statement-level inline body: run it as a nested block. The block
        // AST is resolved through the containment chain.
        let mut child =
            StepDefinition::create(step.workflow_id.clone(), ObjectType::Block, "")
                .with_container(step.id.clone())
                .with_block(block_id.clone());
        for (name, value) in &args {
            child.set_param(name.clone(), value.clone());
        }
        child
    } else {
        match resolved {
            ResolvedFacet::EventFacet(decl) => {
                let mut child = StepDefinition::create(
                    step.workflow_id.clone(),
                    ObjectType::EventFacet,
                    qualified.clone(),
                )
                .with_container(step.id.clone())
                .with_block(block_id.clone());
                for (name, value) in &args {
                    let hint = decl.param_type(name).map(|t| t.to_string());
                    child.set_param_with_hint(name.clone(), value.clone(), hint);
                }
                child
            }
            ResolvedFacet::Facet(decl) => match &decl.body {
                Some(FacetBody::ComputeBlock { .. }) => {
                    let mut child = StepDefinition::create(
                        step.workflow_id.clone(),
                        ObjectType::Facet,
                        qualified.clone(),
                    )
                    .with_container(step.id.clone())
                    .with_block(block_id.clone());
                    for (name, value) in &args {
                        let hint = decl.param_type(name).map(|t| t.to_string());
                        child.set_param_with_hint(name.clone(), value.clone(), hint);
                    }
                    child
                }
                Some(FacetBody::AndThenBlock { .. }) => {
                    // Facet-level body: a nested block resolved through the
                    // container's facet.
                    let mut child =
                        StepDefinition::create(step.workflow_id.clone(), ObjectType::Block, "")
                            .with_container(step.id.clone())
                            .with_block(block_id.clone());
                    for (name, value) in &args {
                        child.set_param(name.clone(), value.clone());
                    }
                    child
                }
                None => {
                    return Err(EvaluatorError::MissingAst(format!(
                        "facet '{qualified}' has no body"
                    )))
                }
            },
            ResolvedFacet::Workflow(_) => {
                return Err(EvaluatorError::UnknownFacet(format!(
                    "'{qualified}' is a workflow, not a callable facet"
                )))
            }
        }
    };

    context.changes.add_created_step(child);
    step.set_state(StepState::StatementBlocksContinue);
    Ok(step)
}

/// Poll the statement's child step; copy its returns up on completion,
/// propagate its error on failure.
pub async fn on_blocks_continue(
    mut step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    let children = context.children_of(&step.id).await?;

    if let Some(failed) = children.iter().find(|c| c.is_error()) {
        let message = child_error_message(failed);
        step.mark_error(message);
        return Ok(step);
    }

    if !children.is_empty() && children.iter().all(|c| c.is_complete()) {
        for child in &children {
            for (name, attr) in &child.attributes.returns {
                step.attributes.returns.insert(name.clone(), attr.clone());
            }
        }
        step.set_state(StepState::StatementComplete);
        return Ok(step);
    }

    Ok(step)
}
