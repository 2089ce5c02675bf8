//! Pure facet step changer

use crate::ast::FacetBody;
use crate::evaluator::{EvaluatorError, ExecutionContext, ResolvedFacet};
use crate::expr::{evaluate, MapScope};
use crate::states::StepState;
use crate::step::StepDefinition;

/// Evaluate a pure facet's compute body over its parameters and complete
/// in a single pass.
pub async fn on_created(
    mut step: StepDefinition,
    context: &mut ExecutionContext,
) -> Result<StepDefinition, EvaluatorError> {
    let resolved = context
        .facet_definition(&step.facet_name)
        .ok_or_else(|| EvaluatorError::UnknownFacet(step.facet_name.clone()))?;

    let ResolvedFacet::Facet(decl) = resolved else {
        return Err(EvaluatorError::UnknownFacet(format!(
            "'{}' is not a pure facet",
            step.facet_name
        )));
    };

    let Some(FacetBody::ComputeBlock { exprs }) = decl.body else {
        return Err(EvaluatorError::MissingAst(format!(
            "facet '{}' has no compute body",
            step.facet_name
        )));
    };

    let params = step.param_values();
    let scope = MapScope(&params);
    let mut computed = Vec::with_capacity(exprs.len());
    for (name, expr) in &exprs {
        computed.push((name.clone(), evaluate(expr, &scope)?));
    }
    for (name, value) in computed {
        step.set_return(name, value);
    }

    step.set_state(StepState::FacetComplete);
    Ok(step)
}
