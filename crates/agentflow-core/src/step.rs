//! Step records
//!
//! A step is the runtime instance of a workflow, block, statement, facet or
//! event facet. Steps reference their container, block and workflow by
//! opaque id; all navigation goes through the persistence store.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::states::StepState;
use crate::value::{Value, ValueMap};

/// Opaque step id (UUIDv7 rendered as a string).
pub type StepId = String;

/// Opaque workflow id.
pub type WorkflowId = String;

/// Mint a fresh opaque id.
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// What kind of object a step instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Workflow,
    Block,
    Statement,
    Facet,
    EventFacet,
    ForeachBody,
}

/// One named attribute: a value plus the advisory type tag declared in the
/// AST. The runtime records the tag but does not enforce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

impl Attribute {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            type_hint: None,
        }
    }

    pub fn with_type_hint(value: Value, type_hint: Option<String>) -> Self {
        Self { value, type_hint }
    }
}

/// Ordered parameter and return attribute maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default)]
    pub params: IndexMap<String, Attribute>,
    #[serde(default)]
    pub returns: IndexMap<String, Attribute>,
}

/// Mutable control block attached to every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub current_state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by `continue_step`/`fail_step`: an external party wrote a result
    /// and the step should advance out of its parked state.
    #[serde(default)]
    pub request_transition: bool,
    /// Dirty flag set on any write; reset at the persistence boundary.
    #[serde(default)]
    pub changed: bool,
}

impl Transition {
    fn new(state: StepState) -> Self {
        Self {
            current_state: state,
            error: None,
            request_transition: false,
            changed: false,
        }
    }
}

/// The unit of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    pub object_type: ObjectType,
    /// Qualified facet name for facet/event steps; workflow name for roots.
    #[serde(default)]
    pub facet_name: String,
    /// Stable id within the parent block AST (`block-N` / `item-N` for
    /// synthetic block steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_id: Option<String>,
    /// Immediate parent step in the execution tree; `None` only for the
    /// workflow root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<StepId>,
    /// The block step whose sequence this step belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<StepId>,
    pub state: StepState,
    #[serde(default)]
    pub attributes: Attributes,
    pub transition: Transition,
    /// Variable bound by the spawning foreach, set on sub-blocks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach_var: Option<String>,
}

impl StepDefinition {
    /// Create a fresh step in the `Created` state.
    pub fn create(
        workflow_id: impl Into<WorkflowId>,
        object_type: ObjectType,
        facet_name: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            workflow_id: workflow_id.into(),
            object_type,
            facet_name: facet_name.into(),
            statement_id: None,
            container_id: None,
            block_id: None,
            state: StepState::Created,
            attributes: Attributes::default(),
            transition: Transition::new(StepState::Created),
            foreach_var: None,
        }
    }

    pub fn with_statement_id(mut self, statement_id: impl Into<String>) -> Self {
        self.statement_id = Some(statement_id.into());
        self
    }

    pub fn with_container(mut self, container_id: impl Into<StepId>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn with_block(mut self, block_id: impl Into<StepId>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }

    pub fn with_foreach_var(mut self, var: impl Into<String>) -> Self {
        self.foreach_var = Some(var.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn is_error(&self) -> bool {
        self.state.is_error()
    }

    /// Advance the state machine. Also updates the transition record and
    /// marks the step changed.
    pub fn set_state(&mut self, state: StepState) {
        self.state = state;
        self.transition.current_state = state;
        self.transition.changed = true;
    }

    /// Set a parameter attribute and mark the step changed.
    pub fn set_param(&mut self, name: impl Into<String>, value: Value) {
        self.attributes
            .params
            .insert(name.into(), Attribute::new(value));
        self.transition.changed = true;
    }

    /// Set a parameter attribute carrying its declared type tag.
    pub fn set_param_with_hint(
        &mut self,
        name: impl Into<String>,
        value: Value,
        type_hint: Option<String>,
    ) {
        self.attributes
            .params
            .insert(name.into(), Attribute::with_type_hint(value, type_hint));
        self.transition.changed = true;
    }

    /// Set a return attribute and mark the step changed.
    pub fn set_return(&mut self, name: impl Into<String>, value: Value) {
        self.attributes
            .returns
            .insert(name.into(), Attribute::new(value));
        self.transition.changed = true;
    }

    /// Request (or clear) an externally driven state change.
    pub fn request_state_change(&mut self, requested: bool) {
        self.transition.request_transition = requested;
        self.transition.changed = true;
    }

    /// Move the step to `StatementError` with the given message.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.transition.error = Some(message.into());
        self.set_state(StepState::StatementError);
    }

    /// Parameter values without attribute metadata.
    pub fn param_values(&self) -> ValueMap {
        self.attributes
            .params
            .iter()
            .map(|(name, attr)| (name.clone(), attr.value.clone()))
            .collect()
    }

    /// Return values without attribute metadata.
    pub fn return_values(&self) -> ValueMap {
        self.attributes
            .returns
            .iter()
            .map(|(name, attr)| (name.clone(), attr.value.clone()))
            .collect()
    }

    /// A step is actionable when it is non-terminal and not parked at
    /// `EventTransmit` without a pending transition request.
    pub fn is_actionable(&self) -> bool {
        if self.is_terminal() {
            return false;
        }
        !(self.state == StepState::EventTransmit && !self.transition.request_transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_defaults() {
        let step = StepDefinition::create("wf-1", ObjectType::Workflow, "Main");
        assert_eq!(step.state, StepState::Created);
        assert_eq!(step.workflow_id, "wf-1");
        assert!(step.container_id.is_none());
        assert!(!step.transition.changed);
        assert!(!step.transition.request_transition);
    }

    #[test]
    fn test_set_state_marks_changed() {
        let mut step = StepDefinition::create("wf-1", ObjectType::Facet, "Add");
        step.set_state(StepState::FacetComplete);
        assert!(step.transition.changed);
        assert_eq!(step.transition.current_state, StepState::FacetComplete);
        assert!(step.is_complete());
    }

    #[test]
    fn test_attribute_round_trip() {
        let mut step = StepDefinition::create("wf-1", ObjectType::EventFacet, "Fetch");
        step.set_param("url", Value::from("https://example.test"));
        step.set_return("body", Value::from("<html>"));

        assert_eq!(step.param_values()["url"], Value::from("https://example.test"));
        assert_eq!(step.return_values()["body"], Value::from("<html>"));
    }

    #[test]
    fn test_actionable_excludes_parked_event_steps() {
        let mut step = StepDefinition::create("wf-1", ObjectType::EventFacet, "Fetch");
        step.set_state(StepState::EventTransmit);
        assert!(!step.is_actionable());

        step.request_state_change(true);
        assert!(step.is_actionable());

        step.mark_error("boom");
        assert!(!step.is_actionable());
    }

    #[test]
    fn test_mark_error() {
        let mut step = StepDefinition::create("wf-1", ObjectType::Statement, "Fetch");
        step.mark_error("handler failed");
        assert!(step.is_error());
        assert_eq!(step.transition.error.as_deref(), Some("handler failed"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = StepDefinition::create("wf-1", ObjectType::Facet, "Add");
        let b = StepDefinition::create("wf-1", ObjectType::Facet, "Add");
        assert_ne!(a.id, b.id);
    }
}
