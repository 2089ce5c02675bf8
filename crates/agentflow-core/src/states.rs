//! Step state machine
//!
//! States fall into three regions: control (block/statement coordination),
//! execution (creation, completion, error), and the event protocol
//! (`EventTransmit` parks a step until an external continuation arrives).
//! Terminal states are never left once entered; the single legal reset is
//! the retry protocol, which moves `StatementError` back to
//! `EventTransmit`.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Freshly created; the first state-changer pass expands or evaluates it.
    Created,

    /// A block is polling its member statements for completion.
    BlockExecutionContinue,

    /// A workflow or statement is polling its child blocks/steps.
    StatementBlocksContinue,

    /// A mixin container is polling its child blocks.
    MixinBlocksContinue,

    /// An event-facet step parked waiting for an external continuation.
    EventTransmit,

    /// A statement or its subtree failed.
    StatementError,

    WorkflowComplete,
    BlockComplete,
    StatementComplete,
    FacetComplete,
    EventComplete,
}

impl StepState {
    /// Terminal states are never modified again.
    pub fn is_terminal(self) -> bool {
        self.is_complete() || self.is_error()
    }

    pub fn is_complete(self) -> bool {
        matches!(
            self,
            StepState::WorkflowComplete
                | StepState::BlockComplete
                | StepState::StatementComplete
                | StepState::FacetComplete
                | StepState::EventComplete
        )
    }

    pub fn is_error(self) -> bool {
        self == StepState::StatementError
    }

    /// Continue states poll for child completion and are skipped by the
    /// evaluator unless a descendant changed in the previous iteration.
    pub fn is_continue(self) -> bool {
        matches!(
            self,
            StepState::BlockExecutionContinue
                | StepState::StatementBlocksContinue
                | StepState::MixinBlocksContinue
        )
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepState::Created => "created",
            StepState::BlockExecutionContinue => "block_execution_continue",
            StepState::StatementBlocksContinue => "statement_blocks_continue",
            StepState::MixinBlocksContinue => "mixin_blocks_continue",
            StepState::EventTransmit => "event_transmit",
            StepState::StatementError => "statement_error",
            StepState::WorkflowComplete => "workflow_complete",
            StepState::BlockComplete => "block_complete",
            StepState::StatementComplete => "statement_complete",
            StepState::FacetComplete => "facet_complete",
            StepState::EventComplete => "event_complete",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_predicates() {
        assert!(StepState::WorkflowComplete.is_terminal());
        assert!(StepState::EventComplete.is_terminal());
        assert!(StepState::StatementError.is_terminal());
        assert!(!StepState::EventTransmit.is_terminal());
        assert!(!StepState::Created.is_terminal());
    }

    #[test]
    fn test_complete_vs_error() {
        assert!(StepState::FacetComplete.is_complete());
        assert!(!StepState::FacetComplete.is_error());
        assert!(StepState::StatementError.is_error());
        assert!(!StepState::StatementError.is_complete());
    }

    #[test]
    fn test_continue_states() {
        assert!(StepState::BlockExecutionContinue.is_continue());
        assert!(StepState::StatementBlocksContinue.is_continue());
        assert!(StepState::MixinBlocksContinue.is_continue());
        assert!(!StepState::EventTransmit.is_continue());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&StepState::EventTransmit).unwrap();
        assert_eq!(json, "\"event_transmit\"");
    }
}
