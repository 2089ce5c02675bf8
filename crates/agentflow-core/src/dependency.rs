//! Block dependency graph
//!
//! For one block's AST, the statement order respecting data-flow and
//! explicit precedence. Edges: (a) data-flow — statement S consumes a
//! return of statement T; (b) explicit `after` declarations; (c) source
//! order as the tie-break for otherwise-independent statements. The
//! resulting order is the only order in which the evaluator may mark
//! member statements ready.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::ast::{BlockAst, StatementAst};
use crate::expr::collect_ref_heads;

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("dependency cycle involving statement '{0}'")]
    Cycle(String),

    #[error("statement '{statement}' declares precedence on unknown statement '{after}'")]
    UnknownPrecedence { statement: String, after: String },
}

/// Dependency graph over the statements of one block.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    statements: Vec<StatementAst>,
    /// Topological order as indices into `statements`.
    order: Vec<usize>,
    by_id: HashMap<String, usize>,
    /// Direct predecessor indices per statement index.
    predecessors: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph for a block AST.
    pub fn build(block: &BlockAst) -> Result<DependencyGraph, DependencyError> {
        let statements: Vec<StatementAst> = block.steps.clone();

        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for (index, stmt) in statements.iter().enumerate() {
            by_id.insert(stmt.id.clone(), index);
            by_name.insert(stmt.bind_name().to_string(), index);
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..statements.len()).map(|i| graph.add_node(i)).collect();

        for (index, stmt) in statements.iter().enumerate() {
            // Data-flow: argument expressions referencing a sibling's returns.
            let mut heads = Vec::new();
            for arg in &stmt.call.args {
                collect_ref_heads(&arg.value, &mut heads);
            }
            for head in heads {
                if let Some(&dep) = by_name.get(&head) {
                    if dep != index {
                        graph.update_edge(nodes[dep], nodes[index], ());
                    }
                }
            }

            // Explicit precedence.
            for after in &stmt.after {
                let dep = by_name
                    .get(after)
                    .or_else(|| by_id.get(after))
                    .copied()
                    .ok_or_else(|| DependencyError::UnknownPrecedence {
                        statement: stmt.id.clone(),
                        after: after.clone(),
                    })?;
                if dep != index {
                    graph.update_edge(nodes[dep], nodes[index], ());
                }
            }
        }

        // Kahn traversal that always takes the lowest source index among
        // ready nodes, making source order the tie-break.
        let mut in_degree: Vec<usize> = nodes
            .iter()
            .map(|&n| graph.neighbors_directed(n, petgraph::Direction::Incoming).count())
            .collect();
        let mut ready: std::collections::BinaryHeap<std::cmp::Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| std::cmp::Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(statements.len());
        while let Some(std::cmp::Reverse(index)) = ready.pop() {
            order.push(index);
            for succ in graph.neighbors_directed(nodes[index], petgraph::Direction::Outgoing) {
                let succ_index = graph[succ];
                in_degree[succ_index] -= 1;
                if in_degree[succ_index] == 0 {
                    ready.push(std::cmp::Reverse(succ_index));
                }
            }
        }

        if order.len() != statements.len() {
            let stuck = statements
                .iter()
                .enumerate()
                .find(|(i, _)| !order.contains(i))
                .map(|(_, s)| s.id.clone())
                .unwrap_or_default();
            return Err(DependencyError::Cycle(stuck));
        }

        let predecessors = nodes
            .iter()
            .map(|&n| {
                graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .map(|pred| graph[pred])
                    .collect()
            })
            .collect();

        Ok(DependencyGraph {
            statements,
            order,
            by_id,
            predecessors,
        })
    }

    /// Statements in dependency order.
    pub fn ordered_statements(&self) -> impl Iterator<Item = &StatementAst> {
        self.order.iter().map(|&i| &self.statements[i])
    }

    pub fn statement(&self, statement_id: &str) -> Option<&StatementAst> {
        self.by_id.get(statement_id).map(|&i| &self.statements[i])
    }

    /// Direct predecessors of a statement; a statement is ready once every
    /// one of these is complete.
    pub fn predecessors(&self, statement_id: &str) -> Vec<&StatementAst> {
        match self.by_id.get(statement_id) {
            Some(&index) => self.predecessors[index]
                .iter()
                .map(|&i| &self.statements[i])
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(json: serde_json::Value) -> BlockAst {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_data_flow_order() {
        let graph = DependencyGraph::build(&block(serde_json::json!({
            "steps": [
                {
                    "id": "s1",
                    "name": "consumer",
                    "call": {
                        "target": "Use",
                        "args": [{"name": "input", "value": {"type": "Ref", "path": "producer.out"}}]
                    }
                },
                {
                    "id": "s2",
                    "name": "producer",
                    "call": {"target": "Make"}
                }
            ]
        })))
        .unwrap();

        let order: Vec<_> = graph.ordered_statements().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["s2", "s1"]);
    }

    #[test]
    fn test_source_order_tie_break() {
        let graph = DependencyGraph::build(&block(serde_json::json!({
            "steps": [
                {"id": "a", "call": {"target": "A"}},
                {"id": "b", "call": {"target": "B"}},
                {"id": "c", "call": {"target": "C"}}
            ]
        })))
        .unwrap();

        let order: Vec<_> = graph.ordered_statements().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_explicit_precedence() {
        let graph = DependencyGraph::build(&block(serde_json::json!({
            "steps": [
                {"id": "a", "call": {"target": "A"}, "after": ["b"]},
                {"id": "b", "call": {"target": "B"}}
            ]
        })))
        .unwrap();

        let order: Vec<_> = graph.ordered_statements().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(graph.predecessors("a").len(), 1);
        assert!(graph.predecessors("b").is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let result = DependencyGraph::build(&block(serde_json::json!({
            "steps": [
                {"id": "a", "call": {"target": "A"}, "after": ["b"]},
                {"id": "b", "call": {"target": "B"}, "after": ["a"]}
            ]
        })));
        assert!(matches!(result, Err(DependencyError::Cycle(_))));
    }

    #[test]
    fn test_unknown_precedence() {
        let result = DependencyGraph::build(&block(serde_json::json!({
            "steps": [
                {"id": "a", "call": {"target": "A"}, "after": ["ghost"]}
            ]
        })));
        assert!(matches!(
            result,
            Err(DependencyError::UnknownPrecedence { .. })
        ));
    }

    #[test]
    fn test_self_reference_ignored() {
        // A statement referencing its own name does not form an edge.
        let graph = DependencyGraph::build(&block(serde_json::json!({
            "steps": [
                {
                    "id": "a",
                    "name": "a",
                    "call": {
                        "target": "A",
                        "args": [{"name": "x", "value": {"type": "Ref", "path": "a.out"}}]
                    }
                }
            ]
        })))
        .unwrap();
        assert_eq!(graph.len(), 1);
    }
}
