//! Workflow evaluator
//!
//! The evaluator drives workflow execution through iterative fixed-point
//! evaluation: expand the AST into steps, process every actionable step
//! once per iteration through its state changer, commit the iteration's
//! changes atomically, and repeat until the workflow completes, errors, or
//! pauses on event-parked steps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::ast::{BlockAst, CallAst, FacetBody, FacetDecl, FacetLookup, Program, WorkflowDecl};
use crate::changers;
use crate::dependency::{DependencyError, DependencyGraph};
use crate::entities::{LogRecord, TaskState};
use crate::expr::ExprError;
use crate::persistence::{IterationChanges, RuntimeStore, StoreError};
use crate::states::StepState;
use crate::step::{generate_id, ObjectType, StepDefinition, StepId, WorkflowId};
use crate::value::ValueMap;

/// Errors raised by the evaluator and its state changers.
#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Precondition violation on a continuation-API call (programmer error)
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A required AST fragment could not be resolved
    #[error("missing AST: {0}")]
    MissingAst(String),

    /// A statement calls a facet the program does not declare
    #[error("unknown facet: {0}")]
    UnknownFacet(String),

    /// Expression evaluation failure
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    /// Dependency graph construction failure
    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// A foreach source did not evaluate to a list
    #[error("foreach source must be a list, got {0}")]
    ForeachSource(&'static str),
}

/// Status of a finished (or paused) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Completed,
    Paused,
    Error,
    Timeout,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::Error => "ERROR",
            ExecutionStatus::Timeout => "TIMEOUT",
        };
        write!(f, "{name}")
    }
}

/// Result of a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub workflow_id: WorkflowId,
    pub outputs: ValueMap,
    pub error: Option<String>,
    pub iterations: u32,
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    fn completed(workflow_id: WorkflowId, outputs: ValueMap, iterations: u32) -> Self {
        Self {
            success: true,
            workflow_id,
            outputs,
            error: None,
            iterations,
            status: ExecutionStatus::Completed,
        }
    }

    fn paused(workflow_id: WorkflowId, iterations: u32) -> Self {
        Self {
            success: true,
            workflow_id,
            outputs: ValueMap::new(),
            error: None,
            iterations,
            status: ExecutionStatus::Paused,
        }
    }

    fn failed(workflow_id: WorkflowId, error: String, iterations: u32) -> Self {
        Self {
            success: false,
            workflow_id,
            outputs: ValueMap::new(),
            error: Some(error),
            iterations,
            status: ExecutionStatus::Error,
        }
    }

    fn timeout(workflow_id: WorkflowId, iterations: u32) -> Self {
        Self {
            success: false,
            workflow_id,
            outputs: ValueMap::new(),
            error: Some("iteration limit reached".to_string()),
            iterations,
            status: ExecutionStatus::Timeout,
        }
    }
}

/// A facet resolution with owned declarations, so changers can hold it
/// while mutating the context.
#[derive(Debug, Clone)]
pub enum ResolvedFacet {
    Facet(FacetDecl),
    EventFacet(FacetDecl),
    Workflow(WorkflowDecl),
}

/// Context for one run: persistence handle, the ASTs, pending iteration
/// changes, and the per-run caches.
pub struct ExecutionContext {
    pub store: Arc<dyn RuntimeStore>,
    pub changes: IterationChanges,
    pub workflow_id: WorkflowId,
    pub workflow_ast: WorkflowDecl,
    pub workflow_defaults: ValueMap,
    pub program: Option<Program>,
    pub runner_id: String,
    pub task_list: String,

    /// Dependency graphs cached per block step, rebuilt lazily after resume.
    block_graphs: HashMap<StepId, DependencyGraph>,
    /// Block AST overrides, e.g. foreach sub-block bodies.
    block_ast_cache: HashMap<StepId, BlockAst>,
    /// Completed-step lookups, cleared every iteration.
    completed_step_cache: HashMap<String, StepDefinition>,
    /// Root-step parameters, loaded lazily. The durable copy of the
    /// workflow's inputs, needed when a resuming worker has no originals.
    root_params: Option<ValueMap>,
    /// Continue-state blocks needing re-evaluation. `None` means all dirty
    /// (execute and first resume iteration); an empty set means none.
    dirty_blocks: Option<HashSet<StepId>>,
}

impl ExecutionContext {
    fn new(
        store: Arc<dyn RuntimeStore>,
        workflow_id: WorkflowId,
        workflow_ast: WorkflowDecl,
        workflow_defaults: ValueMap,
        program: Option<Program>,
        runner_id: String,
        task_list: String,
    ) -> Self {
        Self {
            store,
            changes: IterationChanges::new(),
            workflow_id,
            workflow_ast,
            workflow_defaults,
            program,
            runner_id,
            task_list,
            block_graphs: HashMap::new(),
            block_ast_cache: HashMap::new(),
            completed_step_cache: HashMap::new(),
            root_params: None,
            dirty_blocks: None,
        }
    }

    /// The workflow root step's parameters as committed at execute time.
    /// Cached per run.
    pub async fn workflow_params(&mut self) -> Result<ValueMap, StoreError> {
        if let Some(params) = &self.root_params {
            return Ok(params.clone());
        }
        let params = match self.store.get_workflow_root(&self.workflow_id).await? {
            Some(root) => root.param_values(),
            None => ValueMap::new(),
        };
        self.root_params = Some(params.clone());
        Ok(params)
    }

    pub fn mark_block_dirty(&mut self, block_id: Option<&StepId>) {
        if let (Some(block_id), Some(dirty)) = (block_id, self.dirty_blocks.as_mut()) {
            dirty.insert(block_id.clone());
        }
    }

    pub fn is_block_dirty(&self, block_id: &str) -> bool {
        match &self.dirty_blocks {
            None => true,
            Some(dirty) => dirty.contains(block_id),
        }
    }

    pub fn mark_block_processed(&mut self, block_id: &str) {
        if let Some(dirty) = self.dirty_blocks.as_mut() {
            dirty.remove(block_id);
        }
    }

    fn seed_dirty_blocks_from_updates(&mut self) {
        if self.dirty_blocks.is_some() {
            return;
        }
        let mut dirty = HashSet::new();
        for step in &self.changes.updated_steps {
            if let Some(block_id) = &step.block_id {
                dirty.insert(block_id.clone());
            }
            if let Some(container_id) = &step.container_id {
                dirty.insert(container_id.clone());
            }
        }
        self.dirty_blocks = Some(dirty);
    }

    /// Clear per-iteration caches.
    pub fn clear_caches(&mut self) {
        self.completed_step_cache.clear();
    }

    /// Find a step by id, checking pending iteration changes first.
    pub async fn find_step(&self, step_id: &str) -> Result<Option<StepDefinition>, StoreError> {
        if let Some(step) = self.changes.find_step(step_id) {
            return Ok(Some(step.clone()));
        }
        self.store.get_step(step_id).await
    }

    /// Steps with the given container, merged with pending changes, in
    /// creation order.
    pub async fn children_of(
        &self,
        container_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let base = self.store.get_steps_by_workflow(&self.workflow_id).await?;
        let merged = self.merge_pending(base, |s| s.container_id.as_deref() == Some(container_id));
        Ok(merged
            .into_iter()
            .filter(|s| s.container_id.as_deref() == Some(container_id))
            .collect())
    }

    /// Steps belonging to a block's sequence, merged with pending changes.
    pub async fn members_of_block(
        &self,
        block_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let base = self.store.get_steps_by_block(block_id).await?;
        let merged = self.merge_pending(base, |s| s.block_id.as_deref() == Some(block_id));
        Ok(merged
            .into_iter()
            .filter(|s| s.block_id.as_deref() == Some(block_id))
            .collect())
    }

    fn merge_pending<F>(&self, mut base: Vec<StepDefinition>, matches: F) -> Vec<StepDefinition>
    where
        F: Fn(&StepDefinition) -> bool,
    {
        for created in &self.changes.created_steps {
            if matches(created) && !base.iter().any(|s| s.id == created.id) {
                base.push(created.clone());
            }
        }
        for updated in &self.changes.updated_steps {
            if let Some(existing) = base.iter_mut().find(|s| s.id == updated.id) {
                *existing = updated.clone();
            } else if matches(updated) {
                base.push(updated.clone());
            }
        }
        base
    }

    /// Cache a block AST for direct lookup (foreach sub-block bodies).
    pub fn set_block_ast_cache(&mut self, block_id: StepId, ast: BlockAst) {
        self.block_ast_cache.insert(block_id, ast);
    }

    pub fn set_block_graph(&mut self, block_id: StepId, graph: DependencyGraph) {
        self.block_graphs.insert(block_id, graph);
    }

    /// Cached dependency graph for a block, building (and caching) it from
    /// the AST when missing, e.g. after a resume.
    pub fn block_graph(
        &mut self,
        block_id: &str,
        ast: &BlockAst,
    ) -> Result<DependencyGraph, EvaluatorError> {
        if let Some(graph) = self.block_graphs.get(block_id) {
            return Ok(graph.clone());
        }
        let graph = DependencyGraph::build(ast)?;
        self.block_graphs.insert(block_id.to_string(), graph.clone());
        Ok(graph)
    }

    /// Resolve the AST body for a block step by tracing the containment
    /// hierarchy: cached override, foreach parent body, workflow body
    /// (selected by `block-N`), statement inline body, or facet-level body.
    pub fn get_block_ast(
        &mut self,
        block_step: StepDefinition,
    ) -> BoxFuture<'_, Result<Option<BlockAst>, EvaluatorError>> {
        Box::pin(async move {
            if let Some(ast) = self.block_ast_cache.get(&block_step.id) {
                return Ok(Some(ast.clone()));
            }

            // Foreach sub-blocks derive their body from the parent's AST;
            // the cache may be empty after a resume, so reconstruct.
            if block_step.foreach_var.is_some() {
                if let Some(parent_id) = block_step.block_id.clone() {
                    if let Some(parent) = self.find_step(&parent_id).await? {
                        if let Some(parent_ast) = self.get_block_ast(parent).await? {
                            if parent_ast.foreach.is_some() {
                                let body = parent_ast.body_without_foreach();
                                self.block_ast_cache
                                    .insert(block_step.id.clone(), body.clone());
                                return Ok(Some(body));
                            }
                        }
                    }
                }
            }

            let Some(container_id) = block_step.container_id.clone() else {
                return Ok(self.select_workflow_body(&block_step));
            };
            let Some(container) = self.find_step(&container_id).await? else {
                return Ok(None);
            };

            // Container is the workflow root: this block is a body block.
            if container.container_id.is_none() {
                return Ok(self.select_workflow_body(&block_step));
            }

            // Statement-level inline body on the container.
            if let Some(inline) = self.find_statement_body(&container).await? {
                return Ok(Some(inline));
            }

            // Facet-level body on the container's facet.
            if !container.facet_name.is_empty() {
                if let Some(ResolvedFacet::Facet(decl)) =
                    self.facet_definition(&container.facet_name)
                {
                    if let Some(FacetBody::AndThenBlock { block }) = decl.body {
                        return Ok(Some(block));
                    }
                }
            }

            Ok(None)
        })
    }

    /// Select the workflow body element for a block step. A list-shaped
    /// body is indexed by the step's `block-N` statement id, falling back
    /// to the first element.
    fn select_workflow_body(&self, block_step: &StepDefinition) -> Option<BlockAst> {
        let index = block_step
            .statement_id
            .as_deref()
            .and_then(|sid| sid.strip_prefix("block-"))
            .and_then(|n| n.parse::<usize>().ok());
        match index {
            Some(index) => self.workflow_ast.body.get(index).cloned(),
            None => self.workflow_ast.body.first().cloned(),
        }
    }

    /// The inline `andThen` body of a statement step, found by looking up
    /// its AST node in the containing block's AST.
    async fn find_statement_body(
        &mut self,
        step: &StepDefinition,
    ) -> Result<Option<BlockAst>, EvaluatorError> {
        let Some(statement_id) = step.statement_id.clone() else {
            return Ok(None);
        };
        let Some(block_id) = step.block_id.clone() else {
            return Ok(None);
        };
        let Some(block_step) = self.find_step(&block_id).await? else {
            return Ok(None);
        };
        let Some(block_ast) = self.get_block_ast(block_step).await? else {
            return Ok(None);
        };
        Ok(block_ast
            .statement(&statement_id)
            .and_then(|s| s.body.clone()))
    }

    /// A completed step by statement name within a block, cached per
    /// iteration.
    pub async fn get_completed_step_by_name(
        &mut self,
        step_name: &str,
        block_id: &str,
        graph: &DependencyGraph,
    ) -> Result<Option<StepDefinition>, EvaluatorError> {
        let cache_key = format!("{block_id}:{step_name}");
        if let Some(step) = self.completed_step_cache.get(&cache_key) {
            return Ok(Some(step.clone()));
        }

        let members = self.members_of_block(block_id).await?;
        for member in members {
            if !member.is_complete() {
                continue;
            }
            let Some(statement_id) = &member.statement_id else {
                continue;
            };
            let Some(stmt) = graph.statement(statement_id) else {
                continue;
            };
            if stmt.bind_name() == step_name {
                self.completed_step_cache
                    .insert(cache_key, member.clone());
                return Ok(Some(member));
            }
        }
        Ok(None)
    }

    /// Resolve a short facet name to its qualified form.
    pub fn resolve_qualified_name(&self, short_name: &str) -> String {
        match &self.program {
            Some(program) => program.resolve_qualified_name(short_name),
            None => short_name.to_string(),
        }
    }

    /// Facet lookup against the program AST, with owned declarations.
    pub fn facet_definition(&self, facet_name: &str) -> Option<ResolvedFacet> {
        let program = self.program.as_ref()?;
        program.facet_definition(facet_name).map(|found| match found {
            FacetLookup::Facet(decl) => ResolvedFacet::Facet(decl.clone()),
            FacetLookup::EventFacet(decl) => ResolvedFacet::EventFacet(decl.clone()),
            FacetLookup::Workflow(decl) => ResolvedFacet::Workflow(decl.clone()),
        })
    }

    /// Implicit default arguments declared for a facet.
    pub fn implicit_args(&self, facet_name: &str) -> Option<CallAst> {
        self.program
            .as_ref()
            .and_then(|p| p.implicit_args(facet_name))
            .cloned()
    }
}

/// Main evaluator: deterministic, persistent, iterative.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryRuntimeStore::new());
/// let evaluator = Evaluator::new(store);
/// let result = evaluator
///     .execute(&workflow_ast, &inputs, Some(&program), "", "")
///     .await?;
/// ```
pub struct Evaluator {
    store: Arc<dyn RuntimeStore>,
    max_iterations: u32,
    task_list: String,
}

impl Evaluator {
    pub fn new(store: Arc<dyn RuntimeStore>) -> Self {
        Self {
            store,
            max_iterations: 1000,
            task_list: "default".to_string(),
        }
    }

    /// Cap on the fixed-point loop; exceeding it returns `TIMEOUT`.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Task list event tasks are emitted on.
    pub fn with_task_list(mut self, task_list: impl Into<String>) -> Self {
        self.task_list = task_list.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn RuntimeStore> {
        &self.store
    }

    /// Execute a workflow from the beginning.
    ///
    /// `inputs` override AST-declared parameter defaults; `wf_id` may fix
    /// the workflow identity to align with an existing runner record.
    pub async fn execute(
        &self,
        workflow_ast: &WorkflowDecl,
        inputs: &ValueMap,
        program: Option<&Program>,
        runner_id: &str,
        wf_id: &str,
    ) -> Result<ExecutionResult, StoreError> {
        let workflow_id = if wf_id.is_empty() {
            generate_id()
        } else {
            wf_id.to_string()
        };

        info!(
            workflow_id = %workflow_id,
            workflow_name = %workflow_ast.name,
            inputs = ?inputs.keys().collect::<Vec<_>>(),
            "workflow started"
        );

        let defaults = extract_defaults(workflow_ast, inputs);
        let mut context = ExecutionContext::new(
            Arc::clone(&self.store),
            workflow_id.clone(),
            workflow_ast.clone(),
            defaults.clone(),
            program.cloned(),
            runner_id.to_string(),
            self.task_list.clone(),
        );

        // Create and commit the initial workflow root step.
        let mut root =
            StepDefinition::create(workflow_id.clone(), ObjectType::Workflow, &workflow_ast.name);
        for (name, value) in &defaults {
            root.set_param(name.clone(), value.clone());
        }
        context.changes.add_created_step(root);
        self.commit_iteration(&mut context).await?;

        self.run_loop(&mut context, false).await
    }

    /// Resume execution of a paused workflow.
    pub async fn resume(
        &self,
        workflow_id: &str,
        workflow_ast: &WorkflowDecl,
        program: Option<&Program>,
        inputs: &ValueMap,
        runner_id: &str,
    ) -> Result<ExecutionResult, StoreError> {
        info!(workflow_id = %workflow_id, "workflow resuming");

        let defaults = extract_defaults(workflow_ast, inputs);
        let mut context = ExecutionContext::new(
            Arc::clone(&self.store),
            workflow_id.to_string(),
            workflow_ast.clone(),
            defaults,
            program.cloned(),
            runner_id.to_string(),
            self.task_list.clone(),
        );

        self.run_loop(&mut context, true).await
    }

    /// The shared iteration loop. With `track_dirty` the dirty-block set is
    /// seeded after the first iteration so untouched continue-state blocks
    /// are not re-scanned on every pass.
    async fn run_loop(
        &self,
        context: &mut ExecutionContext,
        track_dirty: bool,
    ) -> Result<ExecutionResult, StoreError> {
        let workflow_id = context.workflow_id.clone();
        let mut iteration = 0u32;

        while iteration < self.max_iterations {
            iteration += 1;
            context.clear_caches();

            let progress = match self.run_iteration(context).await {
                Ok(progress) => progress,
                Err(EvaluatorError::Store(e)) => return Err(e),
                Err(other) => {
                    self.log_workflow_error(context, &other).await;
                    error!(workflow_id = %workflow_id, error = %other, "workflow failed");
                    return Ok(ExecutionResult::failed(
                        workflow_id,
                        other.to_string(),
                        iteration,
                    ));
                }
            };

            debug!(
                workflow_id = %workflow_id,
                iteration,
                created_steps = context.changes.created_steps.len(),
                updated_steps = context.changes.updated_steps.len(),
                "iteration finished"
            );

            if track_dirty {
                context.seed_dirty_blocks_from_updates();
            }

            self.commit_iteration(context).await?;

            if !progress {
                if self.has_event_blocked_steps(&workflow_id).await? {
                    info!(workflow_id = %workflow_id, iteration, "workflow paused");
                    return Ok(ExecutionResult::paused(workflow_id, iteration));
                }
                let result = self.build_result(&workflow_id, iteration).await?;
                info!(
                    workflow_id = %workflow_id,
                    status = %result.status,
                    iterations = result.iterations,
                    "workflow finished"
                );
                return Ok(result);
            }
        }

        warn!(workflow_id = %workflow_id, iterations = iteration, "iteration cap exceeded");
        Ok(ExecutionResult::timeout(workflow_id, iteration))
    }

    /// Resume execution scoped to a single continued step.
    ///
    /// Walks only the ancestor closure of the continued step (container and
    /// block references) rather than every actionable step: O(depth) rather
    /// than O(total steps). This is the preferred post-continue path.
    pub async fn resume_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        workflow_ast: &WorkflowDecl,
        program: Option<&Program>,
        runner_id: &str,
    ) -> Result<ExecutionResult, StoreError> {
        info!(workflow_id = %workflow_id, step_id = %step_id, "workflow resume_step");

        let defaults = extract_defaults(workflow_ast, &ValueMap::new());
        let mut context = ExecutionContext::new(
            Arc::clone(&self.store),
            workflow_id.to_string(),
            workflow_ast.clone(),
            defaults,
            program.cloned(),
            runner_id.to_string(),
            self.task_list.clone(),
        );
        context.dirty_blocks = Some(HashSet::new());

        let max_chain_iterations = 50;
        let mut total_iterations = 0u32;

        for iteration in 1..=max_chain_iterations {
            // Re-read the ancestor chain from persistence each pass so
            // parents observe committed child changes.
            let mut chain: Vec<StepDefinition> = Vec::new();
            let mut seen: HashSet<StepId> = HashSet::new();
            let mut queue: VecDeque<StepId> = VecDeque::from([step_id.to_string()]);

            while let Some(id) = queue.pop_front() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                let Some(step) = self.store.get_step(&id).await? else {
                    continue;
                };
                if let Some(block_id) = &step.block_id {
                    queue.push_back(block_id.clone());
                }
                if let Some(container_id) = &step.container_id {
                    queue.push_back(container_id.clone());
                }
                chain.push(step);
            }

            if chain.is_empty() {
                if iteration == 1 {
                    warn!(step_id = %step_id, "resume_step: step not found");
                }
                break;
            }

            // All continue-state blocks in the chain are eligible this pass.
            for step in &chain {
                if step.state.is_continue() {
                    if let Some(dirty) = context.dirty_blocks.as_mut() {
                        dirty.insert(step.id.clone());
                    }
                }
            }

            context.changes = IterationChanges::new();
            context.clear_caches();

            let mut processed: HashSet<StepId> = HashSet::new();
            for step in chain {
                if !processed.insert(step.id.clone()) {
                    continue;
                }
                match self.process_step(step, &mut context).await {
                    Ok(_) => {}
                    Err(EvaluatorError::Store(e)) => return Err(e),
                    Err(other) => {
                        self.log_workflow_error(&context, &other).await;
                        error!(workflow_id = %workflow_id, error = %other, "resume_step failed");
                        return Ok(ExecutionResult::failed(
                            workflow_id.to_string(),
                            other.to_string(),
                            total_iterations,
                        ));
                    }
                }
            }

            // Newly created steps may create more; drain until quiet.
            loop {
                let unprocessed: Vec<StepDefinition> = context
                    .changes
                    .created_steps
                    .iter()
                    .filter(|s| !processed.contains(&s.id))
                    .cloned()
                    .collect();
                if unprocessed.is_empty() {
                    break;
                }
                for step in unprocessed {
                    processed.insert(step.id.clone());
                    match self.process_step(step, &mut context).await {
                        Ok(_) => {}
                        Err(EvaluatorError::Store(e)) => return Err(e),
                        Err(other) => {
                            self.log_workflow_error(&context, &other).await;
                            return Ok(ExecutionResult::failed(
                                workflow_id.to_string(),
                                other.to_string(),
                                total_iterations,
                            ));
                        }
                    }
                }
            }

            if !context.changes.has_changes() {
                break;
            }

            self.commit_iteration(&mut context).await?;
            total_iterations += 1;
        }

        info!(
            workflow_id = %workflow_id,
            iterations = total_iterations,
            "resume_step done"
        );

        let root = self.store.get_workflow_root(workflow_id).await?;
        match root {
            Some(root) if root.is_complete() => Ok(ExecutionResult::completed(
                workflow_id.to_string(),
                root.return_values(),
                total_iterations,
            )),
            Some(root) if root.is_error() => {
                let message = root
                    .transition
                    .error
                    .unwrap_or_else(|| "workflow error".to_string());
                Ok(ExecutionResult::failed(
                    workflow_id.to_string(),
                    message,
                    total_iterations,
                ))
            }
            _ => Ok(ExecutionResult::paused(
                workflow_id.to_string(),
                total_iterations,
            )),
        }
    }

    /// Run a single iteration: process actionable steps, then drain every
    /// step created during processing.
    async fn run_iteration(
        &self,
        context: &mut ExecutionContext,
    ) -> Result<bool, EvaluatorError> {
        let mut progress = false;
        let mut processed: HashSet<StepId> = HashSet::new();

        let steps = context
            .store
            .get_actionable_steps_by_workflow(&context.workflow_id)
            .await?;
        debug!(
            workflow_id = %context.workflow_id,
            actionable = steps.len(),
            "iteration start"
        );

        for step in steps {
            if !processed.insert(step.id.clone()) {
                continue;
            }

            // Continue-state blocks are re-evaluated only when dirtied by a
            // descendant change.
            if step.state.is_continue() && !context.is_block_dirty(&step.id) {
                continue;
            }

            let step_id = step.id.clone();
            let was_continue = step.state.is_continue();
            if self.process_step(step, context).await? {
                progress = true;
            } else if was_continue {
                context.mark_block_processed(&step_id);
            }
        }

        // Drain steps created by state changers; they may create more.
        // Created steps stay on the change set while being processed so
        // sibling changers can observe them before the commit.
        let mut cursor = 0;
        loop {
            let new_steps: Vec<StepDefinition> =
                context.changes.created_steps[cursor..].to_vec();
            if new_steps.is_empty() {
                break;
            }
            cursor = context.changes.created_steps.len();
            for step in new_steps {
                if processed.insert(step.id.clone()) {
                    debug!(step_id = %step.id, object_type = ?step.object_type, "step created");
                    if self.process_step(step, context).await? {
                        progress = true;
                    }
                }
            }
        }

        Ok(progress)
    }

    /// Dispatch one step to its state changer and record progress.
    async fn process_step(
        &self,
        step: StepDefinition,
        context: &mut ExecutionContext,
    ) -> Result<bool, EvaluatorError> {
        if step.is_terminal() {
            return Ok(false);
        }

        // Event-parked steps wait for an external continuation.
        if step.state == StepState::EventTransmit && !step.transition.request_transition {
            return Ok(false);
        }

        let state_before = step.state;

        // Reset the dirty flag so it reflects changer writes only.
        let mut step = step;
        step.transition.changed = false;

        let step = changers::dispatch(step, context).await?;

        if step.state != state_before {
            debug!(
                step_id = %step.id,
                state_before = %state_before,
                state_after = %step.state,
                "step progressed"
            );
            context.mark_block_dirty(step.block_id.as_ref());
            context.mark_block_dirty(step.container_id.as_ref());
            context.changes.add_updated_step(step);
            return Ok(true);
        }

        // No state transition, but the changer modified attributes.
        if step.transition.changed {
            context.mark_block_dirty(step.block_id.as_ref());
            context.mark_block_dirty(step.container_id.as_ref());
            context.changes.add_updated_step(step);
            return Ok(true);
        }

        Ok(false)
    }

    async fn commit_iteration(&self, context: &mut ExecutionContext) -> Result<(), StoreError> {
        if context.changes.has_changes() {
            info!(
                workflow_id = %context.workflow_id,
                created_steps = context.changes.created_steps.len(),
                updated_steps = context.changes.updated_steps.len(),
                created_tasks = context.changes.created_tasks.len(),
                "iteration commit"
            );
            self.store.commit(&context.changes).await?;
            context.changes.clear();
        }
        Ok(())
    }

    async fn has_event_blocked_steps(&self, workflow_id: &str) -> Result<bool, StoreError> {
        let steps = self.store.get_steps_by_workflow(workflow_id).await?;
        Ok(steps
            .iter()
            .any(|s| s.state == StepState::EventTransmit && !s.is_terminal()))
    }

    async fn build_result(
        &self,
        workflow_id: &str,
        iterations: u32,
    ) -> Result<ExecutionResult, StoreError> {
        let root = self.store.get_workflow_root(workflow_id).await?;
        match root {
            Some(root) if root.is_complete() => Ok(ExecutionResult::completed(
                workflow_id.to_string(),
                root.return_values(),
                iterations,
            )),
            Some(root) if root.is_error() => {
                let message = root
                    .transition
                    .error
                    .unwrap_or_else(|| "workflow error".to_string());
                Ok(ExecutionResult::failed(
                    workflow_id.to_string(),
                    message,
                    iterations,
                ))
            }
            _ => Ok(ExecutionResult::failed(
                workflow_id.to_string(),
                "workflow did not complete".to_string(),
                iterations,
            )),
        }
    }

    async fn log_workflow_error(&self, context: &ExecutionContext, error: &EvaluatorError) {
        if context.runner_id.is_empty() {
            return;
        }
        let log = LogRecord::new(
            context.runner_id.clone(),
            format!("workflow error: {error}"),
        );
        if let Err(e) = self.store.save_log(&log).await {
            warn!(error = %e, "failed to write workflow error log");
        }
    }

    // =========================================================================
    // Continuation API
    // =========================================================================

    /// Unblock an event-parked step with a handler result. The only way
    /// external code advances a step out of `EventTransmit`.
    pub async fn continue_step(
        &self,
        step_id: &str,
        result: &ValueMap,
    ) -> Result<(), EvaluatorError> {
        info!(
            step_id = %step_id,
            result_keys = ?result.keys().collect::<Vec<_>>(),
            "continue step"
        );

        let mut step = self.require_step_at(step_id, StepState::EventTransmit).await?;

        for (name, value) in result {
            step.set_return(name.clone(), value.clone());
        }
        step.request_state_change(true);
        self.store.save_step(&step).await?;
        Ok(())
    }

    /// Fail an event-parked step with an error.
    pub async fn fail_step(
        &self,
        step_id: &str,
        error_message: &str,
    ) -> Result<(), EvaluatorError> {
        warn!(step_id = %step_id, error = %error_message, "fail step");

        let mut step = self.require_step_at(step_id, StepState::EventTransmit).await?;
        step.mark_error(error_message);
        self.store.save_step(&step).await?;
        Ok(())
    }

    /// Retry a failed event step: reset it to `EventTransmit`, clear the
    /// error, and reset the associated task to pending.
    pub async fn retry_step(&self, step_id: &str) -> Result<(), EvaluatorError> {
        info!(step_id = %step_id, "retry step");

        let mut step = self.require_step_at(step_id, StepState::StatementError).await?;

        step.set_state(StepState::EventTransmit);
        step.transition.error = None;
        step.transition.request_transition = false;
        self.store.save_step(&step).await?;

        if let Some(mut task) = self.store.get_task_for_step(step_id).await? {
            task.state = TaskState::Pending;
            task.error = None;
            task.updated = crate::entities::current_time_ms();
            self.store.save_task(&task).await?;
        }
        Ok(())
    }

    async fn require_step_at(
        &self,
        step_id: &str,
        expected: StepState,
    ) -> Result<StepDefinition, EvaluatorError> {
        let step = self
            .store
            .get_step(step_id)
            .await?
            .ok_or_else(|| EvaluatorError::Invariant(format!("step {step_id} not found")))?;
        if step.state != expected {
            return Err(EvaluatorError::Invariant(format!(
                "step {step_id} is at {}, expected {expected}",
                step.state
            )));
        }
        Ok(step)
    }
}

/// Workflow defaults: declared parameter defaults overlaid by the provided
/// inputs.
pub fn extract_defaults(workflow_ast: &WorkflowDecl, inputs: &ValueMap) -> ValueMap {
    let mut defaults = ValueMap::new();
    for param in &workflow_ast.params {
        if let Some(value) = param.default_value() {
            defaults.insert(param.name.clone(), value);
        }
    }
    for (name, value) in inputs {
        defaults.insert(name.clone(), value.clone());
    }
    defaults
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ParamDecl;
    use crate::value::Value;

    fn workflow_with_defaults() -> WorkflowDecl {
        serde_json::from_value(serde_json::json!({
            "name": "Main",
            "params": [
                {"name": "x", "type": "Int", "default": 1},
                {"name": "y", "type": "Int", "default": {"value": 2}},
                {"name": "z", "type": "Int"}
            ],
            "body": {"steps": []}
        }))
        .unwrap()
    }

    #[test]
    fn test_extract_defaults_overlays_inputs() {
        let workflow = workflow_with_defaults();
        let mut inputs = ValueMap::new();
        inputs.insert("x".to_string(), Value::Int(10));
        inputs.insert("z".to_string(), Value::Int(30));

        let defaults = extract_defaults(&workflow, &inputs);
        assert_eq!(defaults["x"], Value::Int(10));
        assert_eq!(defaults["y"], Value::Int(2));
        assert_eq!(defaults["z"], Value::Int(30));
    }

    #[test]
    fn test_param_decl_default_shapes() {
        let wrapped: ParamDecl = serde_json::from_value(serde_json::json!({
            "name": "a",
            "default": {"value": "v"}
        }))
        .unwrap();
        assert_eq!(wrapped.default_value(), Some(Value::from("v")));
    }

    #[test]
    fn test_execution_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Paused).unwrap(),
            "\"PAUSED\""
        );
        assert_eq!(ExecutionStatus::Completed.to_string(), "COMPLETED");
    }
}
