//! Lowered program AST
//!
//! The evaluator consumes an already-lowered program: a flow's compiled
//! source is the JSON emission of these types. Name resolution has to cope
//! with two namespace encodings, because the compiler may emit a nested
//! namespace tree or flatten namespaces into dotted names
//! (`"osm.geo.Region"` as a single namespace). Qualified lookup therefore
//! first tries every prefix split as a flat namespace name, then walks the
//! nested tree part by part.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::value::Value;

/// A compiled program: the unit stored per flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

/// Top-level or namespaced declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Declaration {
    FacetDecl(FacetDecl),
    EventFacetDecl(FacetDecl),
    WorkflowDecl(WorkflowDecl),
    Namespace(Namespace),
    ImplicitDecl(ImplicitDecl),
}

/// A pure or event facet declaration. Event facets have no compute body;
/// their results come from external handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    #[serde(default)]
    pub returns: Vec<ParamDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<FacetBody>,
}

impl FacetDecl {
    /// Declared type tag for a parameter, if any.
    pub fn param_type(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.type_name.as_deref())
    }
}

/// The body of a pure facet: either an expression map computing the
/// returns, or a nested statement block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FacetBody {
    ComputeBlock {
        #[serde(default)]
        exprs: IndexMap<String, Expr>,
    },
    AndThenBlock {
        #[serde(flatten)]
        block: BlockAst,
    },
}

/// One executable workflow entry in a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    pub body: WorkflowBody,
}

/// A workflow body is one block or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkflowBody {
    Many(Vec<BlockAst>),
    Single(BlockAst),
}

impl WorkflowBody {
    pub fn len(&self) -> usize {
        match self {
            WorkflowBody::Single(_) => 1,
            WorkflowBody::Many(blocks) => blocks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select the body element for a block step's `block-N` statement id.
    /// Falls back to the first block when no index is available.
    pub fn get(&self, index: usize) -> Option<&BlockAst> {
        match self {
            WorkflowBody::Single(block) => (index == 0).then_some(block),
            WorkflowBody::Many(blocks) => blocks.get(index),
        }
    }

    pub fn first(&self) -> Option<&BlockAst> {
        self.get(0)
    }
}

/// A declared parameter or return with its advisory type tag and optional
/// default. Defaults may be emitted either as a bare literal or wrapped in
/// a `{"value": ...}` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamDecl {
    /// Unwrap the declared default, handling the `{"value": ...}` wrapping.
    pub fn default_value(&self) -> Option<Value> {
        match &self.default {
            Some(Value::Map(map)) if map.contains_key("value") => map.get("value").cloned(),
            other => other.clone(),
        }
    }
}

/// A bracketed sequence of statements with an optional yield expression
/// map and an optional foreach clause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockAst {
    #[serde(default)]
    pub steps: Vec<StatementAst>,
    #[serde(default, rename = "yield", skip_serializing_if = "Option::is_none")]
    pub yields: Option<IndexMap<String, Expr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<ForeachClause>,
}

impl BlockAst {
    /// The per-item body of a foreach block: this block minus its foreach
    /// clause.
    pub fn body_without_foreach(&self) -> BlockAst {
        BlockAst {
            steps: self.steps.clone(),
            yields: self.yields.clone(),
            foreach: None,
        }
    }

    pub fn statement(&self, statement_id: &str) -> Option<&StatementAst> {
        self.steps
            .iter()
            .find(|s| s.id == statement_id || s.bind_name() == statement_id)
    }
}

/// The foreach clause of a block: bind `var` to each element of `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeachClause {
    pub var: String,
    pub source: Expr,
}

/// One named line inside a block: a facet call binding return attributes
/// into the block's scope, optionally with explicit precedence and an
/// inline `andThen` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementAst {
    /// Stable within the parent block AST.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub call: CallAst,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BlockAst>,
}

impl StatementAst {
    /// The name this statement's returns are bound to in block scope.
    pub fn bind_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A facet invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAst {
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgAst>,
}

/// One named argument of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgAst {
    pub name: String,
    pub value: Expr,
}

/// An implicit-argument declaration: contributes default argument values
/// for every invocation of its call target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplicitDecl {
    pub call: CallAst,
}

/// A namespace grouping declarations. `name` may itself be dotted when the
/// compiler flattens nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

/// Result of a facet lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FacetLookup<'a> {
    Facet(&'a FacetDecl),
    EventFacet(&'a FacetDecl),
    Workflow(&'a WorkflowDecl),
}

impl<'a> FacetLookup<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            FacetLookup::Facet(decl) | FacetLookup::EventFacet(decl) => &decl.name,
            FacetLookup::Workflow(decl) => &decl.name,
        }
    }
}

impl Program {
    /// Parse a flow's stored JSON source into a program.
    pub fn from_source(source: &str) -> Result<Program, serde_json::Error> {
        serde_json::from_str(source)
    }

    /// Find a workflow by name. Accepts both qualified (`ns.Name`) and
    /// short names.
    pub fn find_workflow(&self, name: &str) -> Option<&WorkflowDecl> {
        if name.contains('.') {
            if let Some(FacetLookup::Workflow(decl)) =
                search_qualified(&self.declarations, name)
            {
                return Some(decl);
            }
        }
        match search_short(&self.declarations, name) {
            Some(FacetLookup::Workflow(decl)) => Some(decl),
            _ => None,
        }
    }

    /// Find a facet, event facet, or workflow declaration by qualified or
    /// short name.
    pub fn facet_definition(&self, facet_name: &str) -> Option<FacetLookup<'_>> {
        if facet_name.contains('.') {
            if let Some(found) = search_qualified(&self.declarations, facet_name) {
                return Some(found);
            }
        }
        search_short(&self.declarations, facet_name)
    }

    /// Resolve a short facet name to its qualified form; returns the input
    /// unchanged when no enclosing namespace is found.
    pub fn resolve_qualified_name(&self, short_name: &str) -> String {
        resolve_in_declarations(&self.declarations, short_name, "")
            .unwrap_or_else(|| short_name.to_string())
    }

    /// Implicit default arguments for a facet, from the first
    /// `ImplicitDecl` whose call target matches.
    pub fn implicit_args(&self, facet_name: &str) -> Option<&CallAst> {
        search_implicits(&self.declarations, facet_name)
    }
}

fn leaf(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn search_short<'a>(declarations: &'a [Declaration], name: &str) -> Option<FacetLookup<'a>> {
    for decl in declarations {
        match decl {
            Declaration::FacetDecl(facet) if facet.name == name => {
                return Some(FacetLookup::Facet(facet))
            }
            Declaration::EventFacetDecl(facet) if facet.name == name => {
                return Some(FacetLookup::EventFacet(facet))
            }
            Declaration::WorkflowDecl(workflow) if workflow.name == name => {
                return Some(FacetLookup::Workflow(workflow))
            }
            Declaration::Namespace(ns) => {
                if let Some(found) = search_short(&ns.declarations, name) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

fn search_qualified<'a>(
    declarations: &'a [Declaration],
    qualified_name: &str,
) -> Option<FacetLookup<'a>> {
    let parts: Vec<&str> = qualified_name.split('.').collect();
    let facet_short = parts[parts.len() - 1];

    // Strategy 1: flat namespace match, trying every split point from the
    // longest prefix down. "osm.geo.Region.Resolve" tries namespace
    // "osm.geo.Region" first.
    for split in (1..parts.len()).rev() {
        let ns_name = parts[..split].join(".");
        for decl in declarations {
            if let Declaration::Namespace(ns) = decl {
                if ns.name == ns_name {
                    let target = parts[split];
                    if let Some(found) = direct_match(&ns.declarations, target) {
                        return Some(found);
                    }
                    if let Some(found) = search_short(&ns.declarations, facet_short) {
                        return Some(found);
                    }
                }
            }
        }
    }

    // Strategy 2: nested namespace navigation, part by part.
    let mut current = declarations;
    for ns_name in &parts[..parts.len() - 1] {
        let mut next = None;
        for decl in current {
            if let Declaration::Namespace(ns) = decl {
                if ns.name == *ns_name {
                    next = Some(ns.declarations.as_slice());
                    break;
                }
            }
        }
        current = next?;
    }
    direct_match(current, facet_short)
}

fn direct_match<'a>(declarations: &'a [Declaration], name: &str) -> Option<FacetLookup<'a>> {
    for decl in declarations {
        match decl {
            Declaration::FacetDecl(facet) if facet.name == name => {
                return Some(FacetLookup::Facet(facet))
            }
            Declaration::EventFacetDecl(facet) if facet.name == name => {
                return Some(FacetLookup::EventFacet(facet))
            }
            Declaration::WorkflowDecl(workflow) if workflow.name == name => {
                return Some(FacetLookup::Workflow(workflow))
            }
            _ => {}
        }
    }
    None
}

fn resolve_in_declarations(
    declarations: &[Declaration],
    short_name: &str,
    prefix: &str,
) -> Option<String> {
    for decl in declarations {
        match decl {
            Declaration::FacetDecl(facet) | Declaration::EventFacetDecl(facet)
                if facet.name == short_name =>
            {
                return Some(qualify(prefix, short_name));
            }
            Declaration::WorkflowDecl(workflow) if workflow.name == short_name => {
                return Some(qualify(prefix, short_name));
            }
            Declaration::Namespace(ns) => {
                let new_prefix = qualify(prefix, &ns.name);
                if let Some(found) =
                    resolve_in_declarations(&ns.declarations, short_name, &new_prefix)
                {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn search_implicits<'a>(declarations: &'a [Declaration], facet_name: &str) -> Option<&'a CallAst> {
    let short_name = leaf(facet_name);
    for decl in declarations {
        match decl {
            Declaration::ImplicitDecl(implicit) => {
                let target = &implicit.call.target;
                if target == facet_name || leaf(target) == short_name {
                    return Some(&implicit.call);
                }
            }
            Declaration::Namespace(ns) => {
                if let Some(found) = search_implicits(&ns.declarations, facet_name) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}
