//! Expression evaluation
//!
//! The lowered AST carries small value expressions: literals, references
//! into the enclosing scope (workflow parameters, foreach bindings, sibling
//! statement returns), arithmetic, and list/map builders. Evaluation is
//! pure; all effects live in facet handlers.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueMap};

/// A value expression in the lowered AST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Literal {
        value: Value,
    },
    /// Dotted reference, e.g. `x` or `fetch.body`.
    Ref {
        path: String,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    ListExpr {
        #[serde(default)]
        items: Vec<Expr>,
    },
    MapExpr {
        #[serde(default)]
        entries: IndexMap<String, Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Name resolution for expression evaluation.
pub trait Scope {
    /// Resolve a bare name: a workflow parameter, a foreach binding, or a
    /// statement name (yielding its returns as a map).
    fn lookup(&self, name: &str) -> Option<Value>;

    /// Resolve a member of a named object, typically a statement's return.
    fn lookup_member(&self, object: &str, member: &str) -> Option<Value>;
}

/// An empty scope; every reference is unbound.
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn lookup(&self, _name: &str) -> Option<Value> {
        None
    }

    fn lookup_member(&self, _object: &str, _member: &str) -> Option<Value> {
        None
    }
}

/// A scope backed by a single value map.
pub struct MapScope<'a>(pub &'a ValueMap);

impl Scope for MapScope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }

    fn lookup_member(&self, object: &str, member: &str) -> Option<Value> {
        match self.0.get(object) {
            Some(Value::Map(map)) => map.get(member).cloned(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("unbound reference: {0}")]
    UnboundReference(String),

    #[error("type mismatch: cannot apply {op:?} to {left} and {right}")]
    TypeMismatch {
        op: BinaryOp,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,
}

/// Evaluate an expression against a scope.
pub fn evaluate(expr: &Expr, scope: &dyn Scope) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Ref { path } => resolve_ref(path, scope),
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, scope)?;
            let right = evaluate(right, scope)?;
            apply_binary(*op, left, right)
        }
        Expr::ListExpr { items } => {
            let values = items
                .iter()
                .map(|item| evaluate(item, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::List(values))
        }
        Expr::MapExpr { entries } => {
            let mut map = ValueMap::new();
            for (name, entry) in entries {
                map.insert(name.clone(), evaluate(entry, scope)?);
            }
            Ok(Value::Map(map))
        }
    }
}

/// Head names referenced by an expression, used for data-flow edges.
pub fn collect_ref_heads(expr: &Expr, heads: &mut Vec<String>) {
    match expr {
        Expr::Literal { .. } => {}
        Expr::Ref { path } => {
            let head = path.split('.').next().unwrap_or(path);
            if !head.is_empty() {
                heads.push(head.to_string());
            }
        }
        Expr::Binary { left, right, .. } => {
            collect_ref_heads(left, heads);
            collect_ref_heads(right, heads);
        }
        Expr::ListExpr { items } => {
            for item in items {
                collect_ref_heads(item, heads);
            }
        }
        Expr::MapExpr { entries } => {
            for entry in entries.values() {
                collect_ref_heads(entry, heads);
            }
        }
    }
}

fn resolve_ref(path: &str, scope: &dyn Scope) -> Result<Value, ExprError> {
    let mut parts = path.split('.');
    let head = parts.next().unwrap_or_default();
    let rest: Vec<&str> = parts.collect();

    let mut value = match scope.lookup(head) {
        Some(value) => value,
        None => match rest.first() {
            Some(member) => {
                let base = scope
                    .lookup_member(head, member)
                    .ok_or_else(|| ExprError::UnboundReference(path.to_string()))?;
                return walk_members(base, &rest[1..], path);
            }
            None => return Err(ExprError::UnboundReference(path.to_string())),
        },
    };

    if !rest.is_empty() {
        value = walk_members(value, &rest, path)?;
    }
    Ok(value)
}

fn walk_members(mut value: Value, members: &[&str], path: &str) -> Result<Value, ExprError> {
    for member in members {
        value = match value {
            Value::Map(map) => map
                .get(*member)
                .cloned()
                .ok_or_else(|| ExprError::UnboundReference(path.to_string()))?,
            _ => return Err(ExprError::UnboundReference(path.to_string())),
        };
    }
    Ok(value)
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    use BinaryOp::*;

    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => match op {
            Add => Ok(Value::Int(a + b)),
            Sub => Ok(Value::Int(a - b)),
            Mul => Ok(Value::Int(a * b)),
            Div => {
                if *b == 0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    Ok(Value::Int(a / b))
                }
            }
        },
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = left.as_float().unwrap_or_default();
            let b = right.as_float().unwrap_or_default();
            match op {
                Add => Ok(Value::Float(a + b)),
                Sub => Ok(Value::Float(a - b)),
                Mul => Ok(Value::Float(a * b)),
                Div => {
                    if b == 0.0 {
                        Err(ExprError::DivisionByZero)
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
            }
        }
        (Value::String(a), Value::String(b)) if op == Add => {
            Ok(Value::String(format!("{a}{b}")))
        }
        (Value::List(a), Value::List(b)) if op == Add => {
            let mut items = a.clone();
            items.extend(b.iter().cloned());
            Ok(Value::List(items))
        }
        _ => Err(ExprError::TypeMismatch {
            op,
            left: left.type_name(),
            right: right.type_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal {
            value: value.into(),
        }
    }

    fn reference(path: &str) -> Expr {
        Expr::Ref {
            path: path.to_string(),
        }
    }

    #[test]
    fn test_literal_and_arithmetic() {
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(lit(2i64)),
            right: Box::new(lit(3i64)),
        };
        assert_eq!(evaluate(&expr, &EmptyScope).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_int_float_promotion() {
        let expr = Expr::Binary {
            op: BinaryOp::Mul,
            left: Box::new(lit(2i64)),
            right: Box::new(lit(1.5f64)),
        };
        assert_eq!(evaluate(&expr, &EmptyScope).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn test_string_concat() {
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(lit("<")),
            right: Box::new(lit("x")),
        };
        assert_eq!(evaluate(&expr, &EmptyScope).unwrap(), Value::from("<x"));
    }

    #[test]
    fn test_ref_resolution() {
        let mut map = ValueMap::new();
        map.insert("x".to_string(), Value::Int(7));
        let mut inner = ValueMap::new();
        inner.insert("r".to_string(), Value::Int(9));
        map.insert("sum".to_string(), Value::Map(inner));

        let scope = MapScope(&map);
        assert_eq!(evaluate(&reference("x"), &scope).unwrap(), Value::Int(7));
        assert_eq!(evaluate(&reference("sum.r"), &scope).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_unbound_reference() {
        let result = evaluate(&reference("missing"), &EmptyScope);
        assert!(matches!(result, Err(ExprError::UnboundReference(_))));
    }

    #[test]
    fn test_division_by_zero() {
        let expr = Expr::Binary {
            op: BinaryOp::Div,
            left: Box::new(lit(1i64)),
            right: Box::new(lit(0i64)),
        };
        assert!(matches!(
            evaluate(&expr, &EmptyScope),
            Err(ExprError::DivisionByZero)
        ));
    }

    #[test]
    fn test_collect_ref_heads() {
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(reference("fetch.body")),
            right: Box::new(reference("suffix")),
        };
        let mut heads = Vec::new();
        collect_ref_heads(&expr, &mut heads);
        assert_eq!(heads, vec!["fetch", "suffix"]);
    }

    #[test]
    fn test_serde_tagged_shape() {
        let json = serde_json::json!({
            "type": "Binary",
            "op": "add",
            "left": {"type": "Ref", "path": "x"},
            "right": {"type": "Literal", "value": 1}
        });
        let expr: Expr = serde_json::from_value(json).unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Add, .. }));
    }
}
