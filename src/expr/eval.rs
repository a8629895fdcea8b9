use std::collections::HashMap;

use crate::config::model::{CaseExpression, ExpressionNode};
use crate::core::value::{ArithOp, Row, Value};
use crate::error::{BadValue, PipeError, PipeResult};

/// An expression tree with column references resolved to positions.
#[derive(Debug, Clone)]
pub enum CompiledExpr {
    Select(usize),
    Literal(Value),
    Not(Box<CompiledExpr>),
    Binary {
        lhs: Box<CompiledExpr>,
        op: BinaryOp,
        rhs: Box<CompiledExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Compile an `ExpressionNode` against a channel's column map.
pub fn compile(
    node: &ExpressionNode,
    columns: &HashMap<String, usize>,
) -> PipeResult<CompiledExpr> {
    if let Some(op) = &node.op {
        if op == "not" {
            let arg = node
                .arg
                .as_ref()
                .ok_or_else(|| PipeError::config("'not' expression requires an arg node"))?;
            return Ok(CompiledExpr::Not(Box::new(compile(arg, columns)?)));
        }
        let lhs = node
            .lhs
            .as_ref()
            .ok_or_else(|| PipeError::config(format!("operator '{op}' requires a lhs node")))?;
        let rhs = node
            .rhs
            .as_ref()
            .ok_or_else(|| PipeError::config(format!("operator '{op}' requires a rhs node")))?;
        let op = match op.as_str() {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "=" | "==" => BinaryOp::Eq,
            "!=" | "<>" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            other => {
                return Err(PipeError::config(format!(
                    "unknown expression operator '{other}'"
                )));
            }
        };
        return Ok(CompiledExpr::Binary {
            lhs: Box::new(compile(lhs, columns)?),
            op,
            rhs: Box::new(compile(rhs, columns)?),
        });
    }

    // leaf node
    let expr = node
        .expr
        .as_ref()
        .ok_or_else(|| PipeError::config("leaf expression node requires 'expr'"))?;
    match node.node_type.as_deref() {
        Some("select") => {
            let pos = columns.get(expr).ok_or_else(|| {
                PipeError::config(format!("select expression: unknown column '{expr}'"))
            })?;
            Ok(CompiledExpr::Select(*pos))
        }
        Some("value") | None => {
            let rdf_type = node.as_rdf_type.as_deref().unwrap_or("text");
            Ok(CompiledExpr::Literal(Value::cast(expr, rdf_type)?))
        }
        Some(other) => Err(PipeError::config(format!(
            "unknown expression leaf type '{other}' (expecting select or value)"
        ))),
    }
}

impl CompiledExpr {
    pub fn eval(&self, row: &Row) -> Result<Value, BadValue> {
        match self {
            CompiledExpr::Select(pos) => Ok(row
                .get(*pos)
                .cloned()
                .unwrap_or(Value::Null)),
            CompiledExpr::Literal(v) => Ok(v.clone()),
            CompiledExpr::Not(arg) => {
                let v = arg.eval(row)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                Ok(bool_value(!truthy(&v)))
            }
            CompiledExpr::Binary { lhs, op, rhs } => {
                let a = lhs.eval(row)?;
                let b = rhs.eval(row)?;
                eval_binary(&a, *op, &b)
            }
        }
    }
}

fn bool_value(b: bool) -> Value {
    Value::Int(if b { 1 } else { 0 })
}

/// Truthiness of an expression result: non-null and non-zero / non-empty.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Int(x) => *x != 0,
        Value::Uint(x) => *x != 0,
        Value::Long(x) => *x != 0,
        Value::Ulong(x) => *x != 0,
        Value::Double(x) => *x != 0.0,
        Value::Text(s) => !s.is_empty(),
        _ => true,
    }
}

fn eval_binary(a: &Value, op: BinaryOp, b: &Value) -> Result<Value, BadValue> {
    use BinaryOp::*;
    match op {
        Add => a.arith(ArithOp::Add, b),
        Sub => a.arith(ArithOp::Sub, b),
        Mul => a.arith(ArithOp::Mul, b),
        Div => a.arith(ArithOp::Div, b),
        Eq | Ne | Lt | Le | Gt | Ge => {
            // SQL three-valued logic: a comparison with null is unknown
            let Some(ord) = a.compare(b) else {
                return Ok(Value::Null);
            };
            let r = match op {
                Eq => ord.is_eq(),
                Ne => ord.is_ne(),
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Ok(bool_value(r))
        }
        And => {
            let an = a.is_null();
            let bn = b.is_null();
            match (an, bn) {
                (false, false) => Ok(bool_value(truthy(a) && truthy(b))),
                // false AND unknown = false; true AND unknown = unknown
                (false, true) if !truthy(a) => Ok(bool_value(false)),
                (true, false) if !truthy(b) => Ok(bool_value(false)),
                _ => Ok(Value::Null),
            }
        }
        Or => {
            let an = a.is_null();
            let bn = b.is_null();
            match (an, bn) {
                (false, false) => Ok(bool_value(truthy(a) || truthy(b))),
                // true OR unknown = true; false OR unknown = unknown
                (false, true) if truthy(a) => Ok(bool_value(true)),
                (true, false) if truthy(b) => Ok(bool_value(true)),
                _ => Ok(Value::Null),
            }
        }
    }
}

/// A compiled `case` column: first true `when` wins; each `then` / `else`
/// node may target another output column by name, or the owning column when
/// unnamed.
#[derive(Debug, Clone)]
pub struct CompiledCase {
    pub branches: Vec<(CompiledExpr, Vec<(Option<usize>, CompiledExpr)>)>,
    pub else_exprs: Vec<(Option<usize>, CompiledExpr)>,
}

pub fn compile_case(
    case_exprs: &[CaseExpression],
    else_exprs: &[ExpressionNode],
    input_columns: &HashMap<String, usize>,
    output_columns: &HashMap<String, usize>,
) -> PipeResult<CompiledCase> {
    let compile_targets = |nodes: &[ExpressionNode]| -> PipeResult<Vec<(Option<usize>, CompiledExpr)>> {
        nodes
            .iter()
            .map(|node| {
                let target = match &node.name {
                    Some(name) => Some(*output_columns.get(name).ok_or_else(|| {
                        PipeError::config(format!(
                            "case expression targets unknown output column '{name}'"
                        ))
                    })?),
                    None => None,
                };
                Ok((target, compile(node, input_columns)?))
            })
            .collect()
    };
    let mut branches = Vec::with_capacity(case_exprs.len());
    for case in case_exprs {
        branches.push((compile(&case.when, input_columns)?, compile_targets(&case.then)?));
    }
    Ok(CompiledCase {
        branches,
        else_exprs: compile_targets(else_exprs)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> HashMap<String, usize> {
        [("a".to_string(), 0), ("b".to_string(), 1)].into()
    }

    fn leaf(kind: &str, expr: &str) -> ExpressionNode {
        ExpressionNode {
            node_type: Some(kind.to_string()),
            expr: Some(expr.to_string()),
            ..Default::default()
        }
    }

    fn binary(lhs: ExpressionNode, op: &str, rhs: ExpressionNode) -> ExpressionNode {
        ExpressionNode {
            op: Some(op.to_string()),
            lhs: Some(Box::new(lhs)),
            rhs: Some(Box::new(rhs)),
            ..Default::default()
        }
    }

    #[test]
    fn select_plus_literal() {
        let mut node = binary(leaf("select", "a"), "+", leaf("value", "10"));
        node.rhs.as_mut().unwrap().as_rdf_type = Some("int".to_string());
        let compiled = compile(&node, &columns()).unwrap();
        let row = vec![Value::Int(5), Value::Null];
        assert_eq!(compiled.eval(&row).unwrap(), Value::Long(15));
    }

    #[test]
    fn comparison_with_null_is_unknown() {
        let node = binary(leaf("select", "a"), "<", leaf("select", "b"));
        let compiled = compile(&node, &columns()).unwrap();
        let row = vec![Value::Int(5), Value::Null];
        assert_eq!(compiled.eval(&row).unwrap(), Value::Null);
        let row = vec![Value::Int(5), Value::Int(6)];
        assert_eq!(compiled.eval(&row).unwrap(), Value::Int(1));
    }

    #[test]
    fn three_valued_and_or() {
        let null = || {
            let mut n = leaf("value", "");
            n.expr = Some(String::new());
            n
        };
        let t = || leaf("value", "1");
        // false AND unknown = false
        let node = binary(
            binary(t(), "!=", t()), // false
            "and",
            null(),
        );
        let compiled = compile(&node, &columns()).unwrap();
        assert_eq!(compiled.eval(&vec![]).unwrap(), Value::Int(0));
        // true OR unknown = true
        let node = binary(binary(t(), "=", t()), "or", null());
        let compiled = compile(&node, &columns()).unwrap();
        assert_eq!(compiled.eval(&vec![]).unwrap(), Value::Int(1));
        // true AND unknown = unknown
        let node = binary(binary(t(), "=", t()), "and", null());
        let compiled = compile(&node, &columns()).unwrap();
        assert_eq!(compiled.eval(&vec![]).unwrap(), Value::Null);
    }

    #[test]
    fn unknown_column_is_a_config_error() {
        let node = leaf("select", "missing");
        assert!(compile(&node, &columns()).is_err());
    }
}
