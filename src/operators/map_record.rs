//! `map_record`: one output row per input row, each output column produced
//! by a compiled column action (`select`, `value`, `eval`, `map`, `case`,
//! `hash`, `lookup`). With `new_record=false` the output row starts as a
//! positional copy of the input and the actions overwrite their columns.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cleansing::CleansingContext;
use crate::config::model::{TransformationColumnSpec, TransformationSpec};
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::expr::{CompiledCase, CompiledExpr, CompiledHash, compile, compile_case, compile_hash, truthy};
use crate::lookup::LookupTable;
use crate::operators::{BadRowSender, TransformationPipe};

enum ColumnAction {
    Select {
        to: usize,
        from: usize,
    },
    Value {
        to: usize,
        value: Value,
    },
    Eval {
        to: usize,
        expr: CompiledExpr,
        where_expr: Option<CompiledExpr>,
    },
    Map {
        to: usize,
        from: usize,
        from_name: String,
        function: String,
        argument: Option<String>,
        default: Option<String>,
        err_msg: Option<String>,
        rdf_type: String,
    },
    Case {
        to: usize,
        case: CompiledCase,
    },
    Hash {
        to: usize,
        hash: CompiledHash,
    },
    Lookup {
        to: usize,
        table: Arc<LookupTable>,
        key_parts: Vec<CompiledExpr>,
        value_index: usize,
    },
}

pub struct MapRecordPipe {
    out: OutputChannel,
    actions: Vec<ColumnAction>,
    new_record: bool,
    out_width: usize,
    cleansing: CleansingContext,
    errors: BadRowSender,
    cancel: CancellationToken,
}

impl MapRecordPipe {
    pub fn new(
        ctx: &BuilderContext,
        source: &InputChannel,
        out: OutputChannel,
        spec: &TransformationSpec,
    ) -> PipeResult<Self> {
        let mut cleansing = CleansingContext::new(source.columns.clone());
        let mut actions = Vec::with_capacity(spec.columns.len());
        for column in &spec.columns {
            actions.push(compile_column(ctx, source, &out, column, &mut cleansing)?);
        }
        Ok(Self {
            out_width: out.spec.columns.len(),
            actions,
            new_record: spec.new_record,
            cleansing,
            errors: BadRowSender::new(ctx, source)?,
            cancel: ctx.cancel.clone(),
            out,
        })
    }
}

fn target_position(out: &OutputChannel, name: &str) -> PipeResult<usize> {
    out.columns.get(name).copied().ok_or_else(|| {
        PipeError::config(format!(
            "map_record column '{name}' is not in output channel '{}'",
            out.name()
        ))
    })
}

fn source_position(source: &InputChannel, name: &str) -> PipeResult<usize> {
    source.columns.get(name).copied().ok_or_else(|| {
        PipeError::config(format!(
            "map_record: column '{name}' is not in input channel '{}'",
            source.name()
        ))
    })
}

fn compile_column(
    ctx: &BuilderContext,
    source: &InputChannel,
    out: &OutputChannel,
    column: &TransformationColumnSpec,
    cleansing: &mut CleansingContext,
) -> PipeResult<ColumnAction> {
    let to = target_position(out, &column.name)?;
    match column.column_type.as_str() {
        "select" => {
            let expr = column.expr.as_deref().unwrap_or(&column.name);
            Ok(ColumnAction::Select {
                to,
                from: source_position(source, expr)?,
            })
        }
        "value" => {
            let expr = column.expr.as_deref().ok_or_else(|| {
                PipeError::config(format!("value column '{}' requires expr", column.name))
            })?;
            // context substitution: $key values resolved by the controller
            let resolved = ctx.substitute_context(expr);
            Ok(ColumnAction::Value {
                to,
                value: Value::cast(&resolved, "text")?,
            })
        }
        "eval" => {
            let node = column.eval_expr.as_ref().ok_or_else(|| {
                PipeError::config(format!("eval column '{}' requires eval_expr", column.name))
            })?;
            let where_expr = column
                .where_expr
                .as_ref()
                .map(|w| compile(w, &source.columns))
                .transpose()?;
            Ok(ColumnAction::Eval {
                to,
                expr: compile(node, &source.columns)?,
                where_expr,
            })
        }
        "map" => {
            let map_expr = column.map_expr.as_ref().ok_or_else(|| {
                PipeError::config(format!("map column '{}' requires map_expr", column.name))
            })?;
            let function = map_expr.cleansing_function.clone().ok_or_else(|| {
                PipeError::config(format!(
                    "map column '{}' requires a cleansing_function",
                    column.name
                ))
            })?;
            cleansing.precompile(&function, map_expr.argument.as_deref())?;
            let mut from_name = column
                .map_on
                .clone()
                .or_else(|| column.expr.clone())
                .unwrap_or_else(|| column.name.clone());
            // fall back to the first alternate present in the input
            let from = match source.columns.get(&from_name) {
                Some(pos) => *pos,
                None => {
                    let alternate = column
                        .alternate_map_on
                        .iter()
                        .flatten()
                        .find_map(|alt| source.columns.get(alt).map(|p| (alt.clone(), *p)));
                    match alternate {
                        Some((name, pos)) => {
                            from_name = name;
                            pos
                        }
                        None => return Err(source_position(source, &from_name).unwrap_err()),
                    }
                }
            };
            Ok(ColumnAction::Map {
                to,
                from,
                from_name,
                function,
                argument: map_expr.argument.clone(),
                default: map_expr.default.clone(),
                err_msg: map_expr.err_msg.clone(),
                rdf_type: map_expr.rdf_type.clone(),
            })
        }
        "case" => Ok(ColumnAction::Case {
            to,
            case: compile_case(
                &column.case_expr,
                &column.else_expr,
                &source.columns,
                &out.columns,
            )?,
        }),
        "hash" => {
            let hash_expr = column.hash_expr.as_ref().ok_or_else(|| {
                PipeError::config(format!("hash column '{}' requires hash_expr", column.name))
            })?;
            Ok(ColumnAction::Hash {
                to,
                hash: compile_hash(hash_expr, &source.columns)?,
            })
        }
        "lookup" => {
            let name = column.lookup_name.as_ref().ok_or_else(|| {
                PipeError::config(format!(
                    "lookup column '{}' requires lookup_name",
                    column.name
                ))
            })?;
            let table = ctx.lookup_mgr.get(name)?;
            let key_specs = column.lookup_key.as_ref().ok_or_else(|| {
                PipeError::config(format!("lookup column '{}' requires key", column.name))
            })?;
            let mut key_parts = Vec::with_capacity(key_specs.len());
            for k in key_specs {
                let node = crate::config::model::ExpressionNode {
                    node_type: Some(k.column_type.clone()),
                    expr: k.expr.clone().or_else(|| Some(k.name.clone())),
                    ..Default::default()
                };
                key_parts.push(compile(&node, &source.columns)?);
            }
            // the projected value column is named by `expr` (first declared
            // lookup value when absent)
            let value_name = column.expr.clone().unwrap_or_else(|| {
                column
                    .lookup_values
                    .as_ref()
                    .and_then(|v| v.first())
                    .map(|v| v.name.clone())
                    .unwrap_or_default()
            });
            let value_index = table.value_position(&value_name).ok_or_else(|| {
                PipeError::config(format!(
                    "lookup column '{}': '{value_name}' is not a value of lookup '{name}'",
                    column.name
                ))
            })?;
            Ok(ColumnAction::Lookup {
                to,
                table,
                key_parts,
                value_index,
            })
        }
        other => Err(PipeError::config(format!(
            "unknown map_record column type '{other}' for column '{}'",
            column.name
        ))),
    }
}

#[async_trait]
impl TransformationPipe for MapRecordPipe {
    async fn apply(&mut self, row: &Row) -> PipeResult<()> {
        // positional inheritance when extending the record in place
        let mut current: Row = if self.new_record {
            vec![Value::Null; self.out_width]
        } else {
            let mut c = row.clone();
            c.resize(self.out_width, Value::Null);
            c
        };
        let mut bad_row = false;
        for action in &self.actions {
            match action {
                ColumnAction::Select { to, from } => {
                    current[*to] = row.get(*from).cloned().unwrap_or(Value::Null);
                }
                ColumnAction::Value { to, value } => {
                    current[*to] = value.clone();
                }
                ColumnAction::Eval {
                    to,
                    expr,
                    where_expr,
                } => {
                    if let Some(w) = where_expr {
                        match w.eval(row) {
                            Ok(v) if truthy(&v) => {}
                            Ok(_) => continue,
                            Err(e) => {
                                self.errors.send(row, "where", &e).await?;
                                bad_row = true;
                                continue;
                            }
                        }
                    }
                    match expr.eval(row) {
                        Ok(v) => current[*to] = v,
                        Err(e) => {
                            self.errors.send(row, "eval", &e).await?;
                            bad_row = true;
                        }
                    }
                }
                ColumnAction::Map {
                    to,
                    from,
                    from_name,
                    function,
                    argument,
                    default,
                    err_msg,
                    rdf_type,
                } => {
                    let input_value = row
                        .get(*from)
                        .map(Value::render)
                        .unwrap_or_default();
                    let outcome =
                        self.cleansing
                            .apply(function, argument.as_deref(), &input_value, row);
                    current[*to] = match outcome {
                        Ok(Value::Null) => match (default, err_msg) {
                            (Some(d), _) => Value::cast(d, rdf_type)?,
                            (None, Some(msg)) => {
                                // a null result with err_msg set is a bad row
                                self.errors
                                    .send(row, from_name, &crate::error::BadValue(msg.clone()))
                                    .await?;
                                bad_row = true;
                                Value::Null
                            }
                            (None, None) => Value::Null,
                        },
                        Ok(v) => {
                            if rdf_type.is_empty() || matches!(v, Value::TextList(_)) {
                                v
                            } else {
                                match Value::cast(&v.render(), rdf_type) {
                                    Ok(cast) => cast,
                                    Err(_) => v,
                                }
                            }
                        }
                        Err(e) => {
                            self.errors.send(row, from_name, &e).await?;
                            bad_row = true;
                            match default {
                                Some(d) => Value::cast(d, rdf_type)?,
                                None => Value::Null,
                            }
                        }
                    };
                }
                ColumnAction::Case { to, case } => {
                    let mut taken = false;
                    for (when, targets) in &case.branches {
                        let cond = when.eval(row).unwrap_or(Value::Null);
                        if truthy(&cond) {
                            apply_case_targets(&mut current, *to, targets, row)?;
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        apply_case_targets(&mut current, *to, &case.else_exprs, row)?;
                    }
                }
                ColumnAction::Hash { to, hash } => {
                    current[*to] = Value::Ulong(hash.eval(row));
                }
                ColumnAction::Lookup {
                    to,
                    table,
                    key_parts,
                    value_index,
                } => {
                    let mut parts = Vec::with_capacity(key_parts.len());
                    for p in key_parts {
                        parts.push(p.eval(row).map(|v| v.render()).unwrap_or_default());
                    }
                    let key = LookupTable::compose_key(&parts);
                    current[*to] = table
                        .lookup(&key)
                        .and_then(|values| values.get(*value_index).cloned())
                        .unwrap_or(Value::Null);
                }
            }
        }
        let _ = bad_row; // bad columns are reported; the row still flows
        self.out.send(current, &self.cancel).await
    }

    async fn done(&mut self) -> PipeResult<()> {
        Ok(())
    }

    async fn finally(&mut self) {}
}

fn apply_case_targets(
    current: &mut Row,
    own: usize,
    targets: &[(Option<usize>, CompiledExpr)],
    row: &Row,
) -> PipeResult<()> {
    for (target, expr) in targets {
        let v = expr.eval(row).unwrap_or(Value::Null);
        current[target.unwrap_or(own)] = v;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::tests::test_context;
    use crate::core::registry::PROCESS_ERRORS_CHANNEL;

    fn spec() -> TransformationSpec {
        serde_json::from_value(serde_json::json!({
            "type": "map_record",
            "new_record": true,
            "columns": [
                {"name": "zip5", "type": "map", "map_on": "zip",
                 "map_expr": {"cleansing_function": "to_zip5",
                              "err_msg": "bad zip"}},
                {"name": "amount", "type": "select"},
                {"name": "bucket", "type": "case",
                 "case_expr": [{
                    "when": {"op": ">=",
                        "lhs": {"type": "select", "expr": "amount"},
                        "rhs": {"type": "value", "expr": "100", "as_rdf_type": "int"}},
                    "then": [{"type": "value", "expr": "high"}]
                 }],
                 "else_expr": [{"type": "value", "expr": "low"}]},
                {"name": "jets_partition_key", "type": "hash",
                 "hash_expr": {"expr": "zip", "nbr_jets_partitions": 8}}
            ],
            "output_channel": {"name": "mapped", "channel_spec_name": "mapped_spec"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn maps_cleanses_and_reports_bad_rows() {
        let ctx = test_context(&[
            ("in_rows", &["zip", "amount", "jets_key"]),
            ("mapped", &["zip5", "amount", "bucket", "jets_partition_key"]),
        ]);
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("mapped").unwrap();
        let sink = ctx.registry.get_input_channel("mapped").unwrap();
        let errors = ctx.registry.get_input_channel(PROCESS_ERRORS_CHANNEL).unwrap();
        let mut pipe = MapRecordPipe::new(&ctx, &source, out, &spec()).unwrap();

        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = sink.recv().await {
                got.push(r);
            }
            got
        });
        let errors_drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = errors.recv().await {
                got.push(r);
            }
            got
        });

        pipe.apply(&vec![
            Value::Text("12345-6789".into()),
            Value::Int(250),
            Value::Text("row-1".into()),
        ])
        .await
        .unwrap();
        pipe.apply(&vec![
            Value::Text("00000".into()),
            Value::Int(10),
            Value::Text("row-2".into()),
        ])
        .await
        .unwrap();
        pipe.done().await.unwrap();
        ctx.registry.close_channel("mapped");
        ctx.registry.close_channel(PROCESS_ERRORS_CHANNEL);
        drop(pipe);
        let rows = drain.await.unwrap();
        let bad = errors_drain.await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Text("12345".into()));
        assert_eq!(rows[0][2], Value::Text("high".into()));
        assert_eq!(rows[1][0], Value::Null);
        assert_eq!(rows[1][2], Value::Text("low".into()));
        // the hash column is a partition id in range
        for row in &rows {
            let Value::Ulong(p) = row[3] else { panic!("expected partition id") };
            assert!(p < 8);
        }
        // the zeroed zip yielded a bad-row record, row kept flowing
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0][0], Value::Text("row-2".into()));
        assert_eq!(bad[0][2], Value::Text("zip".into()));
        assert_eq!(bad[0][3], Value::Text("bad zip".into()));
    }

    #[tokio::test]
    async fn extends_record_positionally_when_not_new() {
        let ctx = test_context(&[
            ("in_rows", &["a", "b"]),
            ("wider", &["a", "b", "c"]),
        ]);
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("wider").unwrap();
        let sink = ctx.registry.get_input_channel("wider").unwrap();
        let spec: TransformationSpec = serde_json::from_value(serde_json::json!({
            "type": "map_record",
            "new_record": false,
            "columns": [
                {"name": "c", "type": "value", "expr": "constant"}
            ],
            "output_channel": {"name": "wider", "channel_spec_name": "wider_spec"}
        }))
        .unwrap();
        let mut pipe = MapRecordPipe::new(&ctx, &source, out, &spec).unwrap();
        let drain = tokio::spawn(async move { sink.recv().await });
        pipe.apply(&vec![Value::Int(1), Value::Int(2)]).await.unwrap();
        ctx.registry.close_channel("wider");
        drop(pipe);
        let row = drain.await.unwrap().unwrap();
        // untouched columns inherit by position
        assert_eq!(
            row,
            vec![Value::Int(1), Value::Int(2), Value::Text("constant".into())]
        );
    }
}
