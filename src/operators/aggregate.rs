//! `aggregate`: group rows by the `select` columns and maintain one
//! accumulator per aggregated column (`count`, `distinct_count`, `sum`,
//! `min`, `map_reduce`). One output row per group at end of input, in
//! unspecified group order.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::model::{TransformationColumnSpec, TransformationSpec};
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::value::{ArithOp, Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::operators::TransformationPipe;

enum ColumnKind {
    GroupKey { from: usize },
    Count,
    CountColumn { from: usize },
    DistinctCount { from: usize },
    Sum { from: usize },
    Min { from: usize },
}

enum Accumulator {
    Key(Value),
    Count(i64),
    Distinct(HashSet<String>),
    Sum(Value),
    Min(Value),
}

impl Accumulator {
    fn update(&mut self, kind: &ColumnKind, row: &Row) {
        let at = |from: &usize| row.get(*from).cloned().unwrap_or(Value::Null);
        match (self, kind) {
            (Accumulator::Count(n), ColumnKind::Count) => *n += 1,
            (Accumulator::Count(n), ColumnKind::CountColumn { from }) => {
                if !at(from).is_null() {
                    *n += 1;
                }
            }
            (Accumulator::Distinct(seen), ColumnKind::DistinctCount { from }) => {
                let v = at(from);
                if !v.is_null() {
                    seen.insert(v.render());
                }
            }
            (Accumulator::Sum(acc), ColumnKind::Sum { from }) => {
                let v = at(from);
                if v.is_null() {
                    return;
                }
                if acc.is_null() {
                    *acc = v;
                } else if let Ok(sum) = acc.arith(ArithOp::Add, &v) {
                    *acc = sum;
                }
            }
            (Accumulator::Min(acc), ColumnKind::Min { from }) => {
                let v = at(from);
                if v.is_null() {
                    return;
                }
                let replace = match acc.compare(&v) {
                    None => true,
                    Some(ord) => ord.is_gt(),
                };
                if replace {
                    *acc = v;
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Key(v) => v,
            Accumulator::Count(n) => Value::Long(n),
            Accumulator::Distinct(seen) => Value::Long(seen.len() as i64),
            Accumulator::Sum(v) | Accumulator::Min(v) => v,
        }
    }
}

struct ColumnPlan {
    to: usize,
    kind: ColumnKind,
}

impl ColumnPlan {
    fn new_accumulator(&self, row: &Row) -> Accumulator {
        match &self.kind {
            ColumnKind::GroupKey { from } => {
                Accumulator::Key(row.get(*from).cloned().unwrap_or(Value::Null))
            }
            ColumnKind::Count | ColumnKind::CountColumn { .. } => Accumulator::Count(0),
            ColumnKind::DistinctCount { .. } => Accumulator::Distinct(HashSet::new()),
            ColumnKind::Sum { .. } => Accumulator::Sum(Value::Null),
            ColumnKind::Min { .. } => Accumulator::Min(Value::Null),
        }
    }
}

pub struct AggregatePipe {
    out: OutputChannel,
    plans: Vec<ColumnPlan>,
    key_positions: Vec<usize>,
    groups: HashMap<Vec<String>, Vec<Accumulator>>,
    out_width: usize,
    cancel: CancellationToken,
}

impl AggregatePipe {
    pub fn new(
        ctx: &BuilderContext,
        source: &InputChannel,
        out: OutputChannel,
        spec: &TransformationSpec,
    ) -> PipeResult<Self> {
        let mut plans = Vec::with_capacity(spec.columns.len());
        let mut key_positions = Vec::new();
        for column in &spec.columns {
            let plan = compile_column(source, &out, column)?;
            if let ColumnKind::GroupKey { from } = plan.kind {
                key_positions.push(from);
            }
            plans.push(plan);
        }
        Ok(Self {
            out_width: out.spec.columns.len(),
            plans,
            key_positions,
            groups: HashMap::new(),
            cancel: ctx.cancel.clone(),
            out,
        })
    }
}

fn compile_column(
    source: &InputChannel,
    out: &OutputChannel,
    column: &TransformationColumnSpec,
) -> PipeResult<ColumnPlan> {
    let to = out.columns.get(&column.name).copied().ok_or_else(|| {
        PipeError::config(format!(
            "aggregate column '{}' is not in output channel '{}'",
            column.name,
            out.name()
        ))
    })?;
    let source_pos = |name: &str| {
        source.columns.get(name).copied().ok_or_else(|| {
            PipeError::config(format!(
                "aggregate: column '{name}' is not in input channel '{}'",
                source.name()
            ))
        })
    };
    let from_name = column.expr.as_deref().unwrap_or(&column.name);
    let kind = match column.column_type.as_str() {
        "select" => ColumnKind::GroupKey {
            from: source_pos(from_name)?,
        },
        "count" => {
            // count of non-null values when an expr is given, else row count
            match &column.expr {
                Some(expr) => ColumnKind::CountColumn {
                    from: source_pos(expr)?,
                },
                None => ColumnKind::Count,
            }
        }
        "distinct_count" => ColumnKind::DistinctCount {
            from: source_pos(from_name)?,
        },
        "sum" => ColumnKind::Sum {
            from: source_pos(from_name)?,
        },
        "min" => ColumnKind::Min {
            from: source_pos(from_name)?,
        },
        "map_reduce" => {
            // the mapped column feeds the reduction declared in apply_reduce
            let mapped = column
                .apply_map
                .as_ref()
                .and_then(|m| m.first())
                .ok_or_else(|| {
                    PipeError::config(format!(
                        "map_reduce column '{}' requires apply_map",
                        column.name
                    ))
                })?;
            let from = source_pos(mapped.expr.as_deref().unwrap_or(&mapped.name))?;
            let reduce = column
                .apply_reduce
                .as_ref()
                .and_then(|r| r.first())
                .ok_or_else(|| {
                    PipeError::config(format!(
                        "map_reduce column '{}' requires apply_reduce",
                        column.name
                    ))
                })?;
            match reduce.column_type.as_str() {
                "count" => ColumnKind::CountColumn { from },
                "distinct_count" => ColumnKind::DistinctCount { from },
                "sum" => ColumnKind::Sum { from },
                "min" => ColumnKind::Min { from },
                other => {
                    return Err(PipeError::config(format!(
                        "map_reduce column '{}': unknown reduction '{other}'",
                        column.name
                    )));
                }
            }
        }
        other => {
            return Err(PipeError::config(format!(
                "unknown aggregate column type '{other}' for column '{}'",
                column.name
            )));
        }
    };
    Ok(ColumnPlan { to, kind })
}

#[async_trait]
impl TransformationPipe for AggregatePipe {
    async fn apply(&mut self, row: &Row) -> PipeResult<()> {
        let key: Vec<String> = self
            .key_positions
            .iter()
            .map(|p| row.get(*p).map(Value::render).unwrap_or_default())
            .collect();
        let accumulators = self
            .groups
            .entry(key)
            .or_insert_with(|| self.plans.iter().map(|p| p.new_accumulator(row)).collect());
        for (plan, acc) in self.plans.iter().zip(accumulators.iter_mut()) {
            acc.update(&plan.kind, row);
        }
        Ok(())
    }

    async fn done(&mut self) -> PipeResult<()> {
        for (_, accumulators) in self.groups.drain() {
            let mut out_row = vec![Value::Null; self.out_width];
            for (plan, acc) in self.plans.iter().zip(accumulators) {
                out_row[plan.to] = acc.finish();
            }
            self.out.send(out_row, &self.cancel).await?;
        }
        Ok(())
    }

    async fn finally(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::tests::test_context;
    use crate::core::value::Value;

    fn spec() -> TransformationSpec {
        serde_json::from_value(serde_json::json!({
            "type": "aggregate",
            "columns": [
                {"name": "client", "type": "select"},
                {"name": "nbr_rows", "type": "count"},
                {"name": "nbr_codes", "type": "distinct_count", "expr": "code"},
                {"name": "total", "type": "sum", "expr": "amount"},
                {"name": "lowest", "type": "min", "expr": "amount"}
            ],
            "output_channel": {"name": "agg", "channel_spec_name": "agg_spec"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn one_row_per_group() {
        let ctx = test_context(
            &[("in_rows", &["client", "code", "amount"]),
              ("agg", &["client", "nbr_rows", "nbr_codes", "total", "lowest"])],
        );
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("agg").unwrap();
        let sink = ctx.registry.get_input_channel("agg").unwrap();
        let mut pipe = AggregatePipe::new(&ctx, &source, out, &spec()).unwrap();

        let rows = vec![
            vec![Value::Text("acme".into()), Value::Text("a".into()), Value::Int(10)],
            vec![Value::Text("acme".into()), Value::Text("b".into()), Value::Int(5)],
            vec![Value::Text("acme".into()), Value::Text("a".into()), Value::Null],
            vec![Value::Text("zeta".into()), Value::Text("a".into()), Value::Int(7)],
        ];
        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = sink.recv().await {
                got.push(r);
            }
            got
        });
        for r in &rows {
            pipe.apply(r).await.unwrap();
        }
        pipe.done().await.unwrap();
        pipe.finally().await;
        ctx.registry.close_channel("agg");
        drop(pipe);
        let mut got = drain.await.unwrap();

        // aggregate row count equals the number of distinct group keys
        assert_eq!(got.len(), 2);
        got.sort_by_key(|r| r[0].render());
        assert_eq!(
            got[0],
            vec![
                Value::Text("acme".into()),
                Value::Long(3),
                Value::Long(2),
                Value::Long(15),
                Value::Int(5),
            ]
        );
        assert_eq!(got[1][1], Value::Long(1));
    }
}
