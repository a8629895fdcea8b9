//! `distinct`: pass through only the first row seen for each value tuple of
//! the `distinct_on` columns.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::model::TransformationSpec;
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::lookup::LookupTable;
use crate::operators::TransformationPipe;

pub struct DistinctPipe {
    out: OutputChannel,
    positions: Vec<usize>,
    seen: HashSet<String>,
    cancel: CancellationToken,
}

impl DistinctPipe {
    pub fn new(
        ctx: &BuilderContext,
        source: &InputChannel,
        out: OutputChannel,
        spec: &TransformationSpec,
    ) -> PipeResult<Self> {
        let config = spec
            .distinct_config
            .as_ref()
            .ok_or_else(|| PipeError::config("distinct transformation requires distinct_config"))?;
        if config.distinct_on.is_empty() {
            return Err(PipeError::config("distinct_config.distinct_on is empty"));
        }
        let mut positions = Vec::with_capacity(config.distinct_on.len());
        for name in &config.distinct_on {
            let pos = source.columns.get(name).copied().ok_or_else(|| {
                PipeError::config(format!(
                    "distinct_on column '{name}' is not in input channel '{}'",
                    source.name()
                ))
            })?;
            positions.push(pos);
        }
        Ok(Self {
            out,
            positions,
            seen: HashSet::new(),
            cancel: ctx.cancel.clone(),
        })
    }
}

#[async_trait]
impl TransformationPipe for DistinctPipe {
    async fn apply(&mut self, row: &Row) -> PipeResult<()> {
        let parts: Vec<String> = self
            .positions
            .iter()
            .map(|p| row.get(*p).map(Value::render).unwrap_or_default())
            .collect();
        let key = LookupTable::compose_key(&parts);
        if self.seen.insert(key) {
            self.out.send(row.clone(), &self.cancel).await?;
        }
        Ok(())
    }

    async fn done(&mut self) -> PipeResult<()> {
        Ok(())
    }

    async fn finally(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::tests::test_context;
    use proptest::prelude::*;

    fn spec() -> TransformationSpec {
        serde_json::from_value(serde_json::json!({
            "type": "distinct",
            "distinct_config": {"distinct_on": ["k"]},
            "output_channel": {"name": "uniq", "channel_spec_name": "uniq_spec"}
        }))
        .unwrap()
    }

    async fn run_distinct(keys: Vec<String>) -> Vec<Row> {
        let ctx = test_context(&[("in_rows", &["k", "v"]), ("uniq", &["k", "v"])]);
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("uniq").unwrap();
        let sink = ctx.registry.get_input_channel("uniq").unwrap();
        let mut pipe = DistinctPipe::new(&ctx, &source, out, &spec()).unwrap();
        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = sink.recv().await {
                got.push(r);
            }
            got
        });
        for (i, k) in keys.iter().enumerate() {
            pipe.apply(&vec![Value::Text(k.clone()), Value::Int(i as i32)])
                .await
                .unwrap();
        }
        pipe.done().await.unwrap();
        ctx.registry.close_channel("uniq");
        drop(pipe);
        drain.await.unwrap()
    }

    #[tokio::test]
    async fn first_row_per_tuple_wins() {
        let got = run_distinct(vec!["a".into(), "b".into(), "a".into()]).await;
        assert_eq!(got.len(), 2);
        // the first "a" row (v=0) survives, not the second (v=2)
        assert_eq!(got[0], vec![Value::Text("a".into()), Value::Int(0)]);
    }

    proptest! {
        // output is a subset of input with no repeated distinct_on tuple
        #[test]
        fn subset_and_unique(keys in proptest::collection::vec("[a-d]{1,2}", 0..24)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let got = rt.block_on(run_distinct(keys.clone()));
            let mut seen = std::collections::HashSet::new();
            for row in &got {
                let k = row[0].render();
                prop_assert!(keys.contains(&k));
                prop_assert!(seen.insert(k));
            }
            let distinct: std::collections::HashSet<_> = keys.iter().cloned().collect();
            prop_assert_eq!(got.len(), distinct.len());
        }
    }
}
