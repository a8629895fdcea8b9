//! `shuffling`: buffer the input and re-emit it in an order that breaks any
//! external ordering dependency. The permutation is random but seeded from
//! the session id, so a re-run of the same session shuffles identically.

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

use crate::config::model::TransformationSpec;
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::value::Row;
use crate::error::PipeResult;
use crate::expr::hash_row_value;
use crate::operators::TransformationPipe;

pub struct ShufflingPipe {
    out: OutputChannel,
    buffer: Vec<Row>,
    seed: u64,
    cancel: CancellationToken,
}

impl ShufflingPipe {
    pub fn new(
        ctx: &BuilderContext,
        _source: &InputChannel,
        out: OutputChannel,
        _spec: &TransformationSpec,
    ) -> PipeResult<Self> {
        Ok(Self {
            out,
            buffer: Vec::new(),
            seed: hash_row_value(&ctx.session_id, u64::MAX),
            cancel: ctx.cancel.clone(),
        })
    }
}

#[async_trait]
impl TransformationPipe for ShufflingPipe {
    async fn apply(&mut self, row: &Row) -> PipeResult<()> {
        self.buffer.push(row.clone());
        Ok(())
    }

    async fn done(&mut self) -> PipeResult<()> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.buffer.shuffle(&mut rng);
        for row in self.buffer.drain(..) {
            self.out.send(row, &self.cancel).await?;
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

    async fn run_shuffle(session_id: &str) -> Vec<i32> {
        let ctx = test_context(&[("in_rows", &["v"]), ("shuffled", &["v"])]);
        let mut ctx = ctx;
        ctx.session_id = session_id.to_string();
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("shuffled").unwrap();
        let sink = ctx.registry.get_input_channel("shuffled").unwrap();
        let spec: TransformationSpec = serde_json::from_value(serde_json::json!({
            "type": "shuffling",
            "output_channel": {"name": "shuffled", "channel_spec_name": "shuffled_spec"}
        }))
        .unwrap();
        let mut pipe = ShufflingPipe::new(&ctx, &source, out, &spec).unwrap();
        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = sink.recv().await {
                if let Value::Int(v) = r[0] {
                    got.push(v);
                }
            }
            got
        });
        for v in 0..32 {
            pipe.apply(&vec![Value::Int(v)]).await.unwrap();
        }
        pipe.done().await.unwrap();
        ctx.registry.close_channel("shuffled");
        drop(pipe);
        drain.await.unwrap()
    }

    #[tokio::test]
    async fn deterministic_per_session() {
        let a = run_shuffle("session-1").await;
        let b = run_shuffle("session-1").await;
        let c = run_shuffle("session-2").await;
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..32).collect::<Vec<_>>());
    }
}
