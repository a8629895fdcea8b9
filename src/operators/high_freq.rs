//! `high_freq`: bounded frequency counting of column values. At end of
//! input, the values above the `top_pct` percentile (or within `top_rank`)
//! are emitted as `{column_name, value, count}` rows.
//!
//! The counter is exact but bounded: when it overflows its capacity the
//! bottom half of the counts is pruned. Only the head of the distribution
//! survives, which is all the cut needs.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::model::{HighFreqSpec, TransformationSpec};
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::operators::TransformationPipe;

const MAX_TRACKED_VALUES: usize = 65_536;

struct TrackedColumn {
    spec: HighFreqSpec,
    from: usize,
    key_re: Option<Regex>,
    counts: HashMap<String, u64>,
}

impl TrackedColumn {
    fn observe(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        let text = value.render();
        let key = match &self.key_re {
            Some(re) => match re.captures(&text) {
                Some(caps) => caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| caps[0].to_string()),
                None => return,
            },
            None => text,
        };
        if self.counts.len() >= MAX_TRACKED_VALUES && !self.counts.contains_key(&key) {
            self.prune();
        }
        *self.counts.entry(key).or_insert(0) += 1;
    }

    fn prune(&mut self) {
        let mut counts: Vec<u64> = self.counts.values().copied().collect();
        counts.sort_unstable();
        let median = counts[counts.len() / 2];
        self.counts.retain(|_, c| *c > median);
    }

    /// The values that survive the configured cut, highest count first.
    fn cut(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if self.spec.top_rank > 0 {
            entries.truncate(self.spec.top_rank);
        } else if self.spec.top_percentile > 0 && !entries.is_empty() {
            let keep = (entries.len() * self.spec.top_percentile).div_ceil(100);
            entries.truncate(keep.max(1));
        }
        entries
    }
}

pub struct HighFreqPipe {
    out: OutputChannel,
    tracked: Vec<TrackedColumn>,
    name_pos: usize,
    value_pos: usize,
    count_pos: usize,
    out_width: usize,
    cancel: CancellationToken,
}

impl HighFreqPipe {
    pub fn new(
        ctx: &BuilderContext,
        source: &InputChannel,
        out: OutputChannel,
        spec: &TransformationSpec,
    ) -> PipeResult<Self> {
        let out_pos = |name: &str| {
            out.columns.get(name).copied().ok_or_else(|| {
                PipeError::config(format!(
                    "high_freq output channel '{}' requires a '{name}' column",
                    out.name()
                ))
            })
        };
        let mut tracked = Vec::new();
        for hf in spec.high_freq_columns.iter().flatten() {
            let from = source.columns.get(&hf.name).copied().ok_or_else(|| {
                PipeError::config(format!(
                    "high_freq column '{}' is not in input channel '{}'",
                    hf.name,
                    source.name()
                ))
            })?;
            let key_re = if hf.key_re.is_empty() {
                None
            } else {
                Some(Regex::new(&hf.key_re).map_err(|e| {
                    PipeError::config(format!(
                        "high_freq column '{}' key_re does not compile: {e}",
                        hf.name
                    ))
                })?)
            };
            tracked.push(TrackedColumn {
                spec: hf.clone(),
                from,
                key_re,
                counts: HashMap::new(),
            });
        }
        Ok(Self {
            name_pos: out_pos("column_name")?,
            value_pos: out_pos("value")?,
            count_pos: out_pos("count")?,
            out_width: out.spec.columns.len(),
            out,
            tracked,
            cancel: ctx.cancel.clone(),
        })
    }
}

#[async_trait]
impl TransformationPipe for HighFreqPipe {
    async fn apply(&mut self, row: &Row) -> PipeResult<()> {
        for tracked in &mut self.tracked {
            if let Some(v) = row.get(tracked.from) {
                tracked.observe(v);
            }
        }
        Ok(())
    }

    async fn done(&mut self) -> PipeResult<()> {
        for tracked in &self.tracked {
            for (value, count) in tracked.cut() {
                let mut out_row = vec![Value::Null; self.out_width];
                out_row[self.name_pos] = Value::Text(tracked.spec.name.clone());
                out_row[self.value_pos] = Value::Text(value);
                out_row[self.count_pos] = Value::Ulong(count);
                self.out.send(out_row, &self.cancel).await?;
            }
        }
        Ok(())
    }

    async fn finally(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::tests::test_context;

    #[tokio::test]
    async fn top_rank_cut() {
        let ctx = test_context(&[
            ("in_rows", &["code"]),
            ("freq", &["column_name", "value", "count"]),
        ]);
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("freq").unwrap();
        let sink = ctx.registry.get_input_channel("freq").unwrap();
        let spec: TransformationSpec = serde_json::from_value(serde_json::json!({
            "type": "high_freq",
            "high_freq_columns": [{"name": "code", "top_rank": 2}],
            "output_channel": {"name": "freq", "channel_spec_name": "freq_spec"}
        }))
        .unwrap();
        let mut pipe = HighFreqPipe::new(&ctx, &source, out, &spec).unwrap();

        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = sink.recv().await {
                got.push(r);
            }
            got
        });
        for code in ["a", "a", "a", "b", "b", "c"] {
            pipe.apply(&vec![Value::Text(code.into())]).await.unwrap();
        }
        pipe.done().await.unwrap();
        ctx.registry.close_channel("freq");
        drop(pipe);
        let got = drain.await.unwrap();

        assert_eq!(got.len(), 2);
        assert_eq!(got[0][1], Value::Text("a".into()));
        assert_eq!(got[0][2], Value::Ulong(3));
        assert_eq!(got[1][1], Value::Text("b".into()));
    }
}
