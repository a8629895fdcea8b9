//! `anonymize`: replace the values of the configured fields with stable
//! tokens (`key_prefix` + sequence) and emit the value-to-token mapping on
//! the side `keys_output_channel`. Values found in the optional lookup are
//! preserved untouched.
//!
//! The fields to anonymize are the columns listed in the transformation's
//! `data_schema`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::model::TransformationSpec;
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::lookup::LookupTable;
use crate::operators::TransformationPipe;

pub struct AnonymizePipe {
    out: OutputChannel,
    keys_out: OutputChannel,
    key_prefix: String,
    positions: Vec<usize>,
    preserve: Option<Arc<LookupTable>>,
    tokens: HashMap<String, String>,
    sequence: u64,
    original_pos: usize,
    token_pos: usize,
    keys_width: usize,
    cancel: CancellationToken,
}

impl AnonymizePipe {
    pub fn new(
        ctx: &BuilderContext,
        source: &InputChannel,
        out: OutputChannel,
        spec: &TransformationSpec,
    ) -> PipeResult<Self> {
        let config = spec.anonymize_config.as_ref().ok_or_else(|| {
            PipeError::config("anonymize transformation requires anonymize_config")
        })?;
        let schema = spec.data_schema.as_ref().ok_or_else(|| {
            PipeError::config("anonymize transformation requires data_schema naming the fields")
        })?;
        let mut positions = Vec::with_capacity(schema.len());
        for field in schema {
            let pos = source.columns.get(&field.column).copied().ok_or_else(|| {
                PipeError::config(format!(
                    "anonymize field '{}' is not in input channel '{}'",
                    field.column,
                    source.name()
                ))
            })?;
            positions.push(pos);
        }
        let preserve = if config.lookup_name.is_empty() {
            None
        } else {
            Some(ctx.lookup_mgr.get(&config.lookup_name)?)
        };
        let keys_out = ctx
            .registry
            .get_output_channel(&config.keys_output_channel.name)?;
        let keys_pos = |name: &str| {
            keys_out.columns.get(name).copied().ok_or_else(|| {
                PipeError::config(format!(
                    "anonymize keys_output_channel '{}' requires a '{name}' column",
                    keys_out.name()
                ))
            })
        };
        Ok(Self {
            original_pos: keys_pos("original_value")?,
            token_pos: keys_pos("anonymized_value")?,
            keys_width: keys_out.spec.columns.len(),
            keys_out,
            key_prefix: config.key_prefix.clone(),
            positions,
            preserve,
            tokens: HashMap::new(),
            sequence: 0,
            cancel: ctx.cancel.clone(),
            out,
        })
    }

    async fn token_for(&mut self, original: &str) -> PipeResult<String> {
        if let Some(token) = self.tokens.get(original) {
            return Ok(token.clone());
        }
        let token = format!("{}{}", self.key_prefix, self.sequence);
        self.sequence += 1;
        self.tokens.insert(original.to_string(), token.clone());
        let mut mapping = vec![Value::Null; self.keys_width];
        mapping[self.original_pos] = Value::Text(original.to_string());
        mapping[self.token_pos] = Value::Text(token.clone());
        self.keys_out.send(mapping, &self.cancel).await?;
        Ok(token)
    }
}

#[async_trait]
impl TransformationPipe for AnonymizePipe {
    async fn apply(&mut self, row: &Row) -> PipeResult<()> {
        let mut out_row = row.clone();
        for pos in self.positions.clone() {
            let Some(v) = out_row.get(pos) else { continue };
            if v.is_null() {
                continue;
            }
            let original = v.render();
            if let Some(lookup) = &self.preserve {
                if lookup.contains(&original) {
                    continue;
                }
            }
            let token = self.token_for(&original).await?;
            out_row[pos] = Value::Text(token);
        }
        self.out.send(out_row, &self.cancel).await
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

    #[tokio::test]
    async fn stable_tokens_and_mapping_side_channel() {
        let ctx = test_context(&[
            ("in_rows", &["member_id", "amount"]),
            ("anon", &["member_id", "amount"]),
            ("anon_keys", &["original_value", "anonymized_value"]),
        ]);
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("anon").unwrap();
        let sink = ctx.registry.get_input_channel("anon").unwrap();
        let keys_sink = ctx.registry.get_input_channel("anon_keys").unwrap();
        let spec: TransformationSpec = serde_json::from_value(serde_json::json!({
            "type": "anonymize",
            "data_schema": [{"column": "member_id", "rdf_type": "text"}],
            "anonymize_config": {
                "key_prefix": "tok-",
                "keys_output_channel": {"name": "anon_keys", "channel_spec_name": "anon_keys_spec"}
            },
            "output_channel": {"name": "anon", "channel_spec_name": "anon_spec"}
        }))
        .unwrap();
        let mut pipe = AnonymizePipe::new(&ctx, &source, out, &spec).unwrap();

        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = sink.recv().await {
                got.push(r);
            }
            got
        });
        let keys_drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = keys_sink.recv().await {
                got.push(r);
            }
            got
        });
        for (id, amount) in [("m1", 10), ("m2", 20), ("m1", 30)] {
            pipe.apply(&vec![Value::Text(id.into()), Value::Int(amount)])
                .await
                .unwrap();
        }
        pipe.done().await.unwrap();
        ctx.registry.close_channel("anon");
        ctx.registry.close_channel("anon_keys");
        drop(pipe);
        let rows = drain.await.unwrap();
        let mappings = keys_drain.await.unwrap();

        // same input value, same token
        assert_eq!(rows[0][0], rows[2][0]);
        assert_eq!(rows[0][0], Value::Text("tok-0".into()));
        assert_eq!(rows[1][0], Value::Text("tok-1".into()));
        // amounts untouched
        assert_eq!(rows[2][1], Value::Int(30));
        // one mapping per distinct value
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0][0], Value::Text("m1".into()));
    }
}
