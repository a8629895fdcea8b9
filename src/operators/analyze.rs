//! `analyze`: profile every input column against configured regex tokens,
//! lookup tokens and keyword tokens, and emit one summary row per column at
//! end of input.
//!
//! The output channel must carry a `column_name` column; every declared
//! token name fills the output column of the same name with its match count.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::model::TransformationSpec;
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::expr::truthy;
use crate::lookup::LookupTable;
use crate::operators::TransformationPipe;

struct RegexToken {
    out_pos: usize,
    re: Regex,
}

struct LookupToken {
    table: Arc<LookupTable>,
    key_re: Option<Regex>,
    /// (lookup value column index, output column) per declared token
    tokens: Vec<(usize, usize)>,
}

struct KeywordToken {
    out_pos: usize,
    keywords: Vec<String>,
}

pub struct AnalyzePipe {
    out: OutputChannel,
    column_names: Vec<String>,
    name_pos: usize,
    regex_tokens: Vec<RegexToken>,
    lookup_tokens: Vec<LookupToken>,
    keyword_tokens: Vec<KeywordToken>,
    /// counters[input column][output column] -> count
    counters: Vec<HashMap<usize, i64>>,
    out_width: usize,
    cancel: CancellationToken,
}

impl AnalyzePipe {
    pub fn new(
        ctx: &BuilderContext,
        source: &InputChannel,
        out: OutputChannel,
        spec: &TransformationSpec,
    ) -> PipeResult<Self> {
        let out_pos = |name: &str| {
            out.columns.get(name).copied().ok_or_else(|| {
                PipeError::config(format!(
                    "analyze token '{name}' has no matching column in output channel '{}'",
                    out.name()
                ))
            })
        };
        let name_pos = out_pos("column_name")?;

        let mut regex_tokens = Vec::new();
        for node in spec.regex_tokens.iter().flatten() {
            regex_tokens.push(RegexToken {
                out_pos: out_pos(&node.name)?,
                re: Regex::new(&node.rexpr).map_err(|e| {
                    PipeError::config(format!(
                        "analyze regex token '{}' does not compile: {e}",
                        node.name
                    ))
                })?,
            });
        }

        let mut lookup_tokens = Vec::new();
        for node in spec.lookup_tokens.iter().flatten() {
            let table = ctx.lookup_mgr.get(&node.name)?;
            let key_re = if node.key_re.is_empty() {
                None
            } else {
                Some(Regex::new(&node.key_re).map_err(|e| {
                    PipeError::config(format!(
                        "analyze lookup token '{}' key_re does not compile: {e}",
                        node.name
                    ))
                })?)
            };
            let mut tokens = Vec::with_capacity(node.tokens.len());
            for token in &node.tokens {
                let value_index = table.value_position(token).ok_or_else(|| {
                    PipeError::config(format!(
                        "analyze lookup token '{token}' is not a value of lookup '{}'",
                        node.name
                    ))
                })?;
                tokens.push((value_index, out_pos(token)?));
            }
            lookup_tokens.push(LookupToken {
                table,
                key_re,
                tokens,
            });
        }

        let mut keyword_tokens = Vec::new();
        for node in spec.keyword_tokens.iter().flatten() {
            keyword_tokens.push(KeywordToken {
                out_pos: out_pos(&node.name)?,
                keywords: node.keywords.iter().map(|k| k.to_lowercase()).collect(),
            });
        }

        let column_names = source.spec.columns.clone();
        let counters = vec![HashMap::new(); column_names.len()];
        Ok(Self {
            out_width: out.spec.columns.len(),
            out,
            column_names,
            name_pos,
            regex_tokens,
            lookup_tokens,
            keyword_tokens,
            counters,
            cancel: ctx.cancel.clone(),
        })
    }
}

#[async_trait]
impl TransformationPipe for AnalyzePipe {
    async fn apply(&mut self, row: &Row) -> PipeResult<()> {
        for (pos, value) in row.iter().enumerate() {
            if pos >= self.counters.len() || value.is_null() {
                continue;
            }
            let text = value.render();
            let counter = &mut self.counters[pos];
            for token in &self.regex_tokens {
                if token.re.is_match(&text) {
                    *counter.entry(token.out_pos).or_insert(0) += 1;
                }
            }
            for token in &self.lookup_tokens {
                let key = match &token.key_re {
                    Some(re) => match re.captures(&text) {
                        Some(caps) => caps
                            .get(1)
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_else(|| caps[0].to_string()),
                        None => continue,
                    },
                    None => text.clone(),
                };
                if let Some(values) = token.table.lookup(&key) {
                    for (value_index, out_pos) in &token.tokens {
                        let flagged = values
                            .get(*value_index)
                            .map(truthy)
                            .unwrap_or(false);
                        if flagged {
                            *counter.entry(*out_pos).or_insert(0) += 1;
                        }
                    }
                }
            }
            let lowered = text.to_lowercase();
            for token in &self.keyword_tokens {
                if token.keywords.iter().any(|k| lowered.contains(k)) {
                    *counter.entry(token.out_pos).or_insert(0) += 1;
                }
            }
        }
        Ok(())
    }

    async fn done(&mut self) -> PipeResult<()> {
        for (pos, counter) in self.counters.drain(..).enumerate() {
            let mut out_row = vec![Value::Null; self.out_width];
            out_row[self.name_pos] = Value::Text(self.column_names[pos].clone());
            for (out_pos, count) in counter {
                out_row[out_pos] = Value::Long(count);
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

    #[tokio::test]
    async fn one_summary_row_per_column() {
        let ctx = test_context(&[
            ("scanned", &["ssn", "note"]),
            ("profile", &["column_name", "digits9", "urgent"]),
        ]);
        let source = ctx.registry.get_input_channel("scanned").unwrap();
        let out = ctx.registry.get_output_channel("profile").unwrap();
        let sink = ctx.registry.get_input_channel("profile").unwrap();
        let spec: TransformationSpec = serde_json::from_value(serde_json::json!({
            "type": "analyze",
            "regex_tokens": [{"name": "digits9", "re": "^[0-9]{9}$"}],
            "keyword_tokens": [{"name": "urgent", "keywords": ["urgent", "asap"]}],
            "output_channel": {"name": "profile", "channel_spec_name": "profile_spec"}
        }))
        .unwrap();
        let mut pipe = AnalyzePipe::new(&ctx, &source, out, &spec).unwrap();

        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(r) = sink.recv().await {
                got.push(r);
            }
            got
        });
        pipe.apply(&vec![
            Value::Text("123456789".into()),
            Value::Text("please do this ASAP".into()),
        ])
        .await
        .unwrap();
        pipe.apply(&vec![Value::Text("12-34".into()), Value::Null])
            .await
            .unwrap();
        pipe.done().await.unwrap();
        ctx.registry.close_channel("profile");
        drop(pipe);
        let mut got = drain.await.unwrap();
        got.sort_by_key(|r| r[0].render());

        assert_eq!(got.len(), 2);
        // note column: 1 keyword hit, no digit hits
        assert_eq!(got[0][0], Value::Text("note".into()));
        assert_eq!(got[0][2], Value::Long(1));
        assert_eq!(got[0][1], Value::Null);
        // ssn column: 1 regex hit
        assert_eq!(got[1][1], Value::Long(1));
    }
}
