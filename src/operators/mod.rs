//! The semantic operators. Each operator consumes rows handed to it by a
//! pipe executor, transforms them, and produces rows on its output channel.
//! Operators are built up-front by the executor through [`build_transformation`];
//! a configuration problem is surfaced there, before any row is processed.

pub mod aggregate;
pub mod analyze;
pub mod anonymize;
pub mod distinct;
pub mod high_freq;
pub mod map_record;
pub mod partition_writer;
pub mod shuffling;
pub mod table_writer;

use async_trait::async_trait;

use crate::config::model::TransformationSpec;
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::registry::PROCESS_ERRORS_CHANNEL;
use crate::core::results::ResultSender;
use crate::core::value::{Row, Value};
use crate::error::{BadValue, PipeError, PipeResult};

/// Lifecycle of an operator inside a pipe executor:
/// `apply` per row, `done` once at end of input, `finally` always.
#[async_trait]
pub trait TransformationPipe: Send {
    async fn apply(&mut self, row: &Row) -> PipeResult<()>;

    /// Flush state at end of input (emit aggregate groups, close part
    /// files, ...). Not called when the pipe failed earlier.
    async fn done(&mut self) -> PipeResult<()>;

    /// Release resources; called exactly once, error or not.
    async fn finally(&mut self);
}

/// Construct the operator named by the transformation spec.
pub fn build_transformation(
    ctx: &BuilderContext,
    source: &InputChannel,
    jets_partition_key: Option<String>,
    partition_result_tx: ResultSender,
    spec: &TransformationSpec,
) -> PipeResult<Box<dyn TransformationPipe>> {
    let out = ctx.registry.get_output_channel(&spec.output_channel.name)?;
    match spec.transformation_type.as_str() {
        "map_record" => Ok(Box::new(map_record::MapRecordPipe::new(
            ctx, source, out, spec,
        )?)),
        "aggregate" => Ok(Box::new(aggregate::AggregatePipe::new(
            ctx, source, out, spec,
        )?)),
        "analyze" => Ok(Box::new(analyze::AnalyzePipe::new(ctx, source, out, spec)?)),
        "high_freq" => Ok(Box::new(high_freq::HighFreqPipe::new(
            ctx, source, out, spec,
        )?)),
        "anonymize" => Ok(Box::new(anonymize::AnonymizePipe::new(
            ctx, source, out, spec,
        )?)),
        "distinct" => Ok(Box::new(distinct::DistinctPipe::new(
            ctx, source, out, spec,
        )?)),
        "shuffling" => Ok(Box::new(shuffling::ShufflingPipe::new(
            ctx, source, out, spec,
        )?)),
        "partition_writer" => Ok(Box::new(partition_writer::PartitionWriterPipe::new(
            ctx,
            source,
            out,
            jets_partition_key,
            partition_result_tx,
            spec,
        )?)),
        other => Err(PipeError::config(format!(
            "unknown transformation type '{other}'"
        ))),
    }
}

/// Emits bad-row records on the reserved `process_errors` channel with
/// `{jets_key, grouping_key, input_column, error_message}`.
pub struct BadRowSender {
    out: OutputChannel,
    jets_key_pos: Option<usize>,
    grouping_key_pos: Option<usize>,
    cancel: tokio_util::sync::CancellationToken,
}

impl BadRowSender {
    pub fn new(ctx: &BuilderContext, source: &InputChannel) -> PipeResult<Self> {
        Ok(Self {
            out: ctx.registry.get_output_channel(PROCESS_ERRORS_CHANNEL)?,
            jets_key_pos: source.columns.get("jets_key").copied(),
            grouping_key_pos: source.columns.get("grouping_key").copied(),
            cancel: ctx.cancel.clone(),
        })
    }

    pub async fn send(
        &self,
        input_row: &Row,
        input_column: &str,
        err: &BadValue,
    ) -> PipeResult<()> {
        let pick = |pos: Option<usize>| {
            pos.and_then(|p| input_row.get(p).cloned())
                .unwrap_or(Value::Null)
        };
        let record = vec![
            pick(self.jets_key_pos),
            pick(self.grouping_key_pos),
            Value::Text(input_column.to_string()),
            Value::Text(err.0.clone()),
        ];
        self.out.send(record, &self.cancel).await
    }
}
