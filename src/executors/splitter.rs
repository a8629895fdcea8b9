//! `splitter`: partition rows by a column value into a dynamically growing
//! set of per-partition sub-pipelines, each an instance of the pipe's
//! `apply` list parameterised by the partition key.
//!
//! Variants: `standard` uses the column value (or `default_splitter_value`
//! for null); `ext_count` additionally caps each partition at
//! `partition_row_count` rows and spills into `value0`, `value1`, ...

use std::collections::HashMap;

use crate::config::model::{PipeSpec, SplitterSpec};
use crate::core::builder::BuilderContext;
use crate::core::channel::InputChannel;
use crate::core::results::ResultSender;
use crate::core::value::Row;
use crate::error::{PipeError, PipeResult};
use crate::executors::guard_pipe;
use crate::operators::{TransformationPipe, build_transformation};

pub async fn start_splitter_pipe(
    ctx: BuilderContext,
    spec: PipeSpec,
    source: InputChannel,
    result_tx: ResultSender,
) {
    guard_pipe(&ctx, &spec, run(&ctx, &spec, source, result_tx.clone())).await;
    drop(result_tx);
}

struct SubPipeline {
    evaluators: Vec<Box<dyn TransformationPipe>>,
    rows: usize,
}

/// Row budget tracking for the ext_count variant.
struct ExtCount {
    partition_row_count: usize,
    /// base value -> index of the currently filling extension
    current: HashMap<String, usize>,
}

async fn run(
    ctx: &BuilderContext,
    spec: &PipeSpec,
    source: InputChannel,
    result_tx: ResultSender,
) -> PipeResult<()> {
    let splitter: &SplitterSpec = spec
        .splitter_config
        .as_ref()
        .ok_or_else(|| PipeError::config("splitter pipe requires splitter_config"))?;
    let column_pos = source
        .columns
        .get(&splitter.column)
        .copied()
        .ok_or_else(|| {
            PipeError::config(format!(
                "splitter column '{}' is not in input channel '{}'",
                splitter.column,
                source.name()
            ))
        })?;
    let mut ext_count = match splitter.splitter_type.as_str() {
        "" | "standard" => None,
        "ext_count" => {
            if splitter.partition_row_count == 0 {
                return Err(PipeError::config(
                    "ext_count splitter requires partition_row_count > 0",
                ));
            }
            Some(ExtCount {
                partition_row_count: splitter.partition_row_count,
                current: HashMap::new(),
            })
        }
        other => {
            return Err(PipeError::config(format!(
                "unknown splitter type '{other}'"
            )));
        }
    };

    let mut pipelines: HashMap<String, SubPipeline> = HashMap::new();
    let outcome = split_rows(
        ctx,
        spec,
        &source,
        &result_tx,
        column_pos,
        splitter,
        &mut ext_count,
        &mut pipelines,
    )
    .await;

    match outcome {
        Ok(()) => {
            let mut subs: Vec<SubPipeline> = pipelines.drain().map(|(_, sub)| sub).collect();
            let mut failed: Option<PipeError> = None;
            for sub in subs.iter_mut() {
                if failed.is_none() {
                    for i in 0..sub.evaluators.len() {
                        if let Err(e) = sub.evaluators[i].done().await {
                            failed = Some(e);
                            break;
                        }
                        sub.evaluators[i].finally().await;
                    }
                }
                if failed.is_some() {
                    finally_all(&mut sub.evaluators).await;
                }
            }
            match failed {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        Err(e) => {
            finally_pipelines(&mut pipelines).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn split_rows(
    ctx: &BuilderContext,
    spec: &PipeSpec,
    source: &InputChannel,
    result_tx: &ResultSender,
    column_pos: usize,
    splitter: &SplitterSpec,
    ext_count: &mut Option<ExtCount>,
    pipelines: &mut HashMap<String, SubPipeline>,
) -> PipeResult<()> {
    loop {
        let row: Option<Row> = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(PipeError::Interrupted),
            row = source.recv() => row,
        };
        let Some(row) = row else { return Ok(()) };

        let base = match row.get(column_pos) {
            Some(v) if !v.is_null() => v.render(),
            _ => splitter.default_splitter_value.clone(),
        };
        let label = match ext_count {
            None => base,
            Some(tracker) => {
                let n = tracker.current.entry(base.clone()).or_insert(0);
                let mut label = format!("{base}{n}");
                if let Some(sub) = pipelines.get(&label) {
                    if sub.rows >= tracker.partition_row_count {
                        *n += 1;
                        label = format!("{base}{n}");
                    }
                }
                label
            }
        };

        if !pipelines.contains_key(&label) {
            let mut evaluators = Vec::with_capacity(spec.apply.len());
            for transformation in &spec.apply {
                evaluators.push(build_transformation(
                    ctx,
                    source,
                    Some(label.clone()),
                    result_tx.clone(),
                    transformation,
                )?);
            }
            pipelines.insert(
                label.clone(),
                SubPipeline {
                    evaluators,
                    rows: 0,
                },
            );
        }
        let sub = pipelines.get_mut(&label).expect("pipeline just inserted");
        for evaluator in &mut sub.evaluators {
            evaluator.apply(&row).await?;
        }
        sub.rows += 1;
    }
}

async fn finally_pipelines(pipelines: &mut HashMap<String, SubPipeline>) {
    for (_, sub) in pipelines.iter_mut() {
        finally_all(&mut sub.evaluators).await;
    }
}

async fn finally_all(evaluators: &mut [Box<dyn TransformationPipe>]) {
    for evaluator in evaluators {
        evaluator.finally().await;
    }
}
