//! `fan_out`: one source feeding several operators, each with its own
//! output channel. Evaluators are built up-front so configuration problems
//! surface before the first row; `finally` runs on every evaluator no
//! matter how the pipe ends.

use crate::config::model::PipeSpec;
use crate::core::builder::BuilderContext;
use crate::core::channel::InputChannel;
use crate::core::results::ResultSender;
use crate::error::{PipeError, PipeResult};
use crate::executors::guard_pipe;
use crate::operators::{TransformationPipe, build_transformation};

pub async fn start_fan_out_pipe(
    ctx: BuilderContext,
    spec: PipeSpec,
    source: InputChannel,
    result_tx: ResultSender,
) {
    guard_pipe(&ctx, &spec, run(&ctx, &spec, source, result_tx.clone())).await;
    drop(result_tx);
}

async fn run(
    ctx: &BuilderContext,
    spec: &PipeSpec,
    source: InputChannel,
    result_tx: ResultSender,
) -> PipeResult<()> {
    let mut evaluators: Vec<Box<dyn TransformationPipe>> = Vec::with_capacity(spec.apply.len());
    for transformation in &spec.apply {
        match build_transformation(ctx, &source, None, result_tx.clone(), transformation) {
            Ok(evaluator) => evaluators.push(evaluator),
            Err(e) => {
                finally_all(&mut evaluators).await;
                return Err(PipeError::config(format!(
                    "while building {} evaluator: {e}",
                    transformation.transformation_type
                )));
            }
        }
    }

    loop {
        let row = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                finally_all(&mut evaluators).await;
                return Err(PipeError::Interrupted);
            }
            row = source.recv() => row,
        };
        let Some(row) = row else { break };
        for i in 0..evaluators.len() {
            if let Err(e) = evaluators[i].apply(&row).await {
                finally_all(&mut evaluators).await;
                return Err(e);
            }
        }
    }

    for i in 0..evaluators.len() {
        if let Err(e) = evaluators[i].done().await {
            finally_all(&mut evaluators).await;
            return Err(e);
        }
        evaluators[i].finally().await;
    }
    Ok(())
}

async fn finally_all(evaluators: &mut [Box<dyn TransformationPipe>]) {
    for evaluator in evaluators {
        evaluator.finally().await;
    }
}
