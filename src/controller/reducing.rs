//! The reducing controller: for each reducing step, re-materialise the
//! stored configuration for that step's fleet (one node per partition) and
//! emit the follow-up actions.

use sqlx::PgPool;

use crate::config::model::*;
use crate::config::JetsEnv;
use crate::controller::status;
use crate::error::{PipeError, PipeResult};

/// Start reducing step `args.step_id` (1-based; step 0 is sharding).
pub async fn start_reducing(
    args: &StartComputePipesArgs,
    env: &JetsEnv,
    db: &PgPool,
) -> PipeResult<ComputePipesRun> {
    let step_id = args.step_id.ok_or_else(|| {
        PipeError::config("start_reducing requires a step_id")
    })?;
    if step_id == 0 {
        return Err(PipeError::config("step 0 is the sharding step"));
    }
    let mut cp_config = status::load_cpipes_config(db, args.pipeline_exec_key).await?;
    if step_id >= cp_config.reducing_pipes_config.len() {
        return Err(PipeError::config(format!(
            "reducing step {step_id} is out of range ({} steps configured)",
            cp_config.reducing_pipes_config.len()
        )));
    }
    tracing::info!(
        "start REDUCING step {} {} file_key: {}",
        step_id,
        args.session_id,
        args.file_key
    );

    let nbr_partitions = cp_config
        .cluster_config
        .as_ref()
        .map(|c| c.nbr_partitions)
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            PipeError::config("stored cpipes config has no nbr_partitions (sharding did not run?)")
        })?;

    // materialise this step
    cp_config.pipes_config = cp_config.reducing_pipes_config[step_id].clone();
    if let Some(common) = &mut cp_config.common_runtime_args {
        common.cpipes_mode = "reducing".to_string();
        common.read_step_id = cp_config.pipes_config[0].input_channel.read_step_id.clone();
        if common.read_step_id.is_empty() {
            return Err(PipeError::config(format!(
                "reducing_pipes_config[{step_id}][0].input_channel.read_step_id is required"
            )));
        }
    }
    status::update_cpipes_execution_status(
        db,
        args.pipeline_exec_key,
        &serde_json::to_string(&cp_config)?,
    )
    .await?;

    let max_concurrency = crate::controller::sharding::max_concurrency(
        nbr_partitions,
        cp_config
            .cluster_config
            .as_ref()
            .map(|c| c.default_max_concurrency)
            .unwrap_or(0),
        env,
    );

    let is_last = step_id + 1 >= cp_config.reducing_pipes_config.len();
    let mut run = ComputePipesRun {
        cpipes_commands: (0..nbr_partitions)
            .map(|node_id| ComputePipesNodeArgs {
                node_id,
                pipeline_exec_key: args.pipeline_exec_key,
            })
            .collect(),
        is_last_reducing: is_last,
        ..Default::default()
    };
    if !is_last {
        run.start_reducing = Some(StartComputePipesArgs {
            pipeline_exec_key: args.pipeline_exec_key,
            file_key: args.file_key.clone(),
            session_id: args.session_id.clone(),
            step_id: Some(step_id + 1),
            use_ecs_task: args.use_ecs_task,
            max_concurrency,
        });
    }
    let (success, error) = status::status_updates(args.pipeline_exec_key, &args.file_key);
    run.success_update = success;
    run.error_update = error;
    Ok(run)
}
