//! The sharding controller: validates the execution, materialises the
//! compute-pipes configuration for the sharding fleet, and returns the
//! per-node commands plus the follow-up actions.

use sqlx::PgPool;

use crate::config::model::*;
use crate::config::validation::{
    select_active_lookup_tables, select_active_output_tables, validate_pipe_config,
};
use crate::config::JetsEnv;
use crate::controller::file_keys::{ShardResult, shard_file_keys};
use crate::controller::output_tables::{prepare_output_table, resolve_table_name, split_table_name};
use crate::controller::{notify, status};
use crate::error::{PipeError, PipeResult};
use crate::s3::store::{StoreHandle, put_bytes};
use crate::schema::provider::{SchemaProvider, synthesize_main_input};

pub const MAIN_INPUT_STEP_ID: &str = "reducing00";

/// Start the sharding phase of an execution (spec steps 1-8): reject reused
/// sessions, load and expand the configuration, size the fleet, persist the
/// materialised configuration, and hand the node commands back.
pub async fn start_sharding(
    args: &StartComputePipesArgs,
    env: &JetsEnv,
    db: &PgPool,
    store: &StoreHandle,
) -> PipeResult<ComputePipesRun> {
    if args.file_key.is_empty() || args.session_id.is_empty() {
        return Err(PipeError::config(
            "missing file_key or session_id to start sharding",
        ));
    }
    notify::notify_start(&args.file_key).await;

    if status::is_session_used(db, &args.session_id, args.pipeline_exec_key).await? {
        return Err(PipeError::system("error: the session id is already used"));
    }

    tracing::info!(
        "start SHARDING {} file_key: {}",
        args.session_id,
        args.file_key
    );
    let info = status::load_pipeline_exec_info(db, args.pipeline_exec_key).await?;

    // the compute-pipes configuration lives in the workspace
    let config_path = env.workspace_file(&info.main_rules);
    let config_json = std::fs::read_to_string(&config_path).map_err(|e| {
        PipeError::config(format!(
            "cannot read cpipes config '{}': {e}",
            config_path.display()
        ))
    })?;
    let mut cp_config: ComputePipesConfig = serde_json::from_str(&config_json)
        .map_err(|e| PipeError::config(format!("invalid cpipes config json: {e}")))?;
    if cp_config.reducing_pipes_config.is_empty() {
        return Err(PipeError::config(
            "invalid cpipes config: reducing_pipes_config is empty",
        ));
    }

    // normalise and validate every step up-front; fail before any fleet runs
    for step_id in 0..cp_config.reducing_pipes_config.len() {
        validate_pipe_config(&mut cp_config.reducing_pipes_config[step_id], step_id)?;
        select_active_lookup_tables(
            &cp_config.lookup_tables,
            &cp_config.reducing_pipes_config[step_id],
        )?;
        select_active_output_tables(
            &cp_config.output_tables,
            &cp_config.reducing_pipes_config[step_id],
        )?;
    }

    // prepare / migrate the output tables
    for table in &cp_config.output_tables {
        let name = resolve_table_name(&table.name, cp_config.context.as_ref());
        let identifier = split_table_name(&name)?;
        prepare_output_table(db, &identifier, table).await?;
    }

    // resolve or synthesize the main_input schema provider
    let declared = cp_config
        .schema_providers
        .iter()
        .position(|sp| sp.source_type == "main_input");
    let mut provider_spec = synthesize_main_input(
        declared.map(|i| &cp_config.schema_providers[i]),
        &info.input_format,
        &info.compression,
        &info.input_format_data_json,
        info.is_part_files,
        &info.schema_provider_json,
    )?;
    if !info.input_columns_positions_csv.is_empty() && provider_spec.fixed_width_columns_csv.is_empty()
    {
        provider_spec.fixed_width_columns_csv = info.input_columns_positions_csv.clone();
    }
    let mut provider = SchemaProvider::initialize(&provider_spec)?;
    if provider.columns.is_empty() && !info.input_columns_json.is_empty() {
        provider.columns = serde_json::from_str(&info.input_columns_json).map_err(|e| {
            PipeError::config(format!("invalid input_columns_json: {e}"))
        })?;
    }

    // enumerate the input and size the fleet
    let cluster = cp_config.cluster_config.clone().unwrap_or_default();
    let shard_result = shard_file_keys(
        store,
        &args.file_key,
        provider.is_part_files,
        &cluster,
        env.nbr_shards,
    )
    .await?;
    tracing::info!(
        "{}: {} input objects, {} MiB, {} sharding nodes",
        args.session_id,
        shard_result.file_keys.len(),
        shard_result.total_size_mb,
        shard_result.nbr_sharding_nodes
    );

    // headers or delimiter unknown: sample the first input object
    if provider.columns.is_empty() || (provider.delimiter.is_none() && provider_is_csv(&provider)) {
        provider
            .sample_file(store, shard_result.first_key())
            .await?;
    }

    // the partition key components ride along as synthetic input columns
    let mut input_columns = provider.columns.clone();
    for entry in cp_config.context.iter().flatten() {
        if entry.context_type == "partfile_key_component" {
            input_columns.push(entry.key.clone());
        }
    }

    stamp_hash_partitions(&mut cp_config, shard_result.nbr_partitions as u64);

    let materialized = materialize_config(
        args,
        &info,
        &cp_config,
        &provider_spec,
        &provider,
        input_columns,
        &shard_result,
    );
    let config_json = serde_json::to_string(&materialized)?;
    status::insert_cpipes_execution_status(db, args.pipeline_exec_key, &args.session_id, &config_json)
        .await?;

    // assemble the run: node commands + follow-up actions
    let mut run = ComputePipesRun {
        cpipes_commands: (0..shard_result.nbr_sharding_nodes)
            .map(|node_id| ComputePipesNodeArgs {
                node_id,
                pipeline_exec_key: args.pipeline_exec_key,
            })
            .collect(),
        ..Default::default()
    };
    if shard_result.sizing.use_ecs_tasks {
        // distributed map: spill the commands to the stage store
        let key = format!(
            "{}/cpipesCommands/{}/shardingCommands.json",
            env.s3_stage_prefix, args.session_id
        );
        put_bytes(store, &key, serde_json::to_vec(&run.cpipes_commands)?).await?;
        run.cpipes_commands_s3_key = Some(key);
    }
    run.is_last_reducing = cp_config.reducing_pipes_config.len() == 1;
    if !run.is_last_reducing {
        run.start_reducing = Some(StartComputePipesArgs {
            pipeline_exec_key: args.pipeline_exec_key,
            file_key: args.file_key.clone(),
            session_id: args.session_id.clone(),
            step_id: Some(1),
            use_ecs_task: shard_result.sizing.use_ecs_tasks,
            max_concurrency: shard_result.sizing.max_concurrency,
        });
    }
    run.reports_command = vec![
        "-client".to_string(),
        info.client.clone(),
        "-processName".to_string(),
        info.process_name.clone(),
        "-sessionId".to_string(),
        args.session_id.clone(),
        "-filePath".to_string(),
        args.file_key
            .replacen(&env.s3_input_prefix, &env.s3_output_prefix, 1),
    ];
    let (success, error) = status::status_updates(args.pipeline_exec_key, &args.file_key);
    run.success_update = success;
    run.error_update = error;
    Ok(run)
}

fn provider_is_csv(provider: &SchemaProvider) -> bool {
    use crate::io::reader::InputFormat;
    matches!(
        provider.format,
        InputFormat::Csv | InputFormat::HeaderlessCsv
    )
}

/// Stamp every hash expression that the configuration left unresolved with
/// the chosen partition count, so rows land on the same partition in every
/// step.
fn stamp_hash_partitions(cp_config: &mut ComputePipesConfig, nbr_partitions: u64) {
    for step in &mut cp_config.reducing_pipes_config {
        for pipe in step {
            for spec in &mut pipe.apply {
                for column in &mut spec.columns {
                    if let Some(hash_expr) = &mut column.hash_expr {
                        if hash_expr.nbr_jets_partitions.is_none() {
                            hash_expr.nbr_jets_partitions = Some(nbr_partitions);
                        }
                    }
                }
            }
        }
    }
}

fn materialize_config(
    args: &StartComputePipesArgs,
    info: &status::PipelineExecInfo,
    cp_config: &ComputePipesConfig,
    provider_spec: &SchemaProviderSpec,
    provider: &SchemaProvider,
    input_columns: Vec<String>,
    shard_result: &ShardResult,
) -> ComputePipesConfig {
    let mut schema_providers = cp_config.schema_providers.clone();
    if !schema_providers
        .iter()
        .any(|sp| sp.source_type == "main_input")
    {
        schema_providers.push(provider_spec.clone());
    }
    let s3_worker_pool_size = if shard_result.sizing.s3_worker_pool_size > 0 {
        shard_result.sizing.s3_worker_pool_size
    } else if cp_config
        .cluster_config
        .as_ref()
        .map(|c| c.s3_worker_pool_size)
        .unwrap_or(0)
        > 0
    {
        cp_config.cluster_config.as_ref().unwrap().s3_worker_pool_size
    } else {
        1
    };
    ComputePipesConfig {
        common_runtime_args: Some(CommonRuntimeArgs {
            cpipes_mode: "sharding".to_string(),
            client: info.client.clone(),
            org: info.org.clone(),
            object_type: info.object_type.clone(),
            file_key: args.file_key.clone(),
            session_id: args.session_id.clone(),
            main_input_step_id: MAIN_INPUT_STEP_ID.to_string(),
            read_step_id: MAIN_INPUT_STEP_ID.to_string(),
            input_session_id: info.input_session_id.clone(),
            source_period_key: info.source_period_key,
            process_name: info.process_name.clone(),
            sources_config: SourcesConfigSpec {
                main_input: Some(InputSourceSpec {
                    input_columns,
                    input_format: provider_spec.input_format.clone(),
                    compression: provider_spec.compression.clone(),
                    delimiter: provider
                        .delimiter
                        .map(|c| c.to_string())
                        .unwrap_or_default(),
                    input_format_data_json: provider_spec.input_format_data_json.clone(),
                    schema_provider: provider_spec.key.clone(),
                }),
            },
            pipeline_config_key: info.pipeline_config_key,
            user_email: info.user_email.clone(),
            input_file_keys: shard_result.file_keys.clone(),
        }),
        cluster_config: Some(ClusterSpec {
            nbr_nodes: shard_result.nbr_sharding_nodes,
            nbr_partitions: shard_result.nbr_partitions,
            default_max_concurrency: cp_config
                .cluster_config
                .as_ref()
                .map(|c| c.default_max_concurrency)
                .unwrap_or(0),
            s3_worker_pool_size,
            nbr_nodes_lookup: None,
            is_debug_mode: cp_config
                .cluster_config
                .as_ref()
                .map(|c| c.is_debug_mode)
                .unwrap_or(false),
            kill_switch_min: cp_config
                .cluster_config
                .as_ref()
                .map(|c| c.kill_switch_min)
                .unwrap_or(0),
        }),
        output_tables: cp_config.output_tables.clone(),
        output_files: cp_config.output_files.clone(),
        lookup_tables: cp_config.lookup_tables.clone(),
        channels: cp_config.channels.clone(),
        context: cp_config.context.clone(),
        schema_providers,
        pipes_config: cp_config.reducing_pipes_config[0].clone(),
        reducing_pipes_config: cp_config.reducing_pipes_config.clone(),
    }
}

/// Max concurrency for the fleet: the configured default, the deployment
/// override, or 1.
pub fn max_concurrency(nbr_nodes: usize, default_max_concurrency: i32, env: &JetsEnv) -> i32 {
    if nbr_nodes < 1 {
        return 1;
    }
    let mut concurrency = default_max_concurrency;
    if concurrency == 0 {
        concurrency = env.task_max_concurrency.unwrap_or(10);
    }
    concurrency.max(1)
}
