//! One worker node of a sharding or reducing fleet: read the assigned
//! input, drive it through the compute graph, and report the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::model::{ComputePipesConfig, ComputePipesNodeArgs, ContextSpec};
use crate::config::validation::select_active_lookup_tables;
use crate::config::JetsEnv;
use crate::core::builder::BuilderContext;
use crate::core::registry::{ChannelRegistry, PROCESS_ERRORS_CHANNEL};
use crate::core::results::ChannelResults;
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::io::reader::{InputFormat, ReadSpec, read_rows};
use crate::io::Compression;
use crate::lookup::LookupTableManager;
use crate::s3::S3DeviceManager;
use crate::s3::store::{StoreHandle, fetch_object, list_file_keys};
use crate::schema::provider::SchemaProvider;
use crate::controller::status;

#[derive(Debug, Default, Clone)]
pub struct NodeResult {
    pub rows_in: i64,
    pub parts_written: i64,
    pub bad_rows: i64,
}

/// Entry point for a fleet node: load the materialised configuration and
/// run this node's share of the step.
pub async fn coordinate_compute_pipes(
    node: &ComputePipesNodeArgs,
    env: &JetsEnv,
    db: PgPool,
    store: StoreHandle,
) -> PipeResult<NodeResult> {
    let cp_config = status::load_cpipes_config(&db, node.pipeline_exec_key).await?;
    run_node(cp_config, node.node_id, env, Some(db), store).await
}

/// Run one node against an already materialised configuration.
pub async fn run_node(
    cp_config: ComputePipesConfig,
    node_id: usize,
    env: &JetsEnv,
    db: Option<PgPool>,
    store: StoreHandle,
) -> PipeResult<NodeResult> {
    let cp_config = Arc::new(cp_config);
    let common = cp_config.common_runtime_args.clone().ok_or_else(|| {
        PipeError::config("cpipes config has no common_runtime_args (not materialised)")
    })?;
    let cluster = cp_config.cluster_config.clone().unwrap_or_default();
    if cp_config.pipes_config.is_empty() {
        return Err(PipeError::config("cpipes config has no pipes for this step"));
    }
    let sharding = common.cpipes_mode == "sharding";

    let main_input = common.sources_config.main_input.clone().unwrap_or_default();
    let registry = Arc::new(ChannelRegistry::new(
        &cp_config.channels,
        main_input.input_columns.clone(),
    ));
    let cancel = CancellationToken::new();
    let (err_tx, err_rx) = flume::unbounded::<PipeError>();
    let results = Arc::new(ChannelResults::new());

    let s3_device = S3DeviceManager::start(
        store.clone(),
        env.region.clone(),
        cluster.s3_worker_pool_size.max(1),
        results.s3_put_object_tx.clone(),
        cancel.clone(),
    )?;

    let active_lookups =
        select_active_lookup_tables(&cp_config.lookup_tables, &cp_config.pipes_config)?;
    let lookup_mgr = LookupTableManager::load(
        &active_lookups,
        db.as_ref(),
        &store,
        &env.s3_stage_prefix,
    )
    .await?;

    let context_values = evaluate_context(cp_config.context.as_ref(), &common.file_key)?;

    let ctx = BuilderContext {
        session_id: common.session_id.clone(),
        node_id,
        jets_partition: node_id.to_string(),
        read_step_id: common.read_step_id.clone(),
        write_step_id: common.main_input_step_id.clone(),
        cp_config: cp_config.clone(),
        env: Arc::new(env.clone()),
        store: store.clone(),
        db: db.clone(),
        lookup_mgr: Arc::new(lookup_mgr),
        registry: registry.clone(),
        cancel: cancel.clone(),
        err_tx: err_tx.clone(),
        results: results.clone(),
        s3_device: Some(s3_device.clone()),
        context_values: Arc::new(context_values),
    };
    let graph = ctx.build_compute_graph()?;

    // feed the assigned input into the first pipe's channel
    let reader = {
        let ctx = ctx.clone();
        let common = common.clone();
        let main_input = main_input.clone();
        let nbr_nodes = cluster.nbr_nodes.max(1);
        tokio::spawn(async move {
            let outcome = if sharding {
                read_sharding_input(&ctx, &common.input_file_keys, &main_input, nbr_nodes).await
            } else {
                read_reducing_input(&ctx).await
            };
            let target = ctx.cp_config.pipes_config[0].input_channel.name.clone();
            ctx.registry.close_channel(&target);
            match outcome {
                Ok(rows) => rows,
                Err(PipeError::Interrupted) => 0,
                Err(e) => {
                    tracing::error!("{}: input reader failed: {}", ctx.session_id, e);
                    let _ = ctx.err_tx.send(e);
                    ctx.cancel.cancel();
                    0
                }
            }
        })
    };

    let run = async {
        let rows_in = reader.await.unwrap_or(0);
        for handle in graph.pipes {
            let _ = handle.await;
        }
        registry.close_channel(PROCESS_ERRORS_CHANNEL);
        let _ = graph.process_errors.await;
        rows_in
    };
    let rows_in = if cluster.kill_switch_min > 0 {
        let deadline = std::time::Duration::from_secs(60 * cluster.kill_switch_min as u64);
        match tokio::time::timeout(deadline, run).await {
            Ok(rows) => rows,
            Err(_) => {
                cancel.cancel();
                return Err(PipeError::system(format!(
                    "kill switch: node did not complete within {} min",
                    cluster.kill_switch_min
                )));
            }
        }
    } else {
        run.await
    };

    // all tasks are done: the queued results are complete
    let mut parts_written = 0i64;
    let mut bad_rows = 0i64;
    let mut first_result_err: Option<String> = None;
    for pipe_results in results.write_partitions_rx.try_iter() {
        for result in pipe_results.try_iter() {
            if result.label == "process_errors" {
                bad_rows += result.parts_count;
                continue;
            }
            parts_written += result.parts_count;
            if result.err.is_some() && first_result_err.is_none() {
                first_result_err = result.err;
            }
        }
    }

    drop(ctx);
    s3_device.finish(&common.session_id).await;
    let s3_result = results.s3_put_object_rx.recv_async().await.ok();

    if let Ok(e) = err_rx.try_recv() {
        return Err(e);
    }
    if let Some(err) = first_result_err {
        return Err(PipeError::system(err));
    }
    if let Some(result) = s3_result {
        if let Some(err) = result.err {
            return Err(PipeError::system(err));
        }
    }
    tracing::info!(
        "{} node {}: {} rows in, {} parts written, {} bad rows",
        common.session_id,
        node_id,
        rows_in,
        parts_written,
        bad_rows
    );
    Ok(NodeResult {
        rows_in,
        parts_written,
        bad_rows,
    })
}

/// Evaluate `value` and `file_key_component` context entries.
fn evaluate_context(
    context: Option<&Vec<ContextSpec>>,
    file_key: &str,
) -> PipeResult<HashMap<String, String>> {
    let mut values = HashMap::new();
    for entry in context.iter().flat_map(|c| c.iter()) {
        match entry.context_type.as_str() {
            "value" => {
                values.insert(entry.key.clone(), entry.expr.clone());
            }
            "file_key_component" => {
                let re = Regex::new(&entry.expr).map_err(|e| {
                    PipeError::config(format!(
                        "context '{}': expr does not compile: {e}",
                        entry.key
                    ))
                })?;
                let captured = re
                    .captures(file_key)
                    .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                    .unwrap_or_default();
                values.insert(entry.key.clone(), captured);
            }
            // partfile_key_component resolves per input object in the reader
            _ => {}
        }
    }
    Ok(values)
}

/// Per-object values of the `partfile_key_component` context entries.
fn partfile_components(
    context: Option<&Vec<ContextSpec>>,
    object_key: &str,
) -> PipeResult<Vec<Value>> {
    let mut values = Vec::new();
    for entry in context.iter().flat_map(|c| c.iter()) {
        if entry.context_type != "partfile_key_component" {
            continue;
        }
        let value = if entry.expr.is_empty() {
            // default: the object's parent directory name
            object_key
                .rsplit('/')
                .nth(1)
                .unwrap_or_default()
                .to_string()
        } else {
            let re = Regex::new(&entry.expr).map_err(|e| {
                PipeError::config(format!(
                    "context '{}': expr does not compile: {e}",
                    entry.key
                ))
            })?;
            re.captures(object_key)
                .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .unwrap_or_default()
        };
        values.push(Value::from_opt_text(if value.is_empty() {
            None
        } else {
            Some(value)
        }));
    }
    Ok(values)
}

async fn read_sharding_input(
    ctx: &BuilderContext,
    input_file_keys: &[crate::config::model::FileKeyInfo],
    main_input: &crate::config::model::InputSourceSpec,
    nbr_nodes: usize,
) -> PipeResult<i64> {
    let pipe = &ctx.cp_config.pipes_config[0];
    let out = ctx.registry.get_output_channel(&pipe.input_channel.name)?;

    // the read spec comes from the main_input schema provider
    let provider_spec = ctx
        .cp_config
        .schema_providers
        .iter()
        .find(|sp| sp.key == main_input.schema_provider || sp.source_type == "main_input");
    let mut read_spec = match provider_spec {
        Some(spec) => SchemaProvider::initialize(spec)?.read_spec(),
        None => ReadSpec {
            format: InputFormat::parse(if main_input.input_format.is_empty() {
                "csv"
            } else {
                &main_input.input_format
            })?,
            compression: Compression::parse(&main_input.compression)?,
            ..Default::default()
        },
    };
    if let Some(delimiter) = main_input.delimiter.chars().next() {
        read_spec.delimiter = delimiter;
    }
    let sampling_rate = pipe.input_channel.sampling_rate;

    let mut seen = 0i64;
    let mut rows_in = 0i64;
    for (index, file) in input_file_keys.iter().enumerate() {
        if index % nbr_nodes != ctx.node_id {
            continue;
        }
        tracing::debug!("node {} reading {}", ctx.node_id, file.key);
        let bytes = fetch_object(&ctx.store, &file.key).await?;
        let mut rows = read_rows(bytes, &read_spec)?;
        let extra = partfile_components(ctx.cp_config.context.as_ref(), &file.key)?;
        for mut row in rows.drain(..) {
            seen += 1;
            if sampling_rate > 1 && (seen % sampling_rate as i64) != 0 {
                continue;
            }
            row.extend(extra.iter().cloned());
            rows_in += 1;
            out.send(row, &ctx.cancel).await?;
        }
    }
    Ok(rows_in)
}

async fn read_reducing_input(ctx: &BuilderContext) -> PipeResult<i64> {
    let pipe = &ctx.cp_config.pipes_config[0];
    let out = ctx.registry.get_output_channel(&pipe.input_channel.name)?;
    let read_step = if pipe.input_channel.read_step_id.is_empty() {
        ctx.read_step_id.clone()
    } else {
        pipe.input_channel.read_step_id.clone()
    };
    let prefix = format!(
        "{}/{}/{}/{}",
        ctx.env.s3_stage_prefix, ctx.session_id, read_step, ctx.jets_partition
    );
    let format = InputFormat::parse(if pipe.input_channel.format.is_empty() {
        "headerless_csv"
    } else {
        &pipe.input_channel.format
    })?;
    let compression = if pipe.input_channel.compression.is_empty() {
        Compression::Snappy
    } else {
        Compression::parse(&pipe.input_channel.compression)?
    };
    let read_spec = ReadSpec {
        format,
        compression,
        ..Default::default()
    };

    let mut rows_in = 0i64;
    let keys = list_file_keys(&ctx.store, &prefix).await?;
    tracing::debug!(
        "node {} reducing partition {}: {} stage parts",
        ctx.node_id,
        ctx.jets_partition,
        keys.len()
    );
    for file in keys {
        let bytes = fetch_object(&ctx.store, &file.key).await?;
        let mut rows: Vec<Row> = read_rows(bytes, &read_spec)?;
        for row in rows.drain(..) {
            rows_in += 1;
            out.send(row, &ctx.cancel).await?;
        }
    }
    Ok(rows_in)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validation::validate_pipe_config;
    use object_store::ObjectStore;

    fn test_env() -> JetsEnv {
        JetsEnv {
            workspaces_home: "/tmp".to_string(),
            workspace: "ws".to_string(),
            bucket: "test-bucket".to_string(),
            region: "us-east-1".to_string(),
            dsn_secret: String::new(),
            s3_input_prefix: "jetstore/input".to_string(),
            s3_output_prefix: "jetstore/output".to_string(),
            s3_stage_prefix: "jetstore/stage".to_string(),
            nbr_shards: 1,
            workspace_db_path: String::new(),
            schema_file: None,
            dev_mode: true,
            using_ssh_tunnel: false,
            task_max_concurrency: None,
        }
    }

    fn materialized_config(file_keys: Vec<crate::config::model::FileKeyInfo>) -> ComputePipesConfig {
        let mut config: ComputePipesConfig = serde_json::from_value(serde_json::json!({
            "common_runtime_args": {
                "cpipes_mode": "sharding",
                "client": "acme",
                "session_id": "e2e-session",
                "file_key": "jetstore/input/client=acme/claims.csv",
                "main_input_step_id": "reducing00",
                "read_step_id": "reducing00",
                "process_name": "claims_cpipes",
                "sources_config": {
                    "main_input": {
                        "input_columns": ["k", "v"],
                        "input_format": "csv",
                        "compression": "none",
                        "delimiter": ","
                    }
                }
            },
            "cluster_config": {
                "nbr_nodes": 1,
                "nbr_partitions": 4,
                "s3_worker_pool_size": 2
            },
            "channels": [
                {"name": "mapped", "columns": ["k", "v", "jets_partition_key"]},
                {"name": "staged", "columns": ["k", "v", "jets_partition_key"]},
                {"name": "uniq", "columns": ["k", "v", "jets_partition_key"]},
                {"name": "out_file", "columns": ["k", "v", "jets_partition_key"]}
            ],
            "reducing_pipes_config": [
                [
                    {
                        "type": "fan_out",
                        "input_channel": {"name": "input_row"},
                        "apply": [{
                            "type": "map_record",
                            "new_record": true,
                            "columns": [
                                {"name": "k", "type": "select", "expr": "k"},
                                {"name": "v", "type": "select", "expr": "v"},
                                {"name": "jets_partition_key", "type": "hash",
                                 "hash_expr": {"expr": "k", "nbr_jets_partitions": 4}}
                            ],
                            "output_channel": {"name": "mapped", "channel_spec_name": "mapped_spec"}
                        }]
                    },
                    {
                        "type": "fan_out",
                        "input_channel": {"name": "mapped"},
                        "apply": [{
                            "type": "partition_writer",
                            "device_writer_type": "csv_writer",
                            "output_channel": {
                                "type": "stage", "name": "staged",
                                "channel_spec_name": "mapped",
                                "write_step_id": "reducing01",
                                "compression": "none"
                            }
                        }]
                    }
                ],
                [
                    {
                        "type": "fan_out",
                        "input_channel": {
                            "name": "mapped",
                            "read_step_id": "reducing01",
                            "format": "headerless_csv",
                            "compression": "none"
                        },
                        "apply": [{
                            "type": "distinct",
                            "distinct_config": {"distinct_on": ["k"]},
                            "output_channel": {"name": "uniq", "channel_spec_name": "uniq_spec"}
                        }]
                    },
                    {
                        "type": "fan_out",
                        "input_channel": {"name": "uniq"},
                        "apply": [{
                            "type": "partition_writer",
                            "device_writer_type": "csv_writer",
                            "output_channel": {
                                "type": "output", "name": "out_file",
                                "channel_spec_name": "uniq",
                                "key_prefix": "client=acme",
                                "file_name": "result-{partition}.csv",
                                "compression": "none"
                            }
                        }]
                    }
                ]
            ]
        }))
        .unwrap();
        for step_id in 0..config.reducing_pipes_config.len() {
            validate_pipe_config(&mut config.reducing_pipes_config[step_id], step_id).unwrap();
        }
        if let Some(common) = &mut config.common_runtime_args {
            common.input_file_keys = file_keys;
        }
        config.pipes_config = config.reducing_pipes_config[0].clone();
        config
    }

    /// Full two-phase run over a local store: shard 10 rows into 4 hash
    /// partitions, then reduce each partition into its output file.
    #[tokio::test]
    async fn sharding_then_reducing_end_to_end() {
        let bucket = tempfile::tempdir().unwrap();
        let store: StoreHandle = Arc::new(
            object_store::local::LocalFileSystem::new_with_prefix(bucket.path()).unwrap(),
        );
        let env = test_env();

        let input_key = "jetstore/input/client=acme/claims.csv";
        let mut csv = String::from("k,v\n");
        for i in 0..10 {
            csv.push_str(&format!("key-{i},{i}\n"));
        }
        store
            .put(
                &object_store::path::Path::from(input_key),
                object_store::PutPayload::from(csv.into_bytes()),
            )
            .await
            .unwrap();

        let file_keys = vec![crate::config::model::FileKeyInfo {
            key: input_key.to_string(),
            size: 100,
        }];

        // sharding: one node
        let config = materialized_config(file_keys.clone());
        let result = run_node(config, 0, &env, None, store.clone()).await.unwrap();
        assert_eq!(result.rows_in, 10);
        assert!(result.parts_written >= 1);

        // reducing: one node per partition
        let mut total_out_rows = 0;
        for partition in 0..4 {
            let mut config = materialized_config(file_keys.clone());
            config.pipes_config = config.reducing_pipes_config[1].clone();
            if let Some(common) = &mut config.common_runtime_args {
                common.cpipes_mode = "reducing".to_string();
                common.read_step_id = "reducing01".to_string();
            }
            let result = run_node(config, partition, &env, None, store.clone())
                .await
                .unwrap();
            total_out_rows += result.rows_in;

            let out_path = bucket.path().join(format!(
                "jetstore/output/client=acme/result-{partition}.csv"
            ));
            if result.rows_in > 0 {
                assert!(out_path.exists(), "missing output for partition {partition}");
            }
        }
        // every sharded row was read back by exactly one reducing node
        assert_eq!(total_out_rows, 10);
    }
}
