//! The compute-graph builder: turns the materialised configuration into
//! running executor tasks wired through the channel registry.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::JetsEnv;
use crate::config::model::ComputePipesConfig;
use crate::core::channel::OutputChannel;
use crate::core::registry::{ChannelRegistry, PROCESS_ERRORS_CHANNEL};
use crate::core::results::{ChannelResults, ComputePipesResult};
use crate::error::{PipeError, PipeResult};
use crate::executors::{fan_out, merge_files, splitter};
use crate::lookup::LookupTableManager;
use crate::operators::table_writer::TableWriter;
use crate::s3::S3DeviceManager;
use crate::s3::store::StoreHandle;

/// Maximum number of partitions a single splitter pipe may report.
const MAX_SPLITTER_PARTITIONS: usize = 15_000;

/// The running tasks of one node's compute graph.
pub struct ComputeGraph {
    pub pipes: Vec<JoinHandle<()>>,
    /// ends once the `process_errors` channel is closed and drained
    pub process_errors: JoinHandle<()>,
}

/// Everything an executor or operator needs from the node. Cheap to clone;
/// all heavy state is shared.
#[derive(Clone)]
pub struct BuilderContext {
    pub session_id: String,
    pub node_id: usize,
    /// partition label this node reduces ("" while sharding)
    pub jets_partition: String,
    pub read_step_id: String,
    pub write_step_id: String,
    pub cp_config: Arc<ComputePipesConfig>,
    pub env: Arc<JetsEnv>,
    pub store: StoreHandle,
    pub db: Option<PgPool>,
    pub lookup_mgr: Arc<LookupTableManager>,
    pub registry: Arc<ChannelRegistry>,
    pub cancel: CancellationToken,
    pub err_tx: flume::Sender<PipeError>,
    pub results: Arc<ChannelResults>,
    pub s3_device: Option<Arc<S3DeviceManager>>,
    /// context values (`file_key_component`, `value`) by key
    pub context_values: Arc<HashMap<String, String>>,
}

impl BuilderContext {
    /// Substitute every context key occurring in `input` with its value
    /// (table names like `output_$CLIENT` resolve here).
    pub fn substitute_context(&self, input: &str) -> String {
        let mut out = input.to_string();
        for (key, value) in self.context_values.iter() {
            out = out.replace(key, value);
        }
        out
    }

    /// Build and start every pipe of the materialised configuration.
    /// The caller waits on the pipe handles, closes `process_errors`, then
    /// waits on the collector.
    pub fn build_compute_graph(&self) -> PipeResult<ComputeGraph> {
        let pipes = &self.cp_config.pipes_config;
        let mut handles = Vec::new();

        // several pipes on the same source need distribution echoes so each
        // branch sees every row
        let mut consumers: HashMap<&str, usize> = HashMap::new();
        for pipe in pipes {
            if pipe.pipe_type != "merge_files" {
                *consumers.entry(pipe.input_channel.name.as_str()).or_insert(0) += 1;
            }
        }
        let mut assigned: HashMap<usize, String> = HashMap::new();
        for (i, pipe) in pipes.iter().enumerate() {
            let name = pipe.input_channel.name.as_str();
            if pipe.pipe_type != "merge_files" && consumers[name] > 1 {
                assigned.insert(i, self.registry.add_distribution_channel(name)?);
            }
        }
        for (name, n) in consumers.iter().filter(|(_, n)| **n > 1) {
            handles.push(self.start_distributor(name, *n)?);
        }

        for (i, pipe) in pipes.iter().enumerate() {
            let input_name = assigned
                .get(&i)
                .cloned()
                .unwrap_or_else(|| pipe.input_channel.name.clone());
            match pipe.pipe_type.as_str() {
                "fan_out" => {
                    let source = self.registry.get_input_channel(&input_name)?;
                    let (result_tx, _) = self.results.register_pipe(MAX_SPLITTER_PARTITIONS);
                    let ctx = self.clone();
                    let spec = pipe.clone();
                    handles.push(tokio::spawn(async move {
                        fan_out::start_fan_out_pipe(ctx, spec, source, result_tx).await;
                    }));
                }
                "splitter" => {
                    let source = self.registry.get_input_channel(&input_name)?;
                    let (result_tx, _) = self.results.register_pipe(MAX_SPLITTER_PARTITIONS);
                    let ctx = self.clone();
                    let spec = pipe.clone();
                    handles.push(tokio::spawn(async move {
                        splitter::start_splitter_pipe(ctx, spec, source, result_tx).await;
                    }));
                }
                "merge_files" => {
                    let (result_tx, _) = self.results.register_pipe(MAX_SPLITTER_PARTITIONS);
                    let ctx = self.clone();
                    let spec = pipe.clone();
                    handles.push(tokio::spawn(async move {
                        merge_files::start_merge_files_pipe(ctx, spec, result_tx).await;
                    }));
                }
                other => {
                    return Err(PipeError::config(format!(
                        "unknown pipe type '{other}'"
                    )));
                }
            }
        }

        // one table writer per sql output channel
        for pipe in pipes {
            for spec in &pipe.apply {
                if spec.output_channel.channel_type != "sql" {
                    continue;
                }
                let db = self.db.clone().ok_or_else(|| {
                    PipeError::config(
                        "an output_channel of type 'sql' requires a database connection",
                    )
                })?;
                let table = self
                    .cp_config
                    .output_tables
                    .iter()
                    .find(|t| t.key == spec.output_channel.output_table_key)
                    .cloned()
                    .ok_or_else(|| {
                        PipeError::config(format!(
                            "output table '{}' is not declared",
                            spec.output_channel.output_table_key
                        ))
                    })?;
                let source = self
                    .registry
                    .get_input_channel(&spec.output_channel.name)?;
                let (result_tx, _) = self.results.register_pipe(1);
                let writer = TableWriter::new(db, table, source, self.cancel.clone());
                handles.push(tokio::spawn(async move {
                    writer.run(result_tx).await;
                }));
            }
        }

        let process_errors = self.start_process_errors_collector()?;
        Ok(ComputeGraph {
            pipes: handles,
            process_errors,
        })
    }

    /// Replicate every row of `name` into its echo channels.
    fn start_distributor(&self, name: &str, _consumers: usize) -> PipeResult<JoinHandle<()>> {
        let source = self.registry.get_input_channel(name)?;
        let echo_names = self.registry.distribution_echoes(name);
        let mut echoes: Vec<OutputChannel> = Vec::with_capacity(echo_names.len());
        for echo in &echo_names {
            echoes.push(self.registry.get_output_channel(echo)?);
        }
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        Ok(tokio::spawn(async move {
            'pump: loop {
                let row = tokio::select! {
                    _ = cancel.cancelled() => break 'pump,
                    row = source.recv() => row,
                };
                let Some(row) = row else { break };
                for echo in &echoes {
                    if echo.send(row.clone(), &cancel).await.is_err() {
                        break 'pump;
                    }
                }
            }
            drop(echoes);
            for echo in &echo_names {
                registry.close_channel(echo);
            }
        }))
    }

    /// Drain the reserved bad-row channel: log each record, report the
    /// count when the channel closes.
    fn start_process_errors_collector(&self) -> PipeResult<JoinHandle<()>> {
        let source = self.registry.get_input_channel(PROCESS_ERRORS_CHANNEL)?;
        let (result_tx, _) = self.results.register_pipe(1);
        let session_id = self.session_id.clone();
        Ok(tokio::spawn(async move {
            let mut count = 0i64;
            while let Some(row) = source.recv().await {
                count += 1;
                tracing::warn!(
                    "{} - bad row: column '{}': {}",
                    session_id,
                    row.get(2).map(crate::core::value::Value::render).unwrap_or_default(),
                    row.get(3).map(crate::core::value::Value::render).unwrap_or_default(),
                );
            }
            let _ = result_tx
                .send_async(ComputePipesResult::ok("process_errors", count))
                .await;
        }))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::config::model::ChannelSpec;
    use crate::core::value::Value;

    /// A minimal context over in-memory channels for operator tests.
    pub fn test_context(channels: &[(&str, &[&str])]) -> BuilderContext {
        let specs: Vec<ChannelSpec> = channels
            .iter()
            .map(|(name, columns)| ChannelSpec {
                name: name.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
            })
            .collect();
        let registry = Arc::new(ChannelRegistry::new(&specs, vec!["k".to_string()]));
        let (err_tx, _err_rx) = flume::unbounded();
        let scratch = tempfile::tempdir().unwrap().into_path();
        let env = JetsEnv {
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
        };
        let store: StoreHandle =
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(scratch).unwrap());
        BuilderContext {
            session_id: "test-session".to_string(),
            node_id: 0,
            jets_partition: "0".to_string(),
            read_step_id: "reducing00".to_string(),
            write_step_id: "reducing01".to_string(),
            cp_config: Arc::new(ComputePipesConfig::default()),
            env: Arc::new(env),
            store,
            db: None,
            lookup_mgr: Arc::new(LookupTableManager::empty()),
            registry,
            cancel: CancellationToken::new(),
            err_tx,
            results: Arc::new(ChannelResults::new()),
            s3_device: None,
            context_values: Arc::new(HashMap::new()),
        }
    }

    fn sharding_config(nbr_partitions: u64) -> ComputePipesConfig {
        serde_json::from_value(serde_json::json!({
            "channels": [
                {"name": "mapped", "columns": ["k", "v", "jets_partition_key"]},
                {"name": "staged", "columns": ["k", "v", "jets_partition_key"]}
            ],
            "pipes_config": [
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
                             "hash_expr": {"expr": "k", "nbr_jets_partitions": nbr_partitions}}
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
                        "write_headers": false,
                        "output_channel": {
                            "type": "stage", "name": "staged",
                            "channel_spec_name": "mapped",
                            "write_step_id": "reducing01",
                            "compression": "none"
                        }
                    }]
                }
            ]
        }))
        .unwrap()
    }

    /// Rows hashed on `k` across 4 partitions land in partition files whose
    /// label matches the hash, and every row arrives exactly once.
    #[tokio::test]
    async fn sharding_graph_partitions_rows_by_hash() {
        let bucket = tempfile::tempdir().unwrap();
        let mut ctx = test_context(&[]);
        let cp_config: ComputePipesConfig = sharding_config(4);
        let registry = Arc::new(ChannelRegistry::new(
            &cp_config.channels,
            vec!["k".to_string(), "v".to_string()],
        ));
        let store: StoreHandle = Arc::new(
            object_store::local::LocalFileSystem::new_with_prefix(bucket.path()).unwrap(),
        );
        let (s3_result_tx, s3_result_rx) = flume::bounded(1);
        let s3_device = S3DeviceManager::start(
            store.clone(),
            "us-east-1".to_string(),
            2,
            s3_result_tx,
            ctx.cancel.clone(),
        )
        .unwrap();
        ctx.cp_config = Arc::new(cp_config);
        ctx.registry = registry;
        ctx.store = store.clone();
        ctx.s3_device = Some(s3_device.clone());

        let graph = ctx.build_compute_graph().unwrap();

        // pump 10 rows into input_row then close it
        let input = ctx.registry.get_output_channel("input_row").unwrap();
        for i in 0..10 {
            input
                .send(
                    vec![Value::Text(format!("key-{i}")), Value::Int(i)],
                    &ctx.cancel,
                )
                .await
                .unwrap();
        }
        drop(input);
        ctx.registry.close_channel("input_row");

        for h in graph.pipes {
            h.await.unwrap();
        }
        ctx.registry.close_channel(PROCESS_ERRORS_CHANNEL);
        graph.process_errors.await.unwrap();
        ctx.s3_device = None;
        s3_device.finish("test-session").await;
        let s3_result = s3_result_rx.recv_async().await.unwrap();
        assert!(s3_result.err.is_none());
        assert!(s3_result.parts_count >= 1);

        // every written row's key re-hashes to its partition directory
        let hash = crate::expr::hash::compile_hash(
            &crate::config::model::HashExpression {
                expr: "k".to_string(),
                nbr_jets_partitions: Some(4),
                ..Default::default()
            },
            &HashMap::from([("k".to_string(), 0usize)]),
        )
        .unwrap();
        let stage_root = bucket
            .path()
            .join("jetstore/stage/test-session/reducing01");
        let mut seen_rows = 0;
        for partition_dir in std::fs::read_dir(&stage_root).unwrap() {
            let partition_dir = partition_dir.unwrap();
            let label = partition_dir.file_name().to_string_lossy().to_string();
            for part in std::fs::read_dir(partition_dir.path()).unwrap() {
                let bytes = std::fs::read(part.unwrap().path()).unwrap();
                let rows = crate::io::reader::read_rows(
                    bytes,
                    &crate::io::reader::ReadSpec {
                        format: crate::io::reader::InputFormat::HeaderlessCsv,
                        ..Default::default()
                    },
                )
                .unwrap();
                for row in rows {
                    seen_rows += 1;
                    let expected = hash.eval(&row);
                    assert_eq!(label, expected.to_string());
                    // the hash column travelled with the row
                    assert_eq!(row[2].render(), expected.to_string());
                }
            }
        }
        assert_eq!(seen_rows, 10);
    }
}
