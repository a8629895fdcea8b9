//! The compute-pipes configuration model.
//!
//! Deserialised from the JSON held in the workspace file named by
//! `process_config.main_rules` and, once materialised by the sharding
//! controller, from `cpipes_execution_status.cpipes_config_json`. The JSON
//! keys are a wire contract; renaming a field here breaks every stored
//! configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputePipesConfig {
    pub common_runtime_args: Option<CommonRuntimeArgs>,
    pub cluster_config: Option<ClusterSpec>,
    pub output_tables: Vec<TableSpec>,
    pub output_files: Vec<OutputFileSpec>,
    pub lookup_tables: Vec<LookupSpec>,
    pub channels: Vec<ChannelSpec>,
    pub context: Option<Vec<ContextSpec>>,
    pub schema_providers: Vec<SchemaProviderSpec>,
    /// Materialised pipes for the current step (the controller copies the
    /// relevant `reducing_pipes_config` entry here).
    pub pipes_config: Vec<PipeSpec>,
    /// Step 0 is the sharding step; steps 1..k are reducing steps.
    pub reducing_pipes_config: Vec<Vec<PipeSpec>>,
}

/// Runtime identity of one execution, stamped by the controller into the
/// materialised configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonRuntimeArgs {
    pub cpipes_mode: String, // sharding | reducing
    pub client: String,
    pub org: String,
    pub object_type: String,
    pub file_key: String,
    pub session_id: String,
    pub main_input_step_id: String,
    pub read_step_id: String,
    pub input_session_id: String,
    pub source_period_key: i32,
    pub process_name: String,
    pub sources_config: SourcesConfigSpec,
    pub pipeline_config_key: i32,
    pub user_email: String,
    /// Input file keys enumerated by the sharding controller; nodes take
    /// their share by `index % nbr_nodes` and never re-list the bucket.
    pub input_file_keys: Vec<FileKeyInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileKeyInfo {
    pub key: String,
    pub size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfigSpec {
    pub main_input: Option<InputSourceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSourceSpec {
    pub input_columns: Vec<String>,
    pub input_format: String,
    pub compression: String,
    pub delimiter: String,
    pub input_format_data_json: String,
    pub schema_provider: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    pub nbr_nodes: usize,
    /// Set by the controller when materialising the sharding config; equals
    /// the number of sharding nodes.
    pub nbr_partitions: usize,
    pub default_max_concurrency: i32,
    pub s3_worker_pool_size: usize,
    pub nbr_nodes_lookup: Option<Vec<ClusterSizingSpec>>,
    pub is_debug_mode: bool,
    pub kill_switch_min: i32,
}

/// Dynamic cluster sizing: the first rule whose threshold is at or below the
/// total input size wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSizingSpec {
    pub when_total_size_ge_mb: i64,
    pub nbr_nodes: usize,
    pub s3_worker_pool_size: usize,
    pub use_ecs_tasks: bool,
    pub max_concurrency: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupSpec {
    pub key: String,
    /// `sql_lookup` or `s3_csv_lookup`.
    #[serde(rename = "type")]
    pub lookup_type: String,
    pub query: String,
    pub csv_source: Option<CsvSourceSpec>,
    pub columns: Vec<TableColumnSpec>,
    pub lookup_key: Vec<String>,
    pub lookup_values: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvSourceSpec {
    #[serde(rename = "type")]
    pub source_type: String,
    pub input_format: String,
    pub compression: String,
    pub delimiter: String,
    pub process_name: String,
    pub read_step_id: String,
    #[serde(rename = "jets_partition")]
    pub jets_partition_label: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSpec {
    pub name: String,
    pub columns: Vec<String>,
}

/// Context columns: `file_key_component` parses a value out of the input
/// file key with a regex; `partfile_key_component` appends a synthetic
/// column carrying the partition key from the stage path; `value` is a
/// plain substitution constant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSpec {
    #[serde(rename = "type")]
    pub context_type: String,
    pub key: String,
    pub expr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaProviderSpec {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub source_type: String,
    pub key: String,
    pub client: String,
    pub vendor: String,
    pub object_type: String,
    pub schema_name: String,
    pub input_format: String,
    pub compression: String,
    pub input_format_data_json: String,
    pub delimiter: String,
    pub is_part_files: bool,
    pub fixed_width_columns_csv: String,
    pub columns: Vec<SchemaColumnSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaColumnSpec {
    pub name: String,
    /// fixed_width only
    pub start: Option<usize>,
    pub length: usize,
    pub precision: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSpec {
    pub key: String,
    pub name: String,
    pub check_schema_changed: bool,
    pub columns: Vec<TableColumnSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableColumnSpec {
    pub name: String,
    pub rdf_type: String,
    #[serde(rename = "as_array")]
    pub is_array: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFileSpec {
    pub key: String,
    pub name: String,
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeSpec {
    /// `fan_out`, `splitter` or `merge_files`.
    #[serde(rename = "type")]
    pub pipe_type: String,
    pub input_channel: InputChannelConfig,
    pub splitter_config: Option<SplitterSpec>,
    pub apply: Vec<TransformationSpec>,
    /// merge_files only: key of the output file spec to write.
    pub output_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterSpec {
    /// `standard` (default) or `ext_count`.
    #[serde(rename = "type")]
    pub splitter_type: String,
    pub column: String,
    pub default_splitter_value: String,
    pub partition_row_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputChannelConfig {
    /// `input` or `stage` (default).
    #[serde(rename = "type")]
    pub channel_type: String,
    pub name: String,
    pub format: String,
    pub compression: String,
    pub read_step_id: String,
    pub sampling_rate: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputChannelConfig {
    /// `memory` (default), `stage`, `output` or `sql`.
    #[serde(rename = "type")]
    pub channel_type: String,
    pub name: String,
    pub format: String,
    pub compression: String,
    pub schema_provider: String,
    pub write_step_id: String,
    pub output_table_key: String,
    pub key_prefix: String,
    pub file_name: String,
    #[serde(rename = "channel_spec_name")]
    pub spec_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformationSpec {
    /// One of: map_record, aggregate, analyze, high_freq, anonymize,
    /// distinct, shuffling, partition_writer.
    #[serde(rename = "type")]
    pub transformation_type: String,
    pub new_record: bool,
    pub partition_size: Option<usize>,
    pub jets_partition_key: Option<String>,
    pub file_path_substitutions: Option<Vec<PathSubstitution>>,
    pub columns: Vec<TransformationColumnSpec>,
    pub data_schema: Option<Vec<DataSchemaSpec>>,
    /// partition_writer: csv_writer, parquet_writer or fixed_width_writer.
    pub device_writer_type: Option<String>,
    pub write_headers: bool,
    pub regex_tokens: Option<Vec<RegexNode>>,
    pub lookup_tokens: Option<Vec<LookupTokenNode>>,
    pub keyword_tokens: Option<Vec<KeywordTokenNode>>,
    pub high_freq_columns: Option<Vec<HighFreqSpec>>,
    pub anonymize_config: Option<AnonymizeSpec>,
    pub distinct_config: Option<DistinctSpec>,
    pub output_channel: OutputChannelConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSubstitution {
    pub replace: String,
    pub with: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSchemaSpec {
    pub column: String,
    pub rdf_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexNode {
    pub name: String,
    #[serde(rename = "re")]
    pub rexpr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupTokenNode {
    #[serde(rename = "lookup_name")]
    pub name: String,
    pub key_re: String,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordTokenNode {
    pub name: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HighFreqSpec {
    pub name: String,
    pub key_re: String,
    #[serde(rename = "top_pct")]
    pub top_percentile: usize,
    pub top_rank: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizeSpec {
    pub lookup_name: String,
    pub anonymize_type: String,
    pub key_prefix: String,
    pub keys_output_channel: OutputChannelConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DistinctSpec {
    pub distinct_on: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformationColumnSpec {
    pub name: String,
    /// select, value, eval, map, hash, case, count, distinct_count, sum,
    /// min, map_reduce, lookup.
    #[serde(rename = "type")]
    pub column_type: String,
    pub expr: Option<String>,
    pub map_expr: Option<MapExpression>,
    pub eval_expr: Option<ExpressionNode>,
    pub hash_expr: Option<HashExpression>,
    #[serde(rename = "where")]
    pub where_expr: Option<ExpressionNode>,
    pub case_expr: Vec<CaseExpression>,
    pub else_expr: Vec<ExpressionNode>,
    pub map_on: Option<String>,
    pub alternate_map_on: Option<Vec<String>>,
    pub apply_map: Option<Vec<TransformationColumnSpec>>,
    pub apply_reduce: Option<Vec<TransformationColumnSpec>>,
    pub lookup_name: Option<String>,
    #[serde(rename = "key")]
    pub lookup_key: Option<Vec<LookupColumnSpec>>,
    #[serde(rename = "values")]
    pub lookup_values: Option<Vec<LookupColumnSpec>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub expr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HashExpression {
    pub expr: String,
    pub nbr_jets_partitions: Option<u64>,
    pub alternate_composite_expr: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapExpression {
    pub cleansing_function: Option<String>,
    pub argument: Option<String>,
    pub default: Option<String>,
    pub err_msg: Option<String>,
    pub rdf_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpressionNode {
    /// For case `then` / `else_expr` nodes: the output column to set.
    pub name: Option<String>,
    /// Leaf type: `select` or `value`.
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub expr: Option<String>,
    pub as_rdf_type: Option<String>,
    pub arg: Option<Box<ExpressionNode>>,
    pub lhs: Option<Box<ExpressionNode>>,
    pub op: Option<String>,
    pub rhs: Option<Box<ExpressionNode>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseExpression {
    pub when: ExpressionNode,
    pub then: Vec<ExpressionNode>,
}

/// Arguments to start a sharding or reducing phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartComputePipesArgs {
    pub pipeline_exec_key: i64,
    pub file_key: String,
    pub session_id: String,
    pub step_id: Option<usize>,
    pub use_ecs_task: bool,
    pub max_concurrency: i32,
}

/// Arguments handed to one worker node of the current phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputePipesNodeArgs {
    pub node_id: usize,
    pub pipeline_exec_key: i64,
}

/// What a phase start returns to the caller: the per-node commands plus the
/// follow-up actions (next phase, reports, status updates).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputePipesRun {
    pub cpipes_commands: Vec<ComputePipesNodeArgs>,
    /// Set when the commands were spilled to the stage store instead of
    /// returned inline.
    pub cpipes_commands_s3_key: Option<String>,
    pub start_reducing: Option<StartComputePipesArgs>,
    pub is_last_reducing: bool,
    pub reports_command: Vec<String>,
    pub success_update: serde_json::Value,
    pub error_update: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let json = r#"{
            "cluster_config": {"nbr_nodes": 2, "s3_worker_pool_size": 4,
                "nbr_nodes_lookup": [{"when_total_size_ge_mb": 1024, "nbr_nodes": 8}]},
            "channels": [{"name": "mapped_row", "columns": ["k", "v"]}],
            "context": [{"type": "file_key_component", "key": "client", "expr": "client=(\\w+)"}],
            "reducing_pipes_config": [[
                {"type": "fan_out",
                 "input_channel": {"name": "input_row"},
                 "apply": [{"type": "map_record", "new_record": true,
                    "columns": [{"name": "k", "type": "select", "expr": "k"},
                                {"name": "p", "type": "hash",
                                 "hash_expr": {"expr": "k"}}],
                    "output_channel": {"name": "mapped_row", "channel_spec_name": "mapped_row_spec"}}]}
            ]]
        }"#;
        let cfg: ComputePipesConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.cluster_config.as_ref().unwrap().nbr_nodes, 2);
        assert_eq!(cfg.reducing_pipes_config.len(), 1);
        let pipe = &cfg.reducing_pipes_config[0][0];
        assert_eq!(pipe.pipe_type, "fan_out");
        assert_eq!(pipe.apply[0].columns[1].column_type, "hash");

        let back = serde_json::to_string(&cfg).unwrap();
        let cfg2: ComputePipesConfig = serde_json::from_str(&back).unwrap();
        assert_eq!(cfg2.channels[0].name, "mapped_row");
    }
}
