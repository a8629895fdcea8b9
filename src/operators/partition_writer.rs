//! `partition_writer`: terminal operator. Rows are grouped by their jets
//! partition key (or the fixed key handed down by a splitter) and written
//! through the selected device to one local part file per group; each
//! completed part is handed to the S3 device manager. At end of input the
//! operator reports one `ComputePipesResult` per partition.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::model::TransformationSpec;
use crate::core::builder::BuilderContext;
use crate::core::channel::{InputChannel, OutputChannel};
use crate::core::results::{ComputePipesResult, ResultSender};
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::io::writer::{DeviceWriter, FixedWidthLayout};
use crate::io::Compression;
use crate::operators::TransformationPipe;
use crate::s3::S3UploadTask;

pub const JETS_PARTITION_COLUMN: &str = "jets_partition_key";

struct PartitionState {
    writer: Option<DeviceWriter>,
    part_path: PathBuf,
    part_key: String,
    rows_in_part: usize,
    parts: i64,
}

pub struct PartitionWriterPipe {
    session_id: String,
    device_type: String,
    compression: Compression,
    delimiter: char,
    headers: Vec<String>,
    /// source position of each written column
    projection: Vec<usize>,
    write_headers: bool,
    partition_size: usize,
    key_pos: Option<usize>,
    fixed_partition: Option<String>,
    default_partition: String,
    groups: HashMap<String, PartitionState>,
    temp_dir: PathBuf,
    task_tx: Option<flume::Sender<S3UploadTask>>,
    result_tx: ResultSender,
    /// `{partition}` is substituted with the group label
    file_key_template: String,
    fixed_width_layout: Option<FixedWidthLayout>,
    cancel: CancellationToken,
}

impl PartitionWriterPipe {
    pub fn new(
        ctx: &BuilderContext,
        source: &InputChannel,
        _out: OutputChannel,
        jets_partition_key: Option<String>,
        result_tx: ResultSender,
        spec: &TransformationSpec,
    ) -> PipeResult<Self> {
        let out_config = &spec.output_channel;
        // the device comes from the spec, or from the output channel's
        // schema provider (validation guarantees one of the two)
        let provider = if out_config.schema_provider.is_empty() {
            None
        } else {
            let provider_spec = ctx
                .cp_config
                .schema_providers
                .iter()
                .find(|sp| sp.key == out_config.schema_provider)
                .ok_or_else(|| {
                    PipeError::config(format!(
                        "partition_writer: schema provider '{}' is not declared",
                        out_config.schema_provider
                    ))
                })?;
            Some(crate::schema::SchemaProvider::initialize(provider_spec)?)
        };
        let device_type = match &spec.device_writer_type {
            Some(device) => device.clone(),
            None => match provider.as_ref().map(|p| p.format) {
                Some(crate::io::reader::InputFormat::FixedWidth) => {
                    "fixed_width_writer".to_string()
                }
                Some(
                    crate::io::reader::InputFormat::Parquet
                    | crate::io::reader::InputFormat::ParquetSelect,
                ) => "parquet_writer".to_string(),
                _ => "csv_writer".to_string(),
            },
        };
        let delimiter = provider
            .as_ref()
            .and_then(|p| p.delimiter)
            .unwrap_or(',');
        let fixed_width_layout: Option<FixedWidthLayout> = provider.as_ref().map(|p| {
            p.fixed_width_layout
                .iter()
                .map(|(_, start, length)| (*start, *length))
                .collect()
        });
        let compression = Compression::parse(&out_config.compression)?;

        // written columns come from the channel spec named by the output
        // channel; default to the source layout
        let (headers, projection): (Vec<String>, Vec<usize>) =
            match ctx.registry.get_input_channel(&out_config.spec_name) {
                Ok(spec_channel) => {
                    let names = spec_channel.spec.columns.clone();
                    let mut projection = Vec::with_capacity(names.len());
                    for name in &names {
                        let pos = source.columns.get(name).copied().ok_or_else(|| {
                            PipeError::config(format!(
                                "partition_writer column '{name}' is not in input channel '{}'",
                                source.name()
                            ))
                        })?;
                        projection.push(pos);
                    }
                    (names, projection)
                }
                Err(_) => (
                    source.spec.columns.clone(),
                    (0..source.spec.columns.len()).collect(),
                ),
            };

        let file_key_template = match out_config.channel_type.as_str() {
            "output" => {
                let key_prefix = ctx.substitute_context(&out_config.key_prefix);
                let file_name = ctx.substitute_context(&out_config.file_name);
                format!("{}/{}/{}", ctx.env.s3_output_prefix, key_prefix, file_name)
            }
            // stage is the default for a partition writer
            _ => {
                let step = if out_config.write_step_id.is_empty() {
                    ctx.write_step_id.clone()
                } else {
                    out_config.write_step_id.clone()
                };
                format!(
                    "{}/{}/{}/{{partition}}",
                    ctx.env.s3_stage_prefix, ctx.session_id, step
                )
            }
        };
        let file_key_template = match &spec.file_path_substitutions {
            Some(subs) => {
                let mut key = file_key_template;
                for sub in subs {
                    key = key.replace(&sub.replace, &sub.with);
                }
                key
            }
            None => file_key_template,
        };

        let key_column = spec
            .jets_partition_key
            .clone()
            .unwrap_or_else(|| JETS_PARTITION_COLUMN.to_string());
        let key_pos = source.columns.get(&key_column).copied();
        if spec.jets_partition_key.is_some() && key_pos.is_none() {
            return Err(PipeError::config(format!(
                "partition_writer: jets_partition_key column '{key_column}' is not in input channel '{}'",
                source.name()
            )));
        }

        let temp_dir = std::env::temp_dir().join(format!(
            "cpipes-{}-{}",
            ctx.session_id,
            Uuid::new_v4()
        ));
        std::fs::create_dir_all(&temp_dir)?;
        let task_tx = match &ctx.s3_device {
            Some(manager) => {
                manager.register_temp_folder(temp_dir.clone());
                Some(manager.task_sender())
            }
            None => None,
        };

        Ok(Self {
            session_id: ctx.session_id.clone(),
            device_type,
            compression,
            delimiter,
            headers,
            projection,
            write_headers: spec.write_headers,
            partition_size: spec.partition_size.unwrap_or(0),
            key_pos,
            fixed_partition: jets_partition_key,
            default_partition: ctx.jets_partition.clone(),
            groups: HashMap::new(),
            temp_dir,
            task_tx,
            result_tx,
            file_key_template,
            fixed_width_layout,
            cancel: ctx.cancel.clone(),
        })
    }

    fn partition_label(&self, row: &Row) -> String {
        if let Some(fixed) = &self.fixed_partition {
            return fixed.clone();
        }
        match self.key_pos.and_then(|p| row.get(p)) {
            Some(v) if !v.is_null() => v.render(),
            _ => self.default_partition.clone(),
        }
    }

    fn open_part(&self, label: &str, part_seq: i64) -> PipeResult<(DeviceWriter, PathBuf, String)> {
        let ext = DeviceWriter::extension(&self.device_type, self.compression);
        let file_name = format!("part-{:05}-{}.{}", part_seq, Uuid::new_v4(), ext);
        let part_path = self.temp_dir.join(&file_name);
        let base = self.file_key_template.replace("{partition}", label);
        let part_key = if base.ends_with(&format!(".{ext}")) || base.ends_with(ext.as_str()) {
            // a fully named output file keeps its configured key
            base
        } else {
            format!("{base}/{file_name}")
        };
        let writer = DeviceWriter::create(
            &self.device_type,
            &part_path,
            &self.headers,
            self.compression,
            self.write_headers,
            self.delimiter,
            self.fixed_width_layout.clone(),
        )?;
        Ok((writer, part_path, part_key))
    }

    async fn finish_part(&mut self, label: &str) -> PipeResult<()> {
        let Some(state) = self.groups.get_mut(label) else {
            return Ok(());
        };
        let Some(writer) = state.writer.take() else {
            return Ok(());
        };
        writer.finish()?;
        state.parts += 1;
        state.rows_in_part = 0;
        if let Some(task_tx) = &self.task_tx {
            let task = S3UploadTask {
                external_bucket: None,
                file_key: state.part_key.clone(),
                local_file_path: state.part_path.clone(),
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(PipeError::Interrupted),
                sent = task_tx.send_async(task) => {
                    sent.map_err(|_| PipeError::system("s3 upload pool closed early"))?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransformationPipe for PartitionWriterPipe {
    async fn apply(&mut self, row: &Row) -> PipeResult<()> {
        let label = self.partition_label(row);
        if !self.groups.contains_key(&label) {
            let (writer, part_path, part_key) = self.open_part(&label, 0)?;
            self.groups.insert(
                label.clone(),
                PartitionState {
                    writer: Some(writer),
                    part_path,
                    part_key,
                    rows_in_part: 0,
                    parts: 0,
                },
            );
        }

        let projected: Row = self
            .projection
            .iter()
            .map(|p| row.get(*p).cloned().unwrap_or(Value::Null))
            .collect();

        let state = self.groups.get_mut(&label).expect("group just inserted");
        state
            .writer
            .as_mut()
            .expect("open part")
            .write_row(&projected)?;
        state.rows_in_part += 1;

        if self.partition_size > 0 && state.rows_in_part >= self.partition_size {
            let next_seq = state.parts + 1;
            self.finish_part(&label).await?;
            let (writer, part_path, part_key) = self.open_part(&label, next_seq)?;
            let state = self.groups.get_mut(&label).expect("group exists");
            state.writer = Some(writer);
            state.part_path = part_path;
            state.part_key = part_key;
        }
        Ok(())
    }

    async fn done(&mut self) -> PipeResult<()> {
        let labels: Vec<String> = self.groups.keys().cloned().collect();
        for label in labels {
            self.finish_part(&label).await?;
        }
        for (label, state) in self.groups.drain() {
            let result = ComputePipesResult::ok(
                format!("{}:{}", self.session_id, label),
                state.parts,
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(PipeError::Interrupted),
                sent = self.result_tx.send_async(result) => {
                    sent.map_err(|_| PipeError::system("partition result channel closed early"))?;
                }
            }
        }
        Ok(())
    }

    async fn finally(&mut self) {
        // release the upload pool hold; unfinished writers are dropped
        self.task_tx.take();
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::tests::test_context;
    use crate::io::reader::{ReadSpec, read_rows};

    fn spec(partition_size: Option<usize>) -> TransformationSpec {
        serde_json::from_value(serde_json::json!({
            "type": "partition_writer",
            "device_writer_type": "csv_writer",
            "partition_size": partition_size,
            "write_headers": false,
            "output_channel": {
                "type": "stage",
                "name": "staged",
                "channel_spec_name": "staged_spec",
                "write_step_id": "reducing01",
                "compression": "none"
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn groups_rows_by_partition_key_and_reports_parts() {
        let ctx = test_context(&[
            ("in_rows", &["k", "jets_partition_key"]),
            ("staged", &["unused"]),
        ]);
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("staged").unwrap();
        let (result_tx, result_rx) = flume::unbounded();
        let mut pipe =
            PartitionWriterPipe::new(&ctx, &source, out, None, result_tx, &spec(None)).unwrap();
        let temp_dir = pipe.temp_dir.clone();

        for (k, p) in [("a", "0"), ("b", "1"), ("c", "0")] {
            pipe.apply(&vec![Value::Text(k.into()), Value::Text(p.into())])
                .await
                .unwrap();
        }
        pipe.done().await.unwrap();
        pipe.finally().await;
        drop(pipe);

        let mut results: Vec<ComputePipesResult> = result_rx.drain().collect();
        results.sort_by(|a, b| a.label.cmp(&b.label));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].parts_count, 1);
        assert!(results.iter().all(|r| r.err.is_none()));

        // without an upload pool the parts stay local; both partitions wrote
        let parts: Vec<_> = std::fs::read_dir(&temp_dir).unwrap().collect();
        assert_eq!(parts.len(), 2);
        std::fs::remove_dir_all(&temp_dir).unwrap();
    }

    #[tokio::test]
    async fn rotates_parts_at_partition_size() {
        let ctx = test_context(&[
            ("in_rows", &["k", "jets_partition_key"]),
            ("staged", &["unused"]),
        ]);
        let source = ctx.registry.get_input_channel("in_rows").unwrap();
        let out = ctx.registry.get_output_channel("staged").unwrap();
        let (result_tx, result_rx) = flume::unbounded();
        let mut pipe =
            PartitionWriterPipe::new(&ctx, &source, out, Some("p7".to_string()), result_tx, &spec(Some(2)))
                .unwrap();
        let temp_dir = pipe.temp_dir.clone();

        for i in 0..5 {
            pipe.apply(&vec![Value::Int(i), Value::Null]).await.unwrap();
        }
        pipe.done().await.unwrap();
        pipe.finally().await;
        drop(pipe);

        let results: Vec<ComputePipesResult> = result_rx.drain().collect();
        assert_eq!(results.len(), 1);
        // 5 rows with rotation at 2 -> 3 parts for the fixed partition
        assert_eq!(results[0].parts_count, 3);

        let mut rows = Vec::new();
        for entry in std::fs::read_dir(&temp_dir).unwrap() {
            let bytes = std::fs::read(entry.unwrap().path()).unwrap();
            rows.extend(read_rows(
                bytes,
                &ReadSpec {
                    format: crate::io::reader::InputFormat::HeaderlessCsv,
                    ..Default::default()
                },
            )
            .unwrap());
        }
        assert_eq!(rows.len(), 5);
        std::fs::remove_dir_all(&temp_dir).unwrap();
    }
}
