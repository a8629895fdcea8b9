//! Configuration validation.
//!
//! The configuration JSON is the source of truth for an execution, so it is
//! validated aggressively at load time and every error names the offending
//! location. Validation also applies the documented defaults (output channel
//! type `memory`, stage compression `snappy`) so the runtime never has to
//! re-interpret empty fields.
//!
//! Rules enforced here:
//! - the first pipe of a step reads from `input_row` when sharding;
//! - `fan_out`, `splitter`, `merge_files` are the only pipe types, and a
//!   `splitter` carries a `splitter_config`;
//! - output channels of type `stage`/`output` have a non-empty `name`
//!   different from `channel_spec_name`; type `sql` has `output_table_key`;
//! - `partition_writer` has a `device_writer_type` or an output channel
//!   `schema_provider`, and a staging partition_writer uses `csv_writer`;
//! - every lookup referenced by any operator is declared in `lookup_tables`.

use std::collections::HashSet;

use crate::config::model::*;
use crate::error::{PipeError, PipeResult};

pub const OPERATOR_TYPES: [&str; 8] = [
    "map_record",
    "aggregate",
    "analyze",
    "high_freq",
    "anonymize",
    "distinct",
    "shuffling",
    "partition_writer",
];

/// Normalise defaults and validate one step's pipe list in place.
pub fn validate_pipe_config(pipes: &mut [PipeSpec], step_id: usize) -> PipeResult<()> {
    if pipes.is_empty() {
        return Err(PipeError::config(format!(
            "reducing_pipes_config[{step_id}] is empty"
        )));
    }
    if step_id == 0 && pipes[0].input_channel.name != "input_row" {
        return Err(PipeError::config(
            "reducing_pipes_config[0][0].input_channel.name must be 'input_row'",
        ));
    }
    for (i, pipe) in pipes.iter_mut().enumerate() {
        let at = format!("reducing_pipes_config[{step_id}][{i}]");
        match pipe.pipe_type.as_str() {
            "fan_out" | "merge_files" => {}
            "splitter" => {
                if pipe.splitter_config.is_none() {
                    return Err(PipeError::config(format!(
                        "{at}: splitter requires splitter_config"
                    )));
                }
            }
            other => {
                return Err(PipeError::config(format!(
                    "{at}: unknown pipe type '{other}' (expecting fan_out, splitter, merge_files)"
                )));
            }
        }
        if pipe.input_channel.name.is_empty() {
            return Err(PipeError::config(format!(
                "{at}: input_channel.name is required"
            )));
        }
        for (j, spec) in pipe.apply.iter_mut().enumerate() {
            validate_transformation(spec, &format!("{at}.apply[{j}]"))?;
        }
    }
    Ok(())
}

fn validate_transformation(spec: &mut TransformationSpec, at: &str) -> PipeResult<()> {
    if !OPERATOR_TYPES.contains(&spec.transformation_type.as_str()) {
        return Err(PipeError::config(format!(
            "{at}: unknown transformation type '{}'",
            spec.transformation_type
        )));
    }
    if spec.transformation_type == "partition_writer"
        && spec.device_writer_type.is_none()
        && spec.output_channel.schema_provider.is_empty()
    {
        return Err(PipeError::config(format!(
            "{at}: partition_writer requires 'device_writer_type' or 'output_channel.schema_provider'"
        )));
    }

    let out = &mut spec.output_channel;
    if out.channel_type.is_empty() {
        out.channel_type = "memory".to_string();
    }
    match out.channel_type.as_str() {
        "sql" => {
            if out.output_table_key.is_empty() {
                return Err(PipeError::config(format!(
                    "{at}: output_channel of type 'sql' requires output_table_key"
                )));
            }
            out.name = out.output_table_key.clone();
            out.spec_name = out.output_table_key.clone();
        }
        _ => {
            if out.name.is_empty() || out.name == out.spec_name {
                return Err(PipeError::config(format!(
                    "{at}: output_channel.name must not be empty or equal to channel_spec_name"
                )));
            }
            match out.channel_type.as_str() {
                "stage" => {
                    if out.compression.is_empty() {
                        out.compression = "snappy".to_string();
                    }
                    if spec.transformation_type == "partition_writer"
                        && spec.device_writer_type.as_deref() != Some("csv_writer")
                    {
                        return Err(PipeError::config(format!(
                            "{at}: partition_writer with a staging output channel must use a csv_writer"
                        )));
                    }
                    if out.write_step_id.is_empty() {
                        return Err(PipeError::config(format!(
                            "{at}: write_step_id is required on an output_channel of type 'stage'"
                        )));
                    }
                }
                "output" => {
                    if out.compression.is_empty() {
                        out.compression = "none".to_string();
                    }
                }
                "memory" => {
                    out.compression.clear();
                }
                other => {
                    return Err(PipeError::config(format!(
                        "{at}: unknown output_channel type '{other}' (expecting memory, stage, output, sql)"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Verify that every lookup referenced by the given pipes is declared, and
/// return the declared specs actually used by this step.
pub fn select_active_lookup_tables<'a>(
    lookup_tables: &'a [LookupSpec],
    pipes: &[PipeSpec],
) -> PipeResult<Vec<&'a LookupSpec>> {
    let declared: std::collections::HashMap<&str, &LookupSpec> = lookup_tables
        .iter()
        .map(|spec| (spec.key.as_str(), spec))
        .collect();
    let mut active = Vec::new();
    let mut seen = HashSet::new();
    let mut use_lookup = |name: &str, at: &str, active: &mut Vec<&'a LookupSpec>| -> PipeResult<()> {
        match declared.get(name) {
            Some(spec) => {
                if seen.insert(name.to_string()) {
                    active.push(spec);
                }
                Ok(())
            }
            None => Err(PipeError::config(format!(
                "lookup table '{name}' referenced by {at} is not defined in lookup_tables"
            ))),
        }
    };
    for pipe in pipes {
        for spec in &pipe.apply {
            for column in &spec.columns {
                if let Some(name) = &column.lookup_name {
                    use_lookup(name, "a column transformation", &mut active)?;
                }
            }
            if let Some(tokens) = &spec.lookup_tokens {
                for node in tokens {
                    use_lookup(&node.name, "an analyze lookup_tokens entry", &mut active)?;
                }
            }
            if let Some(anonymize) = &spec.anonymize_config {
                if !anonymize.lookup_name.is_empty() {
                    use_lookup(&anonymize.lookup_name, "the anonymize operator", &mut active)?;
                }
            }
        }
    }
    Ok(active)
}

/// Return the declared output tables used by this step; a reference to an
/// undeclared table is a configuration error.
pub fn select_active_output_tables<'a>(
    tables: &'a [TableSpec],
    pipes: &[PipeSpec],
) -> PipeResult<Vec<&'a TableSpec>> {
    let declared: std::collections::HashMap<&str, &TableSpec> =
        tables.iter().map(|t| (t.key.as_str(), t)).collect();
    let mut active = Vec::new();
    let mut seen = HashSet::new();
    for pipe in pipes {
        for spec in &pipe.apply {
            let key = &spec.output_channel.output_table_key;
            if key.is_empty() {
                continue;
            }
            let table = declared.get(key.as_str()).ok_or_else(|| {
                PipeError::config(format!(
                    "output table spec '{key}' used in an output_channel is not declared"
                ))
            })?;
            if seen.insert(key.clone()) {
                active.push(*table);
            }
        }
    }
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_spec(channel_type: &str) -> TransformationSpec {
        TransformationSpec {
            transformation_type: "partition_writer".to_string(),
            device_writer_type: Some("csv_writer".to_string()),
            output_channel: OutputChannelConfig {
                channel_type: channel_type.to_string(),
                name: "out".to_string(),
                spec_name: "out_spec".to_string(),
                write_step_id: "reducing01".to_string(),
                output_table_key: if channel_type == "sql" {
                    "out_table".to_string()
                } else {
                    String::new()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn single_pipe(spec: TransformationSpec) -> Vec<PipeSpec> {
        vec![PipeSpec {
            pipe_type: "fan_out".to_string(),
            input_channel: InputChannelConfig {
                name: "input_row".to_string(),
                ..Default::default()
            },
            apply: vec![spec],
            ..Default::default()
        }]
    }

    #[test]
    fn stage_channel_defaults_to_snappy() {
        let mut pipes = single_pipe(writer_spec("stage"));
        validate_pipe_config(&mut pipes, 0).unwrap();
        assert_eq!(pipes[0].apply[0].output_channel.compression, "snappy");
    }

    #[test]
    fn sql_channel_requires_table_key() {
        let mut spec = writer_spec("sql");
        spec.output_channel.output_table_key = String::new();
        let mut pipes = single_pipe(spec);
        assert!(validate_pipe_config(&mut pipes, 0).is_err());
    }

    #[test]
    fn sql_channel_takes_the_table_key_as_name() {
        let mut pipes = single_pipe(writer_spec("sql"));
        validate_pipe_config(&mut pipes, 0).unwrap();
        assert_eq!(pipes[0].apply[0].output_channel.name, "out_table");
    }

    #[test]
    fn output_name_must_differ_from_spec_name() {
        let mut spec = writer_spec("stage");
        spec.output_channel.spec_name = "out".to_string();
        let mut pipes = single_pipe(spec);
        assert!(validate_pipe_config(&mut pipes, 0).is_err());
    }

    #[test]
    fn staging_partition_writer_must_be_csv() {
        let mut spec = writer_spec("stage");
        spec.device_writer_type = Some("parquet_writer".to_string());
        let mut pipes = single_pipe(spec);
        assert!(validate_pipe_config(&mut pipes, 0).is_err());
    }

    #[test]
    fn sharding_step_must_read_input_row() {
        let mut pipes = single_pipe(writer_spec("stage"));
        pipes[0].input_channel.name = "other".to_string();
        assert!(validate_pipe_config(&mut pipes, 0).is_err());
        // a later reducing step may read any channel
        validate_pipe_config(&mut pipes, 1).unwrap();
    }

    #[test]
    fn undeclared_lookup_is_an_error() {
        let mut spec = writer_spec("stage");
        spec.columns.push(TransformationColumnSpec {
            lookup_name: Some("acme_codes".to_string()),
            ..Default::default()
        });
        let pipes = single_pipe(spec);
        assert!(select_active_lookup_tables(&[], &pipes).is_err());
        let declared = vec![LookupSpec {
            key: "acme_codes".to_string(),
            ..Default::default()
        }];
        let active = select_active_lookup_tables(&declared, &pipes).unwrap();
        assert_eq!(active.len(), 1);
    }
}
