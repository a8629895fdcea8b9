//! Lookup tables: small reference tables loaded once per node and queried
//! by the operators (`map_record` lookup columns, `analyze` lookup tokens,
//! `anonymize` preserved values).
//!
//! Two sources: `sql_lookup` runs a query against the control database,
//! `s3_csv_lookup` reads a CSV object (optionally a stage object written by
//! an earlier cpipes run).

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{Column, PgPool, Row as SqlxRow};

use crate::config::model::LookupSpec;
use crate::core::value::Value;
use crate::error::{PipeError, PipeResult};
use crate::io::{Compression, InputFormat, ReadSpec, read_headers, read_rows};
use crate::s3::store::{StoreHandle, fetch_object};

/// The separator joining composite lookup keys; same role as the one used
/// by composite hash expressions.
const KEY_SEPARATOR: char = '\u{1f}';

pub struct LookupTable {
    spec: LookupSpec,
    /// composite key -> values, aligned with `spec.lookup_values`
    rows: HashMap<String, Vec<Value>>,
    value_positions: HashMap<String, usize>,
}

impl LookupTable {
    pub fn key(&self) -> &str {
        &self.spec.key
    }

    /// Position of a value column in the looked-up vectors.
    pub fn value_position(&self, name: &str) -> Option<usize> {
        self.value_positions.get(name).copied()
    }

    pub fn lookup(&self, key: &str) -> Option<&Vec<Value>> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    pub fn compose_key(parts: &[String]) -> String {
        parts.join(&KEY_SEPARATOR.to_string())
    }

    fn from_rows(
        spec: LookupSpec,
        headers: &[String],
        data: Vec<Vec<Value>>,
    ) -> PipeResult<Self> {
        let positions: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), i))
            .collect();
        let key_pos: Vec<usize> = spec
            .lookup_key
            .iter()
            .map(|k| {
                positions.get(k.as_str()).copied().ok_or_else(|| {
                    PipeError::config(format!(
                        "lookup table '{}': key column '{k}' not in source columns",
                        spec.key
                    ))
                })
            })
            .collect::<PipeResult<_>>()?;
        let value_pos: Vec<usize> = spec
            .lookup_values
            .iter()
            .map(|v| {
                positions.get(v.as_str()).copied().ok_or_else(|| {
                    PipeError::config(format!(
                        "lookup table '{}': value column '{v}' not in source columns",
                        spec.key
                    ))
                })
            })
            .collect::<PipeResult<_>>()?;

        let mut rows = HashMap::with_capacity(data.len());
        for record in data {
            let key_parts: Vec<String> = key_pos
                .iter()
                .map(|p| record.get(*p).map(Value::render).unwrap_or_default())
                .collect();
            let values: Vec<Value> = value_pos
                .iter()
                .map(|p| record.get(*p).cloned().unwrap_or(Value::Null))
                .collect();
            rows.insert(Self::compose_key(&key_parts), values);
        }
        let value_positions = spec
            .lookup_values
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i))
            .collect();
        Ok(Self {
            spec,
            rows,
            value_positions,
        })
    }
}

#[derive(Default)]
pub struct LookupTableManager {
    tables: HashMap<String, Arc<LookupTable>>,
}

impl LookupTableManager {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every active lookup of this step.
    pub async fn load(
        specs: &[&LookupSpec],
        db: Option<&PgPool>,
        store: &StoreHandle,
        stage_prefix: &str,
    ) -> PipeResult<Self> {
        let mut tables = HashMap::new();
        for spec in specs {
            let table = match spec.lookup_type.as_str() {
                "sql_lookup" => {
                    let db = db.ok_or_else(|| {
                        PipeError::config(format!(
                            "lookup table '{}' is sql_lookup but the node has no database",
                            spec.key
                        ))
                    })?;
                    load_sql_lookup(spec, db).await?
                }
                "s3_csv_lookup" => load_csv_lookup(spec, store, stage_prefix).await?,
                other => {
                    return Err(PipeError::config(format!(
                        "lookup table '{}': unknown type '{other}'",
                        spec.key
                    )));
                }
            };
            tables.insert(spec.key.clone(), Arc::new(table));
        }
        Ok(Self { tables })
    }

    pub fn get(&self, name: &str) -> PipeResult<Arc<LookupTable>> {
        self.tables.get(name).cloned().ok_or_else(|| {
            PipeError::config(format!("lookup table '{name}' is not loaded"))
        })
    }
}

async fn load_sql_lookup(spec: &LookupSpec, db: &PgPool) -> PipeResult<LookupTable> {
    if spec.query.is_empty() {
        return Err(PipeError::config(format!(
            "lookup table '{}' of type sql_lookup has no query",
            spec.key
        )));
    }
    let rows = sqlx::query(&spec.query).fetch_all(db).await?;
    let headers: Vec<String> = match rows.first() {
        Some(row) => row
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
        None => spec
            .lookup_key
            .iter()
            .chain(spec.lookup_values.iter())
            .cloned()
            .collect(),
    };
    let mut data = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut record = Vec::with_capacity(headers.len());
        for i in 0..headers.len() {
            let v: Option<String> = row.try_get(i)?;
            record.push(Value::from_opt_text(v));
        }
        data.push(record);
    }
    LookupTable::from_rows((*spec).clone(), &headers, data)
}

async fn load_csv_lookup(
    spec: &LookupSpec,
    store: &StoreHandle,
    stage_prefix: &str,
) -> PipeResult<LookupTable> {
    let source = spec.csv_source.as_ref().ok_or_else(|| {
        PipeError::config(format!(
            "lookup table '{}' of type s3_csv_lookup has no csv_source",
            spec.key
        ))
    })?;
    // `cpipes` sources read a stage object of a previous run; plain sources
    // read the query field as the object key.
    let key = if source.source_type == "cpipes" {
        format!(
            "{stage_prefix}/{}/{}/{}",
            source.session_id, source.read_step_id, source.jets_partition_label
        )
    } else {
        spec.query.clone()
    };
    let compression = Compression::parse(&source.compression)?;
    let format = if source.input_format.is_empty() {
        InputFormat::Csv
    } else {
        InputFormat::parse(&source.input_format)?
    };
    let delimiter = source.delimiter.chars().next().unwrap_or(',');
    let read_spec = ReadSpec {
        format,
        compression,
        delimiter,
        ..Default::default()
    };
    let bytes = fetch_object(store, &key).await?;
    let headers = if format.has_header_row() {
        read_headers(bytes.clone(), &read_spec)?
    } else if !spec.columns.is_empty() {
        spec.columns.iter().map(|c| c.name.clone()).collect()
    } else {
        return Err(PipeError::config(format!(
            "lookup table '{}': headerless source requires declared columns",
            spec.key
        )));
    };
    let data = read_rows(bytes, &read_spec)?;
    LookupTable::from_rows((*spec).clone(), &headers, data)
}
