use serde::Deserialize;

use crate::cleansing::detect_delimiter;
use crate::config::model::{SchemaColumnSpec, SchemaProviderSpec};
use crate::error::{PipeError, PipeResult};
use crate::io::reader::{InputFormat, ReadSpec, read_headers};
use crate::io::Compression;
use crate::s3::store::{StoreHandle, fetch_object};

/// Per-format options carried in `input_format_data_json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct InputFormatData {
    #[serde(rename = "currentSheet")]
    current_sheet: String,
    select_columns: Vec<String>,
}

/// A resolved input schema: everything a reader task needs to decode the
/// source's objects.
#[derive(Debug, Clone)]
pub struct SchemaProvider {
    pub key: String,
    pub format: InputFormat,
    pub compression: Compression,
    pub delimiter: Option<char>,
    pub columns: Vec<String>,
    pub fixed_width_layout: Vec<(String, usize, usize)>,
    pub is_part_files: bool,
    current_sheet: String,
    select_columns: Vec<String>,
}

impl SchemaProvider {
    /// Resolve a provider spec into a usable schema. Columns may still be
    /// empty; [`SchemaProvider::sample_file`] fills them from the first
    /// input object.
    pub fn initialize(spec: &SchemaProviderSpec) -> PipeResult<Self> {
        let format = InputFormat::parse(if spec.input_format.is_empty() {
            "csv"
        } else {
            &spec.input_format
        })?;
        let compression = Compression::parse(&spec.compression)?;
        let delimiter = spec.delimiter.chars().next();

        let format_data: InputFormatData = if spec.input_format_data_json.is_empty() {
            InputFormatData::default()
        } else {
            serde_json::from_str(&spec.input_format_data_json).map_err(|e| {
                PipeError::config(format!(
                    "schema provider '{}': invalid input_format_data_json: {e}",
                    spec.key
                ))
            })?
        };

        let fixed_width_layout = if format == InputFormat::FixedWidth {
            if !spec.fixed_width_columns_csv.is_empty() {
                fixed_width_layout_from_csv(&spec.fixed_width_columns_csv)?
            } else if !spec.columns.is_empty() {
                layout_from_columns(&spec.columns)
            } else {
                return Err(PipeError::config(format!(
                    "schema provider '{}': fixed_width input requires fixed_width_columns_csv or columns",
                    spec.key
                )));
            }
        } else {
            Vec::new()
        };

        let columns = if !fixed_width_layout.is_empty() {
            fixed_width_layout.iter().map(|(n, _, _)| n.clone()).collect()
        } else {
            spec.columns.iter().map(|c| c.name.clone()).collect()
        };

        Ok(Self {
            key: spec.key.clone(),
            format,
            compression,
            delimiter,
            columns,
            fixed_width_layout,
            is_part_files: spec.is_part_files,
            current_sheet: format_data.current_sheet,
            select_columns: format_data.select_columns,
        })
    }

    pub fn read_spec(&self) -> ReadSpec {
        ReadSpec {
            format: self.format,
            compression: self.compression,
            delimiter: self.delimiter.unwrap_or(','),
            fixed_width_layout: self.fixed_width_layout.clone(),
            current_sheet: self.current_sheet.clone(),
            select_columns: self.select_columns.clone(),
        }
    }

    /// Fetch the first input object and fill in whatever is still unknown:
    /// the CSV delimiter (auto-detected over the first 2 KiB) and the
    /// column list.
    pub async fn sample_file(&mut self, store: &StoreHandle, file_key: &str) -> PipeResult<()> {
        let bytes = fetch_object(store, file_key).await?;
        let bytes = self.compression.decode(bytes)?;
        let is_csv = matches!(self.format, InputFormat::Csv | InputFormat::HeaderlessCsv);
        if is_csv && self.delimiter.is_none() {
            // a tie or no candidate means a single-column file
            self.delimiter = Some(detect_delimiter(&bytes).unwrap_or(','));
        }
        if self.columns.is_empty() {
            let spec = ReadSpec {
                compression: Compression::None, // already decoded
                ..self.read_spec()
            };
            self.columns = read_headers(bytes, &spec)?;
        }
        Ok(())
    }
}

/// Synthesize the `main_input` provider from the `source_config` row when
/// the configuration declares none, then overlay the per-execution
/// `schema_provider_json`.
pub fn synthesize_main_input(
    declared: Option<&SchemaProviderSpec>,
    input_format: &str,
    compression: &str,
    input_format_data_json: &str,
    is_part_files: bool,
    schema_provider_json: &str,
) -> PipeResult<SchemaProviderSpec> {
    let mut spec = match declared {
        Some(sp) => {
            let mut sp = sp.clone();
            if sp.key.is_empty() {
                sp.key = "_main_input_".to_string();
            }
            sp
        }
        None => SchemaProviderSpec {
            provider_type: "default".to_string(),
            key: "_main_input_".to_string(),
            source_type: "main_input".to_string(),
            input_format: input_format.to_string(),
            compression: compression.to_string(),
            input_format_data_json: input_format_data_json.to_string(),
            is_part_files,
            ..Default::default()
        },
    };
    if !schema_provider_json.is_empty() {
        let overlay: SchemaProviderSpec =
            serde_json::from_str(schema_provider_json).map_err(|e| {
                PipeError::config(format!("invalid schema_provider_json: {e}"))
            })?;
        overlay_spec(&mut spec, overlay);
    }
    Ok(spec)
}

fn overlay_spec(base: &mut SchemaProviderSpec, overlay: SchemaProviderSpec) {
    if !overlay.input_format.is_empty() {
        base.input_format = overlay.input_format;
    }
    if !overlay.compression.is_empty() {
        base.compression = overlay.compression;
    }
    if !overlay.delimiter.is_empty() {
        base.delimiter = overlay.delimiter;
    }
    if !overlay.input_format_data_json.is_empty() {
        base.input_format_data_json = overlay.input_format_data_json;
    }
    if !overlay.fixed_width_columns_csv.is_empty() {
        base.fixed_width_columns_csv = overlay.fixed_width_columns_csv;
    }
    if !overlay.columns.is_empty() {
        base.columns = overlay.columns;
    }
    if !overlay.schema_name.is_empty() {
        base.schema_name = overlay.schema_name;
    }
    if overlay.is_part_files {
        base.is_part_files = true;
    }
}

/// Parse a fixed-width layout from CSV rows `name,start,length[,precision]`.
pub fn fixed_width_layout_from_csv(csv_layout: &str) -> PipeResult<Vec<(String, usize, usize)>> {
    let rows = crate::cleansing::parse(csv_layout)?;
    let mut layout = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 3 {
            return Err(PipeError::config(format!(
                "fixed_width_columns_csv row '{}' must be name,start,length",
                row.join(",")
            )));
        }
        let start: usize = row[1].trim().parse().map_err(|_| {
            PipeError::config(format!("fixed_width start '{}' is not an int", row[1]))
        })?;
        let length: usize = row[2].trim().parse().map_err(|_| {
            PipeError::config(format!("fixed_width length '{}' is not an int", row[2]))
        })?;
        layout.push((row[0].trim().to_string(), start, length));
    }
    Ok(layout)
}

/// Cumulative layout from declared column lengths.
fn layout_from_columns(columns: &[SchemaColumnSpec]) -> Vec<(String, usize, usize)> {
    let mut layout = Vec::with_capacity(columns.len());
    let mut cursor = 0usize;
    for c in columns {
        let start = c.start.unwrap_or(cursor);
        layout.push((c.name.clone(), start, c.length));
        cursor = start + c.length;
    }
    layout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesizes_default_provider_with_overlay() {
        let spec = synthesize_main_input(
            None,
            "csv",
            "none",
            "",
            false,
            r#"{"delimiter": "|", "compression": "snappy"}"#,
        )
        .unwrap();
        assert_eq!(spec.key, "_main_input_");
        assert_eq!(spec.source_type, "main_input");
        assert_eq!(spec.delimiter, "|");
        assert_eq!(spec.compression, "snappy");
        let provider = SchemaProvider::initialize(&spec).unwrap();
        assert_eq!(provider.delimiter, Some('|'));
        assert_eq!(provider.compression, Compression::Snappy);
    }

    #[test]
    fn fixed_width_layout_parsing() {
        let layout = fixed_width_layout_from_csv("id,0,4\nname,4,10\nzip,14,5").unwrap();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout[1], ("name".to_string(), 4, 10));
        assert!(fixed_width_layout_from_csv("id,0").is_err());
    }

    #[test]
    fn cumulative_layout_from_declared_lengths() {
        let spec = SchemaProviderSpec {
            key: "fw".to_string(),
            input_format: "fixed_width".to_string(),
            columns: vec![
                SchemaColumnSpec {
                    name: "a".to_string(),
                    length: 3,
                    ..Default::default()
                },
                SchemaColumnSpec {
                    name: "b".to_string(),
                    length: 5,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let provider = SchemaProvider::initialize(&spec).unwrap();
        assert_eq!(provider.fixed_width_layout[1], ("b".to_string(), 3, 5));
        assert_eq!(provider.columns, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn sampling_detects_delimiter_and_headers() {
        use object_store::ObjectStore;
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = std::sync::Arc::new(
            object_store::local::LocalFileSystem::new_with_prefix(dir.path()).unwrap(),
        );
        store
            .put(
                &object_store::path::Path::from("in/f1.csv"),
                object_store::PutPayload::from_static(b"id|name|zip\n1|a|02134\n"),
            )
            .await
            .unwrap();
        let spec = synthesize_main_input(None, "csv", "none", "", false, "").unwrap();
        let mut provider = SchemaProvider::initialize(&spec).unwrap();
        provider.sample_file(&store, "in/f1.csv").await.unwrap();
        assert_eq!(provider.delimiter, Some('|'));
        assert_eq!(provider.columns, vec!["id", "name", "zip"]);
    }
}
