//! Readers for the supported input formats. An object is fetched whole,
//! decompressed, then decoded into text rows; typing happens downstream in
//! the operators.

use std::io::Cursor;

use calamine::{Data, Reader};

use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::io::Compression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    HeaderlessCsv,
    FixedWidth,
    Parquet,
    ParquetSelect,
    Xlsx,
    HeaderlessXlsx,
}

impl InputFormat {
    pub fn parse(s: &str) -> PipeResult<Self> {
        match s {
            "csv" => Ok(InputFormat::Csv),
            "headerless_csv" => Ok(InputFormat::HeaderlessCsv),
            "fixed_width" => Ok(InputFormat::FixedWidth),
            "parquet" => Ok(InputFormat::Parquet),
            "parquet_select" => Ok(InputFormat::ParquetSelect),
            "xlsx" => Ok(InputFormat::Xlsx),
            "headerless_xlsx" => Ok(InputFormat::HeaderlessXlsx),
            other => Err(PipeError::config(format!("unknown input format '{other}'"))),
        }
    }

    pub fn has_header_row(self) -> bool {
        matches!(self, InputFormat::Csv | InputFormat::Xlsx)
    }
}

/// Everything needed to decode one object into rows.
#[derive(Debug, Clone)]
pub struct ReadSpec {
    pub format: InputFormat,
    pub compression: Compression,
    pub delimiter: char,
    /// fixed_width: (name, start, length) per column
    pub fixed_width_layout: Vec<(String, usize, usize)>,
    /// xlsx: the sheet to read (first sheet when empty)
    pub current_sheet: String,
    /// parquet_select: restrict to these columns (all when empty)
    pub select_columns: Vec<String>,
}

impl Default for ReadSpec {
    fn default() -> Self {
        Self {
            format: InputFormat::Csv,
            compression: Compression::None,
            delimiter: ',',
            fixed_width_layout: Vec::new(),
            current_sheet: String::new(),
            select_columns: Vec::new(),
        }
    }
}

/// Decode an object into rows of text values. For formats with a header row
/// the header is skipped here; use [`read_headers`] to sample it.
pub fn read_rows(bytes: Vec<u8>, spec: &ReadSpec) -> PipeResult<Vec<Row>> {
    let bytes = spec.compression.decode(bytes)?;
    match spec.format {
        InputFormat::Csv | InputFormat::HeaderlessCsv => read_csv_rows(&bytes, spec),
        InputFormat::FixedWidth => read_fixed_width_rows(&bytes, spec),
        InputFormat::Parquet | InputFormat::ParquetSelect => read_parquet_rows(bytes, spec),
        InputFormat::Xlsx | InputFormat::HeaderlessXlsx => read_xlsx_rows(bytes, spec),
    }
}

/// Sample the column names of an object (first line / sheet row / parquet
/// schema). Empty parquet names get positional fillers.
pub fn read_headers(bytes: Vec<u8>, spec: &ReadSpec) -> PipeResult<Vec<String>> {
    let bytes = spec.compression.decode(bytes)?;
    match spec.format {
        InputFormat::Csv | InputFormat::HeaderlessCsv => {
            let mut rdr = csv_reader(&bytes, spec);
            let mut record = csv::StringRecord::new();
            if !rdr.read_record(&mut record)? {
                return Err(PipeError::system("input file has no header line"));
            }
            Ok(record.iter().map(|f| f.trim().to_string()).collect())
        }
        InputFormat::FixedWidth => Ok(spec
            .fixed_width_layout
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()),
        InputFormat::Parquet | InputFormat::ParquetSelect => parquet_headers(bytes),
        InputFormat::Xlsx | InputFormat::HeaderlessXlsx => {
            let range = xlsx_range(bytes, spec)?;
            let first = range
                .rows()
                .next()
                .ok_or_else(|| PipeError::system("xlsx sheet is empty"))?;
            Ok(first.iter().map(render_cell).collect())
        }
    }
}

fn csv_reader(bytes: &[u8], spec: &ReadSpec) -> csv::Reader<Cursor<Vec<u8>>> {
    csv::ReaderBuilder::new()
        .delimiter(spec.delimiter as u8)
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(bytes.to_vec()))
}

fn read_csv_rows(bytes: &[u8], spec: &ReadSpec) -> PipeResult<Vec<Row>> {
    let mut rdr = csv_reader(bytes, spec);
    let mut rows = Vec::new();
    let mut skip_header = spec.format.has_header_row();
    for record in rdr.records() {
        let record = record?;
        if skip_header {
            skip_header = false;
            continue;
        }
        rows.push(
            record
                .iter()
                .map(|f| {
                    if f.is_empty() {
                        Value::Null
                    } else {
                        Value::Text(f.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(rows)
}

fn read_fixed_width_rows(bytes: &[u8], spec: &ReadSpec) -> PipeResult<Vec<Row>> {
    if spec.fixed_width_layout.is_empty() {
        return Err(PipeError::config(
            "fixed_width input requires a column layout",
        ));
    }
    let text = String::from_utf8_lossy(bytes);
    let mut rows = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let row = spec
            .fixed_width_layout
            .iter()
            .map(|(_, start, length)| {
                let end = (*start + *length).min(chars.len());
                if *start >= chars.len() {
                    return Value::Null;
                }
                let field: String = chars[*start..end].iter().collect();
                let field = field.trim();
                if field.is_empty() {
                    Value::Null
                } else {
                    Value::Text(field.to_string())
                }
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn parquet_headers(bytes: Vec<u8>) -> PipeResult<Vec<String>> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))?;
    let mut headers: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    // guard against files written without column names
    for (i, h) in headers.iter_mut().enumerate() {
        if h.is_empty() {
            *h = format!("column_{i}");
        }
    }
    Ok(headers)
}

fn read_parquet_rows(bytes: Vec<u8>, spec: &ReadSpec) -> PipeResult<Vec<Row>> {
    use arrow::array::Array;
    use parquet::arrow::ProjectionMask;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))?;
    let builder = if spec.format == InputFormat::ParquetSelect && !spec.select_columns.is_empty() {
        let schema = builder.parquet_schema();
        let indices: Vec<usize> = (0..schema.num_columns())
            .filter(|i| {
                let name = schema.column(*i).name().to_string();
                spec.select_columns.contains(&name)
            })
            .collect();
        let mask = ProjectionMask::leaves(schema, indices);
        builder.with_projection(mask)
    } else {
        builder
    };
    let reader = builder.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let columns: Vec<arrow::array::ArrayRef> = batch.columns().to_vec();
        for r in 0..batch.num_rows() {
            let mut row = Vec::with_capacity(columns.len());
            for col in &columns {
                if col.is_null(r) {
                    row.push(Value::Null);
                } else {
                    let rendered = arrow::util::display::array_value_to_string(col, r)
                        .map_err(PipeError::Arrow)?;
                    row.push(Value::Text(rendered));
                }
            }
            rows.push(row);
        }
    }
    Ok(rows)
}

fn xlsx_range(bytes: Vec<u8>, spec: &ReadSpec) -> PipeResult<calamine::Range<Data>> {
    let cursor = Cursor::new(bytes);
    let mut workbook: calamine::Xlsx<_> = calamine::Xlsx::new(cursor)
        .map_err(|e| PipeError::system(format!("cannot open xlsx workbook: {e}")))?;
    let sheet = if spec.current_sheet.is_empty() {
        workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| PipeError::system("xlsx workbook has no sheet"))?
    } else {
        spec.current_sheet.clone()
    };
    workbook
        .worksheet_range(&sheet)
        .map_err(|e| PipeError::system(format!("cannot read xlsx sheet '{sheet}': {e}")))
}

fn render_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn read_xlsx_rows(bytes: Vec<u8>, spec: &ReadSpec) -> PipeResult<Vec<Row>> {
    let range = xlsx_range(bytes, spec)?;
    let mut rows = Vec::new();
    let mut skip_header = spec.format.has_header_row();
    for cells in range.rows() {
        if skip_header {
            skip_header = false;
            continue;
        }
        rows.push(
            cells
                .iter()
                .map(|c| {
                    let s = render_cell(c);
                    if s.is_empty() {
                        Value::Null
                    } else {
                        Value::Text(s)
                    }
                })
                .collect(),
        );
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_with_header_skips_it() {
        let spec = ReadSpec::default();
        let rows = read_rows(b"a,b\n1,2\n,3\n".to_vec(), &spec).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Text("1".into()));
        assert_eq!(rows[1][0], Value::Null);
    }

    #[test]
    fn headerless_csv_keeps_the_first_line() {
        let spec = ReadSpec {
            format: InputFormat::HeaderlessCsv,
            delimiter: '|',
            ..Default::default()
        };
        let rows = read_rows(b"1|2\n3|4\n".to_vec(), &spec).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn fixed_width_slices_by_layout() {
        let spec = ReadSpec {
            format: InputFormat::FixedWidth,
            fixed_width_layout: vec![
                ("id".to_string(), 0, 4),
                ("name".to_string(), 4, 6),
            ],
            ..Default::default()
        };
        let rows = read_rows(b"0001 alice\n0002   bob\n".to_vec(), &spec).unwrap();
        assert_eq!(rows[0][0], Value::Text("0001".into()));
        assert_eq!(rows[0][1], Value::Text("alice".into()));
        assert_eq!(rows[1][1], Value::Text("bob".into()));
    }

    #[test]
    fn snappy_round_trip() {
        use std::io::Write;
        let mut enc = snap::write::FrameEncoder::new(Vec::new());
        enc.write_all(b"a,b\n1,2\n").unwrap();
        let compressed = enc.into_inner().unwrap();
        let spec = ReadSpec {
            compression: Compression::Snappy,
            ..Default::default()
        };
        let rows = read_rows(compressed, &spec).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn csv_headers_are_sampled() {
        let spec = ReadSpec::default();
        let headers = read_headers(b"id, name ,zip\n1,a,b\n".to_vec(), &spec).unwrap();
        assert_eq!(headers, vec!["id", "name", "zip"]);
    }
}
