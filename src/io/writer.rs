//! Device writers used by `partition_writer` and `merge_files`: each writes
//! rows to a local part file that the S3 device manager later uploads.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};
use crate::io::Compression;

/// Fixed-width output layout: (start, length) per column, in column order.
pub type FixedWidthLayout = Vec<(usize, usize)>;

pub enum DeviceWriter {
    Csv(CsvDeviceWriter),
    Parquet(ParquetDeviceWriter),
    FixedWidth(FixedWidthDeviceWriter),
}

impl DeviceWriter {
    /// Open a device of the requested type over a new local part file.
    pub fn create(
        device_type: &str,
        path: &Path,
        headers: &[String],
        compression: Compression,
        write_headers: bool,
        delimiter: char,
        fixed_width_layout: Option<FixedWidthLayout>,
    ) -> PipeResult<DeviceWriter> {
        match device_type {
            "csv_writer" => Ok(DeviceWriter::Csv(CsvDeviceWriter::create(
                path,
                headers,
                compression,
                write_headers,
                delimiter,
            )?)),
            "parquet_writer" => Ok(DeviceWriter::Parquet(ParquetDeviceWriter::create(
                path, headers,
            )?)),
            "fixed_width_writer" => {
                let layout = fixed_width_layout.ok_or_else(|| {
                    PipeError::config("fixed_width_writer requires a column layout")
                })?;
                Ok(DeviceWriter::FixedWidth(FixedWidthDeviceWriter::create(
                    path, layout,
                )?))
            }
            other => Err(PipeError::config(format!(
                "unknown device_writer_type '{other}'"
            ))),
        }
    }

    pub fn write_row(&mut self, row: &Row) -> PipeResult<()> {
        match self {
            DeviceWriter::Csv(w) => w.write_row(row),
            DeviceWriter::Parquet(w) => w.write_row(row),
            DeviceWriter::FixedWidth(w) => w.write_row(row),
        }
    }

    /// Flush and close the part file.
    pub fn finish(self) -> PipeResult<()> {
        match self {
            DeviceWriter::Csv(w) => w.finish(),
            DeviceWriter::Parquet(w) => w.finish(),
            DeviceWriter::FixedWidth(w) => w.finish(),
        }
    }

    /// File-name extension for this device, including the compression
    /// suffix (`csv`, `csv.snappy`, `parquet`, `txt`).
    pub fn extension(device_type: &str, compression: Compression) -> String {
        match device_type {
            "parquet_writer" => "parquet".to_string(),
            "fixed_width_writer" => format!("txt{}", compression.suffix()),
            _ => format!("csv{}", compression.suffix()),
        }
    }
}

enum CsvSink {
    Plain(csv::Writer<BufWriter<File>>),
    Snappy(csv::Writer<snap::write::FrameEncoder<BufWriter<File>>>),
}

pub struct CsvDeviceWriter {
    sink: CsvSink,
}

impl CsvDeviceWriter {
    fn create(
        path: &Path,
        headers: &[String],
        compression: Compression,
        write_headers: bool,
        delimiter: char,
    ) -> PipeResult<Self> {
        let file = BufWriter::new(File::create(path)?);
        let builder = || {
            let mut b = csv::WriterBuilder::new();
            b.delimiter(delimiter as u8);
            b
        };
        let mut sink = match compression {
            Compression::None => CsvSink::Plain(builder().from_writer(file)),
            Compression::Snappy => {
                CsvSink::Snappy(builder().from_writer(snap::write::FrameEncoder::new(file)))
            }
        };
        if write_headers {
            match &mut sink {
                CsvSink::Plain(w) => w.write_record(headers)?,
                CsvSink::Snappy(w) => w.write_record(headers)?,
            }
        }
        Ok(Self { sink })
    }

    fn write_row(&mut self, row: &Row) -> PipeResult<()> {
        let fields: Vec<String> = row.iter().map(Value::render).collect();
        match &mut self.sink {
            CsvSink::Plain(w) => w.write_record(&fields)?,
            CsvSink::Snappy(w) => w.write_record(&fields)?,
        }
        Ok(())
    }

    fn finish(mut self) -> PipeResult<()> {
        // flush through every layer; dropping the encoder ends the frame
        match &mut self.sink {
            CsvSink::Plain(w) => w.flush()?,
            CsvSink::Snappy(w) => w.flush()?,
        }
        Ok(())
    }
}

/// Buffers rendered rows and writes a single all-utf8 record batch on
/// finish. Stage parquet files carry text columns; typing is reapplied by
/// the readers of the next step.
pub struct ParquetDeviceWriter {
    writer: ArrowWriter<File>,
    schema: Arc<Schema>,
    buffer: Vec<Row>,
}

impl ParquetDeviceWriter {
    fn create(path: &Path, headers: &[String]) -> PipeResult<Self> {
        let fields: Vec<Field> = headers
            .iter()
            .map(|h| Field::new(h, DataType::Utf8, true))
            .collect();
        let schema = Arc::new(Schema::new(fields));
        let file = File::create(path)?;
        let props = WriterProperties::builder().build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
        Ok(Self {
            writer,
            schema,
            buffer: Vec::new(),
        })
    }

    fn write_row(&mut self, row: &Row) -> PipeResult<()> {
        self.buffer.push(row.clone());
        if self.buffer.len() >= 8192 {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> PipeResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let ncols = self.schema.fields().len();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(ncols);
        for c in 0..ncols {
            let col: StringArray = self
                .buffer
                .iter()
                .map(|row| match row.get(c) {
                    Some(Value::Null) | None => None,
                    Some(v) => Some(v.render()),
                })
                .collect();
            columns.push(Arc::new(col));
        }
        let batch = RecordBatch::try_new(self.schema.clone(), columns)?;
        self.writer.write(&batch)?;
        self.buffer.clear();
        Ok(())
    }

    fn finish(mut self) -> PipeResult<()> {
        self.flush_batch()?;
        self.writer.close()?;
        Ok(())
    }
}

pub struct FixedWidthDeviceWriter {
    out: BufWriter<File>,
    layout: FixedWidthLayout,
    line_len: usize,
}

impl FixedWidthDeviceWriter {
    fn create(path: &Path, layout: FixedWidthLayout) -> PipeResult<Self> {
        let line_len = layout
            .iter()
            .map(|(start, length)| start + length)
            .max()
            .unwrap_or(0);
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            layout,
            line_len,
        })
    }

    fn write_row(&mut self, row: &Row) -> PipeResult<()> {
        let mut line = vec![b' '; self.line_len];
        for (i, (start, length)) in self.layout.iter().enumerate() {
            let rendered = row.get(i).map(Value::render).unwrap_or_default();
            for (j, b) in rendered.bytes().take(*length).enumerate() {
                line[start + j] = b;
            }
        }
        self.out.write_all(&line)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn finish(mut self) -> PipeResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::reader::{InputFormat, ReadSpec, read_rows};

    fn text_row(fields: &[&str]) -> Row {
        fields.iter().map(|f| Value::Text(f.to_string())).collect()
    }

    #[test]
    fn csv_snappy_writer_round_trips_through_the_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-0.csv.snappy");
        let headers = vec!["a".to_string(), "b".to_string()];
        let mut w = DeviceWriter::create(
            "csv_writer",
            &path,
            &headers,
            Compression::Snappy,
            true,
            ',',
            None,
        )
        .unwrap();
        w.write_row(&text_row(&["1", "x"])).unwrap();
        w.write_row(&text_row(&["2", "y"])).unwrap();
        w.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let rows = read_rows(
            bytes,
            &ReadSpec {
                compression: Compression::Snappy,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], Value::Text("y".into()));
    }

    #[test]
    fn parquet_writer_round_trips_with_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-0.parquet");
        let headers = vec!["a".to_string(), "b".to_string()];
        let mut w = DeviceWriter::create(
            "parquet_writer",
            &path,
            &headers,
            Compression::None,
            false,
            ',',
            None,
        )
        .unwrap();
        w.write_row(&vec![Value::Text("1".into()), Value::Null]).unwrap();
        w.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let rows = read_rows(
            bytes,
            &ReadSpec {
                format: InputFormat::Parquet,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rows, vec![vec![Value::Text("1".into()), Value::Null]]);
    }

    #[test]
    fn fixed_width_writer_pads_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-0.txt");
        let mut w = DeviceWriter::create(
            "fixed_width_writer",
            &path,
            &[],
            Compression::None,
            false,
            ',',
            Some(vec![(0, 4), (4, 3)]),
        )
        .unwrap();
        w.write_row(&text_row(&["ab", "toolong"])).unwrap();
        w.finish().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "ab  too\n");
    }
}
