//! Format devices: readers that turn fetched objects into rows and writers
//! that turn buffered partitions into local part files ready for upload.

pub mod reader;
pub mod writer;

pub use reader::{InputFormat, ReadSpec, read_headers, read_rows};
pub use writer::{DeviceWriter, FixedWidthLayout};

use crate::error::{PipeError, PipeResult};

/// Wire compression of an object: `none` or `snappy` (frame format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Snappy,
}

impl Compression {
    pub fn parse(s: &str) -> PipeResult<Self> {
        match s {
            "" | "none" => Ok(Compression::None),
            "snappy" => Ok(Compression::Snappy),
            other => Err(PipeError::config(format!("unknown compression '{other}'"))),
        }
    }

    pub fn decode(self, bytes: Vec<u8>) -> PipeResult<Vec<u8>> {
        match self {
            Compression::None => Ok(bytes),
            Compression::Snappy => {
                use std::io::Read;
                let mut out = Vec::new();
                snap::read::FrameDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    /// File name suffix for stage/output objects.
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Snappy => ".snappy",
        }
    }
}
