//! Schema providers: resolve the input format, compression, delimiter and
//! column list of a source, synthesising a provider from the `source_config`
//! row when the configuration declares none, and sampling the first input
//! file when headers or delimiter are unknown.

pub mod provider;

pub use provider::{SchemaProvider, fixed_width_layout_from_csv, synthesize_main_input};
