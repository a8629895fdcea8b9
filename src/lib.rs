//! cpipes - a distributed two-phase (shard -> reduce) compute-pipes engine
//! for tabular data.
//!
//! Large inputs (CSV, fixed-width, Parquet, XLSX; optionally snappy
//! compressed) are cleaned and transformed through a configured DAG of
//! operators, partitioned by a hash key, and written to staging storage,
//! output files and SQL tables. A small control plane records every
//! execution in the control database and coordinates the worker fleets.

pub mod cleansing;
pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod executors;
pub mod expr;
pub mod io;
pub mod logging;
pub mod lookup;
pub mod operators;
pub mod s3;
pub mod schema;

pub use error::{BadValue, PipeError, PipeResult};
