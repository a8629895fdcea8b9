//! Row-level cleansing: the function library applied by `map_record`,
//! the argument grammars, and the CSV delimiter auto-detection used when
//! sampling input files.

pub mod args;
pub mod csv_utils;
pub mod functions;
pub mod overpunch;

pub use csv_utils::{detect_delimiter, parse};
pub use functions::{CleansingContext, filter_digits, filter_double};
