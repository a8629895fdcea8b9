//! Declarative configuration: the JSON model, its validation rules and the
//! deployment environment.

pub mod env;
pub mod model;
pub mod validation;

pub use env::JetsEnv;
pub use model::*;
pub use validation::{
    select_active_lookup_tables, select_active_output_tables, validate_pipe_config,
};
