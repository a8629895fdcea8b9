//! The control plane: phase controllers (sharding / reducing), worker-node
//! coordination, execution status persistence, the SQL insert contract for
//! the control tables, and gateway notifications.

pub mod file_keys;
pub mod node;
pub mod notify;
pub mod output_tables;
pub mod reducing;
pub mod sharding;
pub mod sql_stmts;
pub mod status;

pub use node::{NodeResult, coordinate_compute_pipes, run_node};
pub use reducing::start_reducing;
pub use sharding::start_sharding;
