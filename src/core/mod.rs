//! Core runtime: row values, channels, the channel registry, result
//! plumbing and the compute-graph builder.

pub mod builder;
pub mod channel;
pub mod registry;
pub mod results;
pub mod value;

pub use builder::BuilderContext;
pub use channel::{InputChannel, OutputChannel, RowChannel};
pub use registry::{ChannelRegistry, INPUT_ROW_CHANNEL, PROCESS_ERRORS_CHANNEL};
pub use results::{ChannelResults, ComputePipesResult};
pub use value::{Row, Value};
