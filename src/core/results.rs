//! Result plumbing for one node: each pipe registers a channel of
//! per-partition results, and the S3 device manager reports the aggregated
//! upload outcome on its own channel.

use crate::error::PipeError;

/// Outcome of writing one partition (or of the whole upload pool).
#[derive(Debug, Clone, Default)]
pub struct ComputePipesResult {
    pub label: String,
    pub parts_count: i64,
    pub err: Option<String>,
}

impl ComputePipesResult {
    pub fn ok(label: impl Into<String>, parts_count: i64) -> Self {
        Self {
            label: label.into(),
            parts_count,
            err: None,
        }
    }

    pub fn error(label: impl Into<String>, err: &PipeError) -> Self {
        Self {
            label: label.into(),
            parts_count: 0,
            err: Some(err.to_string()),
        }
    }
}

pub type ResultReceiver = flume::Receiver<ComputePipesResult>;
pub type ResultSender = flume::Sender<ComputePipesResult>;

/// Per-node collection points. `write_partitions` is a channel of channels:
/// every pipe contributes one inner channel carrying a result per written
/// partition.
pub struct ChannelResults {
    pub write_partitions_tx: flume::Sender<ResultReceiver>,
    pub write_partitions_rx: flume::Receiver<ResultReceiver>,
    pub s3_put_object_tx: ResultSender,
    pub s3_put_object_rx: ResultReceiver,
}

impl ChannelResults {
    pub fn new() -> Self {
        let (write_partitions_tx, write_partitions_rx) = flume::unbounded();
        let (s3_put_object_tx, s3_put_object_rx) = flume::bounded(1);
        Self {
            write_partitions_tx,
            write_partitions_rx,
            s3_put_object_tx,
            s3_put_object_rx,
        }
    }

    /// Register a new per-pipe result channel. `capacity` bounds the number
    /// of partitions the pipe may report without the collector keeping up.
    pub fn register_pipe(&self, capacity: usize) -> (ResultSender, ResultReceiver) {
        let (tx, rx) = flume::bounded(capacity);
        self.write_partitions_tx
            .send(rx.clone())
            .expect("results collector closed before build completed");
        (tx, rx)
    }
}

impl Default for ChannelResults {
    fn default() -> Self {
        Self::new()
    }
}
