//! Row channels between operators.
//!
//! A channel is a bounded flume rendezvous carrying rows, plus an immutable
//! spec `{name, columns}`. Three views exist: the write-only producer end,
//! the read-only consumer end, and the registry entry holding the keeper
//! sender. Producers select on the node's cancellation token so a fatal
//! error anywhere unblocks every sender within one row-send.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::model::ChannelSpec;
use crate::core::value::Row;
use crate::error::{PipeError, PipeResult};

/// Registry-held entry: the receiver, the keeper sender (dropped on close)
/// and the shared column map.
pub struct RowChannel {
    pub spec: Arc<ChannelSpec>,
    pub columns: Arc<HashMap<String, usize>>,
    rx: flume::Receiver<Row>,
    keeper: Mutex<Option<flume::Sender<Row>>>,
}

impl RowChannel {
    pub fn new(spec: ChannelSpec) -> Self {
        // rendezvous: a sender waits for a receiver, giving back-pressure
        let (tx, rx) = flume::bounded(0);
        let columns = Arc::new(
            spec.columns
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect::<HashMap<String, usize>>(),
        );
        Self {
            spec: Arc::new(spec),
            columns,
            rx,
            keeper: Mutex::new(Some(tx)),
        }
    }

    /// Drop the keeper sender. Idempotent: a second close is a no-op.
    /// Consumers see end-of-input once every producer clone is gone too.
    pub fn close(&self) {
        self.keeper.lock().expect("channel keeper lock").take();
    }

    pub fn is_closed(&self) -> bool {
        self.keeper.lock().expect("channel keeper lock").is_none()
    }

    pub fn input(&self) -> InputChannel {
        InputChannel {
            spec: self.spec.clone(),
            columns: self.columns.clone(),
            rx: self.rx.clone(),
        }
    }

    pub fn output(&self) -> PipeResult<OutputChannel> {
        let guard = self.keeper.lock().expect("channel keeper lock");
        let tx = guard
            .as_ref()
            .ok_or_else(|| PipeError::ChannelClosed(self.spec.name.clone()))?
            .clone();
        Ok(OutputChannel {
            spec: self.spec.clone(),
            columns: self.columns.clone(),
            tx,
        })
    }
}

/// Consumer view of a channel.
#[derive(Clone)]
pub struct InputChannel {
    pub spec: Arc<ChannelSpec>,
    pub columns: Arc<HashMap<String, usize>>,
    rx: flume::Receiver<Row>,
}

impl InputChannel {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Receive the next row; `None` means the channel was closed and fully
    /// drained.
    pub async fn recv(&self) -> Option<Row> {
        self.rx.recv_async().await.ok()
    }
}

/// Producer view of a channel. Dropping it releases this producer's hold on
/// the channel.
#[derive(Clone)]
pub struct OutputChannel {
    pub spec: Arc<ChannelSpec>,
    pub columns: Arc<HashMap<String, usize>>,
    tx: flume::Sender<Row>,
}

impl OutputChannel {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Send a row, giving up if the node is cancelled first.
    pub async fn send(&self, row: Row, cancel: &CancellationToken) -> PipeResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipeError::Interrupted),
            sent = self.tx.send_async(row) => {
                sent.map_err(|_| PipeError::ChannelClosed(self.spec.name.clone()))
            }
        }
    }
}
