//! The channel registry: every named channel of a node, created once from
//! the configured `ChannelSpec`s plus the two reserved channels `input_row`
//! (fed by the file reader) and `process_errors` (bad-row records).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::model::ChannelSpec;
use crate::core::channel::{InputChannel, OutputChannel, RowChannel};
use crate::error::{PipeError, PipeResult};

pub const INPUT_ROW_CHANNEL: &str = "input_row";
pub const PROCESS_ERRORS_CHANNEL: &str = "process_errors";

/// Columns of the reserved bad-row channel.
pub const PROCESS_ERRORS_COLUMNS: [&str; 4] = [
    "jets_key",
    "grouping_key",
    "input_column",
    "error_message",
];

pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, RowChannel>>,
    distribution: Mutex<HashMap<String, Vec<String>>>,
}

impl ChannelRegistry {
    /// Build the registry from the declared channel specs; `input_columns`
    /// becomes the spec of the reserved `input_row` channel.
    pub fn new(specs: &[ChannelSpec], input_columns: Vec<String>) -> Self {
        let mut channels = HashMap::new();
        channels.insert(
            INPUT_ROW_CHANNEL.to_string(),
            RowChannel::new(ChannelSpec {
                name: INPUT_ROW_CHANNEL.to_string(),
                columns: input_columns,
            }),
        );
        channels.insert(
            PROCESS_ERRORS_CHANNEL.to_string(),
            RowChannel::new(ChannelSpec {
                name: PROCESS_ERRORS_CHANNEL.to_string(),
                columns: PROCESS_ERRORS_COLUMNS.iter().map(|c| c.to_string()).collect(),
            }),
        );
        for spec in specs {
            channels.insert(spec.name.clone(), RowChannel::new(spec.clone()));
        }
        Self {
            channels: Mutex::new(channels),
            distribution: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_input_channel(&self, name: &str) -> PipeResult<InputChannel> {
        let channels = self.channels.lock().expect("registry lock");
        channels
            .get(name)
            .map(|c| c.input())
            .ok_or_else(|| {
                PipeError::config(format!("input channel '{name}' not found in registry"))
            })
    }

    pub fn get_output_channel(&self, name: &str) -> PipeResult<OutputChannel> {
        let channels = self.channels.lock().expect("registry lock");
        channels
            .get(name)
            .ok_or_else(|| {
                PipeError::config(format!("output channel '{name}' not found in registry"))
            })?
            .output()
    }

    /// Allocate an echo of `input` with the same column spec; the echo is
    /// named `input_N` where N counts the echoes created so far. The graph
    /// builder replicates every row of `input` into each echo.
    pub fn add_distribution_channel(&self, input: &str) -> PipeResult<String> {
        let mut channels = self.channels.lock().expect("registry lock");
        let base = channels.get(input).ok_or_else(|| {
            PipeError::config(format!(
                "distribution channel '{input}' not found in registry"
            ))
        })?;
        let base_columns = base.spec.columns.clone();
        let mut distribution = self.distribution.lock().expect("registry lock");
        let echoes = distribution.entry(input.to_string()).or_default();
        let echo = format!("{input}_{}", echoes.len());
        echoes.push(echo.clone());
        tracing::debug!("add_distribution_channel {} -> {}", input, echo);
        channels.insert(
            echo.clone(),
            RowChannel::new(ChannelSpec {
                name: echo.clone(),
                columns: base_columns,
            }),
        );
        Ok(echo)
    }

    pub fn distribution_echoes(&self, input: &str) -> Vec<String> {
        self.distribution
            .lock()
            .expect("registry lock")
            .get(input)
            .cloned()
            .unwrap_or_default()
    }

    /// Close a channel at most once; unknown names and repeated closes are
    /// no-ops so every executor can close its outputs unconditionally.
    pub fn close_channel(&self, name: &str) {
        let channels = self.channels.lock().expect("registry lock");
        if let Some(c) = channels.get(name) {
            if !c.is_closed() {
                tracing::debug!("closing channel {}", name);
            }
            c.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(
            &[ChannelSpec {
                name: "mapped".to_string(),
                columns: vec!["a".to_string(), "b".to_string()],
            }],
            vec!["x".to_string()],
        )
    }

    #[test]
    fn reserved_channels_exist() {
        let reg = registry();
        assert!(reg.get_input_channel(INPUT_ROW_CHANNEL).is_ok());
        assert!(reg.get_input_channel(PROCESS_ERRORS_CHANNEL).is_ok());
        assert!(reg.get_input_channel("nope").is_err());
    }

    #[test]
    fn distribution_echoes_are_numbered() {
        let reg = registry();
        assert_eq!(reg.add_distribution_channel("mapped").unwrap(), "mapped_0");
        assert_eq!(reg.add_distribution_channel("mapped").unwrap(), "mapped_1");
        let echo = reg.get_input_channel("mapped_1").unwrap();
        assert_eq!(echo.columns.len(), 2);
        assert_eq!(
            reg.distribution_echoes("mapped"),
            vec!["mapped_0".to_string(), "mapped_1".to_string()]
        );
    }

    #[test]
    fn close_channel_is_idempotent_under_the_registry() {
        let reg = registry();
        reg.close_channel("mapped");
        reg.close_channel("mapped");
        reg.close_channel("never_existed");
        assert!(reg.get_output_channel("mapped").is_err());
        // the consumer view still drains to end-of-input
        let inp = reg.get_input_channel("mapped").unwrap();
        assert!(inp.name() == "mapped");
    }
}
