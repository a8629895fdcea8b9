//! Pipe executors: the composers that drive rows from a source channel
//! through the operators. One executor task per `PipeSpec`; panics inside
//! an executor are caught at its boundary and become node errors.

pub mod fan_out;
pub mod merge_files;
pub mod splitter;

use std::collections::BTreeSet;

use futures::FutureExt;

use crate::config::model::PipeSpec;
use crate::core::builder::BuilderContext;
use crate::error::PipeError;

/// Run an executor body, converting a panic into an error, publishing the
/// first error, and closing this pipe's distinct output channels exactly
/// once. Shared by fan_out and splitter.
pub(crate) async fn guard_pipe<F>(ctx: &BuilderContext, spec: &PipeSpec, body: F)
where
    F: std::future::Future<Output = Result<(), PipeError>> + Send,
{
    let outcome = std::panic::AssertUnwindSafe(body).catch_unwind().await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(PipeError::Interrupted)) => None, // a sibling already failed
        Ok(Err(e)) => Some(e),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Some(PipeError::system(format!(
                "{} pipe on '{}' panicked: {msg}",
                spec.pipe_type, spec.input_channel.name
            )))
        }
    };
    if let Some(e) = error {
        tracing::error!("{}", e);
        let _ = ctx.err_tx.send(e);
        // idempotent: the first fatal error stops the node
        ctx.cancel.cancel();
    }
    let outputs: BTreeSet<&str> = spec
        .apply
        .iter()
        .map(|t| t.output_channel.name.as_str())
        .collect();
    for name in outputs {
        ctx.registry.close_channel(name);
    }
}
