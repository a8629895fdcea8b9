//! `merge_files`: concatenate the stage part files of the input channel's
//! step into a single output object. CSV headers are kept from the first
//! part only.

use crate::config::model::PipeSpec;
use crate::core::builder::BuilderContext;
use crate::core::results::{ComputePipesResult, ResultSender};
use crate::error::{PipeError, PipeResult};
use crate::io::Compression;
use crate::s3::store;

pub async fn start_merge_files_pipe(ctx: BuilderContext, spec: PipeSpec, result_tx: ResultSender) {
    let label = format!("merge_files:{}", spec.input_channel.name);
    match run(&ctx, &spec).await {
        Ok(parts) => {
            let _ = result_tx.send_async(ComputePipesResult::ok(label, parts)).await;
        }
        Err(e) => {
            tracing::error!("{label}: {e}");
            let _ = result_tx
                .send_async(ComputePipesResult::error(label, &e))
                .await;
            let _ = ctx.err_tx.send(e);
            ctx.cancel.cancel();
        }
    }
    drop(result_tx);
}

async fn run(ctx: &BuilderContext, spec: &PipeSpec) -> PipeResult<i64> {
    let output_key = spec
        .output_file
        .as_ref()
        .ok_or_else(|| PipeError::config("merge_files pipe requires output_file"))?;
    let file_spec = ctx
        .cp_config
        .output_files
        .iter()
        .find(|f| &f.key == output_key)
        .ok_or_else(|| {
            PipeError::config(format!(
                "merge_files: output_file '{output_key}' is not declared in output_files"
            ))
        })?;

    let read_step = if spec.input_channel.read_step_id.is_empty() {
        ctx.read_step_id.clone()
    } else {
        spec.input_channel.read_step_id.clone()
    };
    let prefix = format!(
        "{}/{}/{}/{}",
        ctx.env.s3_stage_prefix, ctx.session_id, read_step, ctx.jets_partition
    );
    let compression = Compression::parse(&spec.input_channel.compression)?;
    let keys = store::list_file_keys(&ctx.store, &prefix).await?;
    if keys.is_empty() {
        return Err(PipeError::system(format!(
            "merge_files: no stage parts under '{prefix}'"
        )));
    }

    let skip_headers = spec.input_channel.format == "csv";
    let mut merged: Vec<u8> = Vec::new();
    if !file_spec.headers.is_empty() {
        merged.extend_from_slice(file_spec.headers.join(",").as_bytes());
        merged.push(b'\n');
    }
    for (i, key) in keys.iter().enumerate() {
        let bytes = store::fetch_object(&ctx.store, &key.key).await?;
        let bytes = compression.decode(bytes)?;
        let content = if skip_headers && (i > 0 || !file_spec.headers.is_empty()) {
            match bytes.iter().position(|b| *b == b'\n') {
                Some(pos) => bytes[pos + 1..].to_vec(),
                None => Vec::new(),
            }
        } else {
            bytes
        };
        merged.extend_from_slice(&content);
    }

    let name = ctx.substitute_context(&file_spec.name);
    let out_key = format!("{}/{}", ctx.env.s3_output_prefix, name);
    store::put_bytes(&ctx.store, &out_key, merged).await?;
    Ok(keys.len() as i64)
}
