//! Deployment environment for a node or controller, read once at startup.

use crate::error::{PipeError, PipeResult};

#[derive(Debug, Clone)]
pub struct JetsEnv {
    pub workspaces_home: String,
    pub workspace: String,
    pub bucket: String,
    pub region: String,
    pub dsn_secret: String,
    pub s3_input_prefix: String,
    pub s3_output_prefix: String,
    pub s3_stage_prefix: String,
    pub nbr_shards: usize,
    pub workspace_db_path: String,
    pub schema_file: Option<String>,
    pub dev_mode: bool,
    pub using_ssh_tunnel: bool,
    pub task_max_concurrency: Option<i32>,
}

fn required(name: &str) -> PipeResult<String> {
    std::env::var(name)
        .map_err(|_| PipeError::config(format!("env var {name} must be provided")))
}

impl JetsEnv {
    pub fn from_env() -> PipeResult<Self> {
        let nbr_shards = required("NBR_SHARDS")?
            .parse()
            .map_err(|_| PipeError::config("env NBR_SHARDS is not a valid integer"))?;
        Ok(Self {
            workspaces_home: required("WORKSPACES_HOME")?,
            workspace: required("WORKSPACE")?,
            bucket: required("JETS_BUCKET")?,
            region: required("JETS_REGION")?,
            dsn_secret: required("JETS_DSN_SECRET")?,
            s3_input_prefix: required("JETS_s3_INPUT_PREFIX")?,
            s3_output_prefix: required("JETS_s3_OUTPUT_PREFIX")?,
            s3_stage_prefix: required("JETS_s3_STAGE_PREFIX")?,
            nbr_shards,
            workspace_db_path: required("WORKSPACE_DB_PATH")?,
            schema_file: std::env::var("JETS_SCHEMA_FILE").ok(),
            dev_mode: std::env::var("JETSTORE_DEV_MODE").is_ok(),
            using_ssh_tunnel: std::env::var("USING_SSH_TUNNEL").is_ok(),
            task_max_concurrency: std::env::var("TASK_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok()),
        })
    }

    /// Path of the compute-pipes config file inside the active workspace.
    pub fn workspace_file(&self, name: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.workspaces_home)
            .join(&self.workspace)
            .join(name)
    }
}
