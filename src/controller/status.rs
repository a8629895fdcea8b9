//! Execution status persistence: the `pipeline_execution_status` state
//! machine (`submitted -> running -> completed | failed`) and the
//! materialised configuration stored in `cpipes_execution_status`.

use sqlx::{PgPool, Row};

use crate::config::model::ComputePipesConfig;
use crate::error::{PipeError, PipeResult};

/// True when another execution already used this session id. The row of the
/// execution being started (same `pe_key`) does not count.
pub async fn is_session_used(db: &PgPool, session_id: &str, pe_key: i64) -> PipeResult<bool> {
    let row = sqlx::query(
        "SELECT count(*) FROM jetsapi.pipeline_execution_status WHERE session_id = $1 AND key <> $2",
    )
    .bind(session_id)
    .bind(pe_key)
    .fetch_one(db)
    .await?;
    let count: i64 = row.try_get(0)?;
    Ok(count > 0)
}

/// The configuration rows behind one execution: `pipeline_execution_status`
/// joined with `input_registry`, `source_config` and `process_config`.
#[derive(Debug, Clone, Default)]
pub struct PipelineExecInfo {
    pub client: String,
    pub org: String,
    pub object_type: String,
    pub source_period_key: i32,
    pub schema_provider_json: String,
    pub pipeline_config_key: i32,
    pub process_name: String,
    pub input_session_id: String,
    pub user_email: String,
    pub input_columns_json: String,
    pub input_columns_positions_csv: String,
    pub input_format: String,
    pub compression: String,
    pub is_part_files: bool,
    pub input_format_data_json: String,
    /// workspace file holding the compute-pipes configuration JSON
    pub main_rules: String,
}

pub async fn load_pipeline_exec_info(db: &PgPool, pe_key: i64) -> PipeResult<PipelineExecInfo> {
    let row = sqlx::query(
        r#"
        SELECT ir.client, ir.org, ir.object_type, ir.source_period_key,
            ir.schema_provider_json,
            pe.pipeline_config_key, pe.process_name, pe.input_session_id, pe.user_email,
            sc.input_columns_json, sc.input_columns_positions_csv, sc.input_format,
            sc.compression, sc.is_part_files, sc.input_format_data_json,
            pc.main_rules
        FROM
            jetsapi.pipeline_execution_status pe,
            jetsapi.input_registry ir,
            jetsapi.source_config sc,
            jetsapi.process_config pc
        WHERE pe.main_input_registry_key = ir.key
            AND pe.key = $1
            AND sc.client = ir.client
            AND sc.org = ir.org
            AND sc.object_type = ir.object_type
            AND pc.process_name = pe.process_name"#,
    )
    .bind(pe_key)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| {
        PipeError::config(format!(
            "pipeline execution {pe_key} has no configuration rows"
        ))
    })?;

    let text = |name: &str| -> PipeResult<String> {
        let v: Option<String> = row.try_get(name)?;
        Ok(v.unwrap_or_default())
    };
    let info = PipelineExecInfo {
        client: text("client")?,
        org: text("org")?,
        object_type: text("object_type")?,
        source_period_key: row.try_get::<Option<i32>, _>("source_period_key")?.unwrap_or(0),
        schema_provider_json: text("schema_provider_json")?,
        pipeline_config_key: row
            .try_get::<Option<i32>, _>("pipeline_config_key")?
            .unwrap_or(0),
        process_name: text("process_name")?,
        input_session_id: text("input_session_id")?,
        user_email: text("user_email")?,
        input_columns_json: text("input_columns_json")?,
        input_columns_positions_csv: text("input_columns_positions_csv")?,
        input_format: text("input_format")?,
        compression: text("compression")?,
        is_part_files: row.try_get::<Option<i32>, _>("is_part_files")?.unwrap_or(0) == 1,
        input_format_data_json: text("input_format_data_json")?,
        main_rules: text("main_rules")?,
    };
    if info.main_rules.is_empty() {
        return Err(PipeError::config(
            "process_config table does not name a cpipes config file in main_rules",
        ));
    }
    Ok(info)
}

pub async fn insert_cpipes_execution_status(
    db: &PgPool,
    pe_key: i64,
    session_id: &str,
    cpipes_config_json: &str,
) -> PipeResult<()> {
    sqlx::query(
        r#"INSERT INTO jetsapi.cpipes_execution_status
            (pipeline_execution_status_key, session_id, cpipes_config_json)
            VALUES ($1, $2, $3)"#,
    )
    .bind(pe_key)
    .bind(session_id)
    .bind(cpipes_config_json)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn update_cpipes_execution_status(
    db: &PgPool,
    pe_key: i64,
    cpipes_config_json: &str,
) -> PipeResult<()> {
    sqlx::query(
        r#"UPDATE jetsapi.cpipes_execution_status SET cpipes_config_json = $1
            WHERE pipeline_execution_status_key = $2"#,
    )
    .bind(cpipes_config_json)
    .bind(pe_key)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn load_cpipes_config(db: &PgPool, pe_key: i64) -> PipeResult<ComputePipesConfig> {
    let row = sqlx::query(
        r#"SELECT cpipes_config_json FROM jetsapi.cpipes_execution_status
            WHERE pipeline_execution_status_key = $1"#,
    )
    .bind(pe_key)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| {
        PipeError::config(format!(
            "no cpipes_execution_status row for execution {pe_key}"
        ))
    })?;
    let json: String = row.try_get(0)?;
    let config: ComputePipesConfig = serde_json::from_str(&json)?;
    Ok(config)
}

/// Record a status transition; `failure_details` only written for `failed`.
pub async fn update_pipeline_status(
    db: &PgPool,
    pe_key: i64,
    status: &str,
    failure_details: &str,
) -> PipeResult<()> {
    sqlx::query(
        r#"UPDATE jetsapi.pipeline_execution_status
            SET (status, failure_details, last_update) = ($1, $2, DEFAULT)
            WHERE key = $3"#,
    )
    .bind(status)
    .bind(failure_details)
    .bind(pe_key)
    .execute(db)
    .await?;
    Ok(())
}

/// The status-update argument bundles returned to the caller; the caller
/// applies one of them once the fleet completes.
pub fn status_updates(pe_key: i64, file_key: &str) -> (serde_json::Value, serde_json::Value) {
    let success = serde_json::json!({
        "-peKey": pe_key.to_string(),
        "-status": "completed",
        "cpipesMode": true,
        "file_key": file_key,
        "failureDetails": "",
    });
    let error = serde_json::json!({
        "-peKey": pe_key.to_string(),
        "-status": "failed",
        "cpipesMode": true,
        "file_key": file_key,
        "failureDetails": "",
    });
    (success, error)
}
