//! Static insert/update statements for the control tables fed by the API
//! layer. The statement text and the order of `column_keys` are a wire
//! contract: callers submit JSON objects whose values are bound in exactly
//! this positional order.

use std::collections::HashMap;
use std::sync::OnceLock;

use sqlx::PgPool;

use crate::error::{PipeError, PipeResult};

pub struct SqlInsertDefinition {
    pub stmt: &'static str,
    pub column_keys: &'static [&'static str],
}

static SQL_INSERT_STMTS: OnceLock<HashMap<&'static str, SqlInsertDefinition>> = OnceLock::new();

fn registry() -> &'static HashMap<&'static str, SqlInsertDefinition> {
    SQL_INSERT_STMTS.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert(
            "client_registry",
            SqlInsertDefinition {
                stmt: "INSERT INTO jetsapi.client_registry (client, details) VALUES ($1, $2)",
                column_keys: &["client", "details"],
            },
        );
        m.insert(
            "object_type_registry",
            SqlInsertDefinition {
                stmt: "INSERT INTO jetsapi.object_type_registry (object_type, details) VALUES ($1, $2)",
                column_keys: &["object_type", "details"],
            },
        );
        m.insert(
            "source_config",
            SqlInsertDefinition {
                stmt: "INSERT INTO jetsapi.source_config \
                    (object_type, client, table_name, grouping_column, user_email) \
                    VALUES ($1, $2, $3, $4, $5)",
                column_keys: &["object_type", "client", "table_name", "grouping_column", "user_email"],
            },
        );
        m.insert(
            "input_loader_status",
            SqlInsertDefinition {
                stmt: "INSERT INTO jetsapi.input_loader_status \
                    (object_type, client, table_name, file_key, session_id, status, user_email) \
                    VALUES ($1, $2, $3, $4, $5, $6, $7)",
                column_keys: &[
                    "object_type", "client", "table_name", "file_key", "session_id", "status",
                    "user_email",
                ],
            },
        );
        m.insert(
            "process_input",
            SqlInsertDefinition {
                stmt: "INSERT INTO jetsapi.process_input \
                    (client, object_type, table_name, source_type, entity_rdf_type, grouping_column, user_email) \
                    VALUES ($1, $2, $3, $4, $5, $6, $7)",
                column_keys: &[
                    "client", "object_type", "table_name", "source_type", "entity_rdf_type",
                    "grouping_column", "user_email",
                ],
            },
        );
        m.insert(
            "update/process_input",
            SqlInsertDefinition {
                stmt: "UPDATE jetsapi.process_input SET (status, user_email, last_update) = \
                    ($1, $2, DEFAULT) WHERE key = $3",
                column_keys: &["status", "user_email", "key"],
            },
        );
        m.insert(
            "delete/process_mapping",
            SqlInsertDefinition {
                stmt: "DELETE FROM jetsapi.process_mapping WHERE table_name = $1",
                column_keys: &["table_name"],
            },
        );
        m.insert(
            "process_mapping",
            SqlInsertDefinition {
                stmt: "INSERT INTO jetsapi.process_mapping \
                    (table_name, input_column, data_property, function_name, argument, default_value, error_message, user_email) \
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                column_keys: &[
                    "table_name", "input_column", "data_property", "function_name", "argument",
                    "default_value", "error_message", "user_email",
                ],
            },
        );
        m.insert(
            "delete/rule_config",
            SqlInsertDefinition {
                stmt: "DELETE FROM jetsapi.rule_config \
                    WHERE (process_config_key, process_name, client) = ($1, $2, $3)",
                column_keys: &["process_config_key", "process_name", "client"],
            },
        );
        m.insert(
            "rule_config",
            SqlInsertDefinition {
                stmt: "INSERT INTO jetsapi.rule_config \
                    (process_config_key, process_name, client, subject, predicate, object, rdf_type) \
                    VALUES ($1, $2, $3, $4, $5, $6, $7)",
                column_keys: &[
                    "process_config_key", "process_name", "client", "subject", "predicate",
                    "object", "rdf_type",
                ],
            },
        );
        m.insert(
            "update/pipeline_config",
            SqlInsertDefinition {
                stmt: "UPDATE jetsapi.pipeline_config SET \
                    (process_name, client, process_config_key, main_process_input_key, merged_process_input_keys, main_table_name, description, user_email, last_update) = \
                    ($1, $2, $3, $4, $5, $6, $7, $8, DEFAULT) WHERE key = $9",
                column_keys: &[
                    "process_name", "client", "process_config_key", "main_process_input_key",
                    "merged_process_input_keys", "main_table_name", "description", "user_email",
                    "key",
                ],
            },
        );
        m.insert(
            "pipeline_config",
            SqlInsertDefinition {
                stmt: "INSERT INTO jetsapi.pipeline_config \
                    (process_name, client, process_config_key, main_process_input_key, merged_process_input_keys, main_table_name, description, user_email) \
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                column_keys: &[
                    "process_name", "client", "process_config_key", "main_process_input_key",
                    "merged_process_input_keys", "main_table_name", "description", "user_email",
                ],
            },
        );
        m
    })
}

pub fn insert_definition(name: &str) -> PipeResult<&'static SqlInsertDefinition> {
    registry()
        .get(name)
        .ok_or_else(|| PipeError::config(format!("no sql statement registered under '{name}'")))
}

/// Execute a registered statement, binding the JSON object's values in the
/// registered column-key order. Missing keys bind as NULL.
pub async fn exec_stmt(
    db: &PgPool,
    name: &str,
    values: &serde_json::Map<String, serde_json::Value>,
) -> PipeResult<()> {
    let def = insert_definition(name)?;
    let mut query = sqlx::query(def.stmt);
    for key in def.column_keys {
        let bound: Option<String> = values.get(*key).and_then(|v| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });
        query = query.bind(bound);
    }
    query.execute(db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_keys_match_statement_placeholders() {
        for (name, def) in registry() {
            let placeholders = (1..=def.column_keys.len())
                .map(|i| format!("${i}"))
                .collect::<Vec<_>>();
            for p in &placeholders {
                assert!(
                    def.stmt.contains(p.as_str()),
                    "statement '{name}' is missing placeholder {p}"
                );
            }
            // no extra placeholder beyond the declared keys
            let extra = format!("${}", def.column_keys.len() + 1);
            assert!(!def.stmt.contains(&extra), "statement '{name}' binds {extra}");
        }
    }

    #[test]
    fn contract_order_is_stable() {
        let def = insert_definition("process_mapping").unwrap();
        assert_eq!(
            def.column_keys,
            &[
                "table_name",
                "input_column",
                "data_property",
                "function_name",
                "argument",
                "default_value",
                "error_message",
                "user_email"
            ]
        );
        assert!(insert_definition("not_registered").is_err());
    }
}
