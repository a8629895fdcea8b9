//! Output table preparation: create the declared output tables before the
//! fleet starts, and migrate existing tables by adding any missing columns.

use std::collections::HashSet;

use sqlx::{PgPool, Row};

use crate::config::model::{ContextSpec, TableSpec};
use crate::error::{PipeError, PipeResult};

/// schema-qualified table identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableIdentifier {
    pub schema: String,
    pub table: String,
}

impl std::fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.schema, self.table)
    }
}

pub fn split_table_name(name: &str) -> PipeResult<TableIdentifier> {
    let parts: Vec<&str> = name.split('.').collect();
    match parts.len() {
        1 => Ok(TableIdentifier {
            schema: "public".to_string(),
            table: parts[0].to_string(),
        }),
        2 => Ok(TableIdentifier {
            schema: parts[0].to_string(),
            table: parts[1].to_string(),
        }),
        _ => Err(PipeError::config(format!("invalid table name '{name}'"))),
    }
}

/// Substitute `value` context entries into a table name (`output_$CLIENT`).
pub fn resolve_table_name(name: &str, context: Option<&Vec<ContextSpec>>) -> String {
    if !name.contains('$') {
        return name.to_string();
    }
    let mut resolved = name.to_string();
    for entry in context.iter().flat_map(|c| c.iter()) {
        if entry.context_type == "value" {
            resolved = resolved.replace(&entry.key, &entry.expr);
        }
    }
    resolved
}

fn sql_type(rdf_type: &str, is_array: bool) -> &'static str {
    let base = match rdf_type {
        "int" | "integer" | "bool" => "integer",
        "uint" | "long" | "ulong" => "bigint",
        "double" => "double precision",
        "date" => "date",
        "datetime" => "timestamp without time zone",
        _ => "text",
    };
    if is_array {
        // arrays are only carried for text values
        return "text[]";
    }
    base
}

/// Create the table if missing, otherwise add any declared column that the
/// live table does not have yet.
pub async fn prepare_output_table(
    db: &PgPool,
    identifier: &TableIdentifier,
    spec: &TableSpec,
) -> PipeResult<()> {
    let existing: Vec<String> = sqlx::query(
        r#"SELECT column_name FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2"#,
    )
    .bind(&identifier.schema)
    .bind(&identifier.table)
    .fetch_all(db)
    .await?
    .into_iter()
    .map(|row| row.get::<String, _>(0))
    .collect();

    if existing.is_empty() {
        let columns: Vec<String> = spec
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, sql_type(&c.rdf_type, c.is_array)))
            .collect();
        let stmt = format!(
            "CREATE TABLE IF NOT EXISTS {identifier} ({})",
            columns.join(", ")
        );
        tracing::info!("creating output table {}", identifier);
        sqlx::query(&stmt).execute(db).await?;
        return Ok(());
    }

    let existing: HashSet<String> = existing.into_iter().collect();
    for column in &spec.columns {
        if !existing.contains(&column.name) {
            let stmt = format!(
                "ALTER TABLE {identifier} ADD COLUMN \"{}\" {}",
                column.name,
                sql_type(&column.rdf_type, column.is_array)
            );
            tracing::info!("migrating output table {}: adding {}", identifier, column.name);
            sqlx::query(&stmt).execute(db).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_split_and_resolve() {
        let id = split_table_name("jetsapi.output_claims").unwrap();
        assert_eq!(id.schema, "jetsapi");
        assert_eq!(id.table, "output_claims");
        assert_eq!(split_table_name("bare").unwrap().schema, "public");
        assert!(split_table_name("a.b.c").is_err());

        let context = vec![ContextSpec {
            context_type: "value".to_string(),
            key: "$CLIENT".to_string(),
            expr: "acme".to_string(),
        }];
        assert_eq!(
            resolve_table_name("output_$CLIENT", Some(&context)),
            "output_acme"
        );
    }
}
