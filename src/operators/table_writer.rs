//! Table writer: drains an output channel of type `sql` and batch-inserts
//! its rows into the declared output table. One writer task per sql channel,
//! spawned by the graph builder.

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::model::TableSpec;
use crate::core::channel::InputChannel;
use crate::core::results::{ComputePipesResult, ResultSender};
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};

const INSERT_BATCH_SIZE: usize = 500;

pub struct TableWriter {
    db: PgPool,
    table: TableSpec,
    source: InputChannel,
    cancel: CancellationToken,
}

impl TableWriter {
    pub fn new(db: PgPool, table: TableSpec, source: InputChannel, cancel: CancellationToken) -> Self {
        Self {
            db,
            table,
            source,
            cancel,
        }
    }

    /// Drain the channel until end of input, inserting in batches. Reports
    /// one result carrying the number of rows inserted.
    pub async fn run(self, result_tx: ResultSender) {
        let label = format!("table:{}", self.table.name);
        let outcome = self.copy_rows().await;
        let result = match outcome {
            Ok(count) => ComputePipesResult::ok(label, count),
            Err(e) => {
                self.cancel.cancel();
                ComputePipesResult::error(label, &e)
            }
        };
        let _ = result_tx.send_async(result).await;
    }

    async fn copy_rows(&self) -> PipeResult<i64> {
        let mut batch: Vec<Row> = Vec::with_capacity(INSERT_BATCH_SIZE);
        let mut inserted = 0i64;
        loop {
            let row = tokio::select! {
                _ = self.cancel.cancelled() => return Err(PipeError::Interrupted),
                row = self.source.recv() => row,
            };
            match row {
                Some(row) => {
                    batch.push(row);
                    if batch.len() >= INSERT_BATCH_SIZE {
                        inserted += self.insert_batch(&batch).await?;
                        batch.clear();
                    }
                }
                None => {
                    if !batch.is_empty() {
                        inserted += self.insert_batch(&batch).await?;
                    }
                    return Ok(inserted);
                }
            }
        }
    }

    async fn insert_batch(&self, batch: &[Row]) -> PipeResult<i64> {
        let columns: Vec<&str> = self
            .table
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let mut builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            self.table.name,
            columns
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        builder.push_values(batch.iter(), |mut b, row| {
            for i in 0..columns.len() {
                match row.get(i) {
                    Some(Value::Null) | None => b.push_bind(Option::<String>::None),
                    Some(v) => b.push_bind(Some(v.render())),
                };
            }
        });
        builder.build().execute(&self.db).await?;
        Ok(batch.len() as i64)
    }
}
