//! Postgres backend, built on sqlx.
//!
//! BatchSubmitter is implemented for a `PgPool`, a `PgConnection`, and a
//! `Transaction` alike. Queued operations of a batch are executed in order
//! over a single connection, and each one's outcome is held for delivery
//! back to its participant.
//!
//! Operations are not wrapped in a transaction of their own. Submitted to a
//! `PgPool` or a bare `PgConnection`, each operation autocommits separately,
//! and a failed operation doesn't roll back those before it. Submit to a
//! `Transaction` where the batch must apply atomically.

use super::{BatchSubmitter, Kind, Operation, ResultSet, Type, Value};
use sqlx::postgres::{PgArguments, PgConnection, PgQueryResult, PgRow};
use sqlx::{Postgres, Transaction};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// Results of a batch executed against Postgres.
pub struct PgResults {
    outcomes: VecDeque<Outcome>,
}

enum Outcome {
    Exec(sqlx::Result<PgQueryResult>),
    Query(sqlx::Result<Vec<PgRow>>),
    QueryRow(sqlx::Result<Option<PgRow>>),
}

/// Forward-only cursor over the rows of a query.
pub struct PgRows(std::vec::IntoIter<PgRow>);

impl Iterator for PgRows {
    type Item = PgRow;

    fn next(&mut self) -> Option<PgRow> {
        self.0.next()
    }
}

impl BatchSubmitter for sqlx::PgPool {
    type Results = PgResults;

    async fn send_batch<'s>(
        &'s mut self,
        cancel: &'s CancellationToken,
        batch: &'s [Operation],
    ) -> anyhow::Result<PgResults> {
        let mut conn = tokio::select! {
            () = cancel.cancelled() => anyhow::bail!("batch submission cancelled"),
            conn = self.acquire() => conn?,
        };
        send_on(&mut conn, cancel, batch).await
    }
}

impl BatchSubmitter for PgConnection {
    type Results = PgResults;

    async fn send_batch<'s>(
        &'s mut self,
        cancel: &'s CancellationToken,
        batch: &'s [Operation],
    ) -> anyhow::Result<PgResults> {
        send_on(self, cancel, batch).await
    }
}

impl<'c> BatchSubmitter for Transaction<'c, Postgres> {
    type Results = PgResults;

    async fn send_batch<'s>(
        &'s mut self,
        cancel: &'s CancellationToken,
        batch: &'s [Operation],
    ) -> anyhow::Result<PgResults> {
        send_on(&mut **self, cancel, batch).await
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(operations = batch.len()))]
async fn send_on(
    conn: &mut PgConnection,
    cancel: &CancellationToken,
    batch: &[Operation],
) -> anyhow::Result<PgResults> {
    let execute = async {
        let mut outcomes = VecDeque::with_capacity(batch.len());

        for op in batch {
            let query = op
                .params()
                .iter()
                .fold(sqlx::query(op.statement()), bind);

            let outcome = match op.kind() {
                Kind::Exec => Outcome::Exec(query.execute(&mut *conn).await),
                Kind::Query => Outcome::Query(query.fetch_all(&mut *conn).await),
                Kind::QueryRow => Outcome::QueryRow(query.fetch_optional(&mut *conn).await),
            };
            outcomes.push_back(outcome);
        }
        outcomes
    };

    tokio::select! {
        () = cancel.cancelled() => anyhow::bail!("batch submission cancelled"),
        outcomes = execute => Ok(PgResults { outcomes }),
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn bind<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null(Type::Bool) => query.bind(None::<bool>),
        Value::Null(Type::Int) => query.bind(None::<i64>),
        Value::Null(Type::Float) => query.bind(None::<f64>),
        Value::Null(Type::Text) => query.bind(None::<String>),
        Value::Null(Type::Bytes) => query.bind(None::<Vec<u8>>),
        Value::Null(Type::Json) => query.bind(None::<serde_json::Value>),
        Value::Null(Type::Timestamp) => query.bind(None::<chrono::DateTime<chrono::Utc>>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
        Value::Json(v) => query.bind(v.clone()),
        Value::Timestamp(v) => query.bind(*v),
    }
}

impl PgResults {
    fn next(&mut self) -> anyhow::Result<Outcome> {
        self.outcomes
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("all results of the batch have been read"))
    }
}

impl ResultSet for PgResults {
    type Tag = PgQueryResult;
    type Rows = PgRows;
    type Row = PgRow;

    async fn exec(&mut self) -> anyhow::Result<PgQueryResult> {
        match self.next()? {
            Outcome::Exec(result) => Ok(result?),
            _ => anyhow::bail!("queued operation was not an exec"),
        }
    }

    async fn query(&mut self) -> anyhow::Result<PgRows> {
        match self.next()? {
            Outcome::Query(result) => Ok(PgRows(result?.into_iter())),
            _ => anyhow::bail!("queued operation was not a query"),
        }
    }

    async fn query_row(&mut self) -> anyhow::Result<PgRow> {
        match self.next()? {
            Outcome::QueryRow(result) => Ok(result?.ok_or(sqlx::Error::RowNotFound)?),
            _ => anyhow::bail!("queued operation was not a single-row query"),
        }
    }

    async fn close(self) -> anyhow::Result<()> {
        // Outcomes were fully read at submission, and the connection has
        // already been returned. Unread outcomes are simply discarded.
        if !self.outcomes.is_empty() {
            tracing::debug!(unread = self.outcomes.len(), "closing results with unread outcomes");
        }
        Ok(())
    }
}
