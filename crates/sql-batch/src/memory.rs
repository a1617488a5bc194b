//! In-process backend, which answers queued Operations using a handler
//! function. It records each submitted batch and each release of results,
//! which makes it well suited for tests of participant logic.

use super::{BatchSubmitter, Operation, ResultSet, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A row is a vector of column Values.
pub type Row = Vec<Value>;

/// Answer of the handler to a single Operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Answer {
    /// Number of rows affected, returned as the completion tag of an Exec.
    pub affected: u64,
    /// Rows returned by the Operation.
    pub rows: Vec<Row>,
}

impl Answer {
    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            rows: Vec::new(),
        }
    }

    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            affected: rows.len() as u64,
            rows,
        }
    }
}

/// Log of the submissions and releases of a Backend.
#[derive(Debug, Clone, Default)]
pub struct Log(Arc<Mutex<LogInner>>);

#[derive(Debug, Default)]
struct LogInner {
    batches: Vec<Vec<Operation>>,
    closed: usize,
}

impl Log {
    /// Batches which have been submitted, in submission order.
    pub fn batches(&self) -> Vec<Vec<Operation>> {
        self.0.lock().map(|log| log.batches.clone()).unwrap_or_default()
    }
    /// Number of times that a ResultSet has been released.
    pub fn closed(&self) -> usize {
        self.0.lock().map(|log| log.closed).unwrap_or_default()
    }
}

/// Backend is a BatchSubmitter which applies its handler to each queued
/// Operation, in order, at the time the batch is submitted.
pub struct Backend<F> {
    handler: F,
    log: Log,
    fail_submit: Option<String>,
    fail_close: Option<String>,
}

impl<F> Backend<F>
where
    F: FnMut(&Operation) -> anyhow::Result<Answer> + Send,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            log: Log::default(),
            fail_submit: None,
            fail_close: None,
        }
    }

    /// Fail every submission with the given error message.
    pub fn fail_submit(mut self, message: impl Into<String>) -> Self {
        self.fail_submit = Some(message.into());
        self
    }

    /// Fail every release of results with the given error message.
    /// The release is still recorded in the Log.
    pub fn fail_close(mut self, message: impl Into<String>) -> Self {
        self.fail_close = Some(message.into());
        self
    }

    pub fn log(&self) -> Log {
        self.log.clone()
    }
}

impl<F> BatchSubmitter for Backend<F>
where
    F: FnMut(&Operation) -> anyhow::Result<Answer> + Send,
{
    type Results = Results;

    async fn send_batch<'s>(
        &'s mut self,
        cancel: &'s CancellationToken,
        batch: &'s [Operation],
    ) -> anyhow::Result<Results> {
        if cancel.is_cancelled() {
            anyhow::bail!("batch submission cancelled");
        }
        if let Some(message) = &self.fail_submit {
            anyhow::bail!("{message}");
        }

        let answers = batch.iter().map(|op| (self.handler)(op)).collect();

        if let Ok(mut log) = self.log.0.lock() {
            log.batches.push(batch.to_vec());
        }
        Ok(Results {
            answers,
            log: self.log.clone(),
            fail_close: self.fail_close.clone(),
        })
    }
}

/// Results of a Backend batch submission.
pub struct Results {
    answers: VecDeque<anyhow::Result<Answer>>,
    log: Log,
    fail_close: Option<String>,
}

impl Results {
    fn next(&mut self) -> anyhow::Result<Answer> {
        match self.answers.pop_front() {
            Some(answer) => answer,
            None => anyhow::bail!("all results of the batch have been read"),
        }
    }
}

impl ResultSet for Results {
    type Tag = u64;
    type Rows = Rows;
    type Row = Row;

    async fn exec(&mut self) -> anyhow::Result<u64> {
        Ok(self.next()?.affected)
    }

    async fn query(&mut self) -> anyhow::Result<Rows> {
        Ok(Rows(self.next()?.rows.into_iter()))
    }

    async fn query_row(&mut self) -> anyhow::Result<Row> {
        match self.next()?.rows.into_iter().next() {
            Some(row) => Ok(row),
            None => anyhow::bail!("no rows in result set"),
        }
    }

    async fn close(self) -> anyhow::Result<()> {
        if let Ok(mut log) = self.log.0.lock() {
            log.closed += 1;
        }
        match self.fail_close {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(()),
        }
    }
}

/// Forward-only cursor over the rows of a query.
#[derive(Debug)]
pub struct Rows(std::vec::IntoIter<Row>);

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.0.next()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{params, Kind};

    #[tokio::test]
    async fn test_results_are_read_in_order() {
        let mut backend = Backend::new(|op: &Operation| match op.kind() {
            Kind::Exec => Ok(Answer::affected(3)),
            Kind::Query => Ok(Answer::rows(vec![vec![Value::Int(1)], vec![Value::Int(2)]])),
            Kind::QueryRow => Ok(Answer::default()),
        });
        let log = backend.log();

        let batch = vec![
            Operation::new(Kind::Exec, "a", params![]),
            Operation::new(Kind::Query, "b", params![]),
            Operation::new(Kind::QueryRow, "c", params![]),
        ];
        let mut results = backend
            .send_batch(&CancellationToken::new(), &batch)
            .await
            .unwrap();

        assert_eq!(results.exec().await.unwrap(), 3);
        assert_eq!(
            results.query().await.unwrap().collect::<Vec<_>>(),
            vec![vec![Value::Int(1)], vec![Value::Int(2)]]
        );
        assert_eq!(
            results.query_row().await.unwrap_err().to_string(),
            "no rows in result set"
        );
        assert_eq!(
            results.exec().await.unwrap_err().to_string(),
            "all results of the batch have been read"
        );
        results.close().await.unwrap();

        assert_eq!(log.batches(), vec![batch]);
        assert_eq!(log.closed(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_submission() {
        let mut backend = Backend::new(|_: &Operation| Ok(Answer::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = vec![Operation::new(Kind::Exec, "a", params![])];
        let err = backend.send_batch(&cancel, &batch).await.err().unwrap();

        assert_eq!(err.to_string(), "batch submission cancelled");
        assert!(backend.log().batches().is_empty());
    }

    #[tokio::test]
    async fn test_failed_release_is_recorded() {
        let mut backend =
            Backend::new(|_: &Operation| Ok(Answer::default())).fail_close("connection closed");
        let log = backend.log();

        let batch = vec![Operation::new(Kind::Exec, "a", params![])];
        let results = backend
            .send_batch(&CancellationToken::new(), &batch)
            .await
            .unwrap();

        let err = results.close().await.unwrap_err();
        assert_eq!(err.to_string(), "connection closed");
        assert_eq!(log.closed(), 1);
    }
}
