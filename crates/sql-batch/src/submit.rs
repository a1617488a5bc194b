use super::Operation;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// BatchSubmitter is a backend which can accept and execute one batch of
/// queued Operations, returning a ResultSet over their outcomes.
///
/// It's implemented for pooled connections, single connections, and
/// transactions alike: anything able to run a batch.
pub trait BatchSubmitter {
    type Results: ResultSet;

    /// Submit `batch` for execution. Operations must be executed in their
    /// given order, and the returned ResultSet yields one outcome per
    /// Operation in that same order.
    ///
    /// An error is returned only if the batch as a whole could not be
    /// submitted. Failures of individual Operations are instead surfaced
    /// through the ResultSet.
    fn send_batch<'s>(
        &'s mut self,
        cancel: &'s CancellationToken,
        batch: &'s [Operation],
    ) -> impl Future<Output = anyhow::Result<Self::Results>> + Send + 's;
}

/// ResultSet is produced by a single batch submission. Each of `exec`, `query`
/// and `query_row` consumes the next queued position, in submission order.
/// The ResultSet must be released through `close` once it's no longer needed.
pub trait ResultSet: Send + 'static {
    /// Completion tag of an Exec operation.
    type Tag: Send + 'static;
    /// Forward-only cursor over the rows of a Query operation.
    type Rows: Send + 'static;
    /// Single row of a QueryRow operation.
    type Row: Send + 'static;

    fn exec(&mut self) -> impl Future<Output = anyhow::Result<Self::Tag>> + Send + '_;

    fn query(&mut self) -> impl Future<Output = anyhow::Result<Self::Rows>> + Send + '_;

    /// Read the next position as a single row.
    /// An absent row is an error.
    fn query_row(&mut self) -> impl Future<Output = anyhow::Result<Self::Row>> + Send + '_;

    /// Release the ResultSet and any backend resources it holds.
    fn close(self) -> impl Future<Output = anyhow::Result<()>> + Send;
}
