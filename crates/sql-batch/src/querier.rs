use super::{Cause, Error, Kind, Operation, ResultSet, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Call is sent by a suspended participant to the orchestrator.
/// It's the participant's queued Operation, and the channel over which
/// the participant's result is to be delivered.
pub(crate) struct Call<R: ResultSet> {
    pub operation: Operation,
    pub reply: Reply<R>,
}

/// Reply is the typed resumption channel of a suspended participant.
pub(crate) enum Reply<R: ResultSet> {
    Exec(oneshot::Sender<Result<R::Tag, Error>>),
    Query(oneshot::Sender<Result<R::Rows, Error>>),
    QueryRow(oneshot::Sender<Result<R::Row, Error>>),
}

impl<R: ResultSet> Reply<R> {
    /// Read the next position of `results` and deliver it to the participant.
    /// A participant which has since gone away is not an error.
    pub async fn deliver(self, results: &mut R) {
        match self {
            Reply::Exec(tx) => {
                let _ = tx.send(results.exec().await.map_err(Error::Backend));
            }
            Reply::Query(tx) => {
                let _ = tx.send(results.query().await.map_err(Error::Backend));
            }
            Reply::QueryRow(tx) => {
                let _ = tx.send(results.query_row().await.map_err(Error::Backend));
            }
        }
    }
}

/// Querier is the sole channel through which a participant's logic reaches
/// the backend. Each participant may issue exactly one call per round:
/// every operation consumes the Querier, so a second call doesn't compile.
///
/// ```compile_fail
/// # use sql_batch::{params, memory, Batch};
/// let mut batch = Batch::<memory::Results>::new();
/// batch.register(|q| async move {
///     q.exec("DELETE FROM people", params![]).await?;
///     q.exec("DELETE FROM pets", params![]).await?; // Error: use of moved value.
///     Ok(())
/// });
/// ```
///
/// A participant which drops its Querier without a call contributes no
/// operation to the batch.
pub struct Querier<R: ResultSet> {
    pause: oneshot::Sender<Call<R>>,
    caller: CancellationToken,
    round: CancellationToken,
}

impl<R: ResultSet> Querier<R> {
    pub(crate) fn new(
        pause: oneshot::Sender<Call<R>>,
        caller: CancellationToken,
        round: CancellationToken,
    ) -> Self {
        Self {
            pause,
            caller,
            round,
        }
    }

    /// Execute a statement which returns no rows.
    pub async fn exec(
        self,
        statement: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<R::Tag, Error> {
        let (tx, rx) = oneshot::channel();
        let op = Operation::new(Kind::Exec, statement, params);
        self.suspend(op, Reply::Exec(tx), rx).await
    }

    /// Query for any number of rows, returned as a forward-only cursor.
    pub async fn query(
        self,
        statement: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<R::Rows, Error> {
        let (tx, rx) = oneshot::channel();
        let op = Operation::new(Kind::Query, statement, params);
        self.suspend(op, Reply::Query(tx), rx).await
    }

    /// Query for a single row. Failures, including cancellation, are
    /// deferred until the returned QueryRow is scanned.
    pub async fn query_row(self, statement: impl Into<String>, params: Vec<Value>) -> QueryRow<R::Row> {
        let (tx, rx) = oneshot::channel();
        let op = Operation::new(Kind::QueryRow, statement, params);
        QueryRow(self.suspend(op, Reply::QueryRow(tx), rx).await)
    }

    // Hand `operation` to the orchestrator and wait to be resumed with its result.
    async fn suspend<T>(
        self,
        operation: Operation,
        reply: Reply<R>,
        resume: oneshot::Receiver<Result<T, Error>>,
    ) -> Result<T, Error> {
        let Self {
            pause,
            caller,
            round,
        } = self;

        if round.is_cancelled() {
            return Err(cancelled(&caller));
        }
        tracing::trace!(?operation, "participant suspending");

        if pause.send(Call { operation, reply }).is_err() {
            return Err(cancelled(&caller));
        }

        // A delivered result is taken even if the round was also cancelled.
        tokio::select! {
            biased;
            result = resume => match result {
                Ok(result) => result,
                Err(_) => Err(cancelled(&caller)),
            },
            () = round.cancelled() => Err(cancelled(&caller)),
        }
    }
}

pub(crate) fn cancelled(caller: &CancellationToken) -> Error {
    if caller.is_cancelled() {
        Error::Cancelled(Cause::Cancelled)
    } else {
        Error::Cancelled(Cause::Abandoned)
    }
}

/// QueryRow is the result of a single-row query.
/// Any failure of the query is surfaced when the row is scanned.
#[derive(Debug)]
pub struct QueryRow<Row>(Result<Row, Error>);

impl<Row> QueryRow<Row> {
    /// Read fields of the row using `read`.
    /// If the query failed or was cancelled, that failure is returned instead.
    pub fn scan<V, E>(self, read: impl FnOnce(&Row) -> Result<V, E>) -> Result<V, Error>
    where
        E: Into<anyhow::Error>,
    {
        let row = self.0?;
        read(&row).map_err(|err| Error::Scan(err.into()))
    }

    pub fn into_result(self) -> Result<Row, Error> {
        self.0
    }
}
