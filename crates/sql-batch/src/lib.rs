//! sql-batch lets independent pieces of logic each issue an ordinary-looking
//! backend call, while the calls of all participants are actually collected
//! into a single batch which is submitted once.
//!
//! Each participant's logic is registered with a [`Batch`] and runs as its
//! own task. Its only channel to the backend is a [`Querier`], which suspends
//! the participant until the batch has been submitted and the participant's
//! result has been delivered back to it, in registration order.
//!
//! ```no_run
//! # async fn example(pool: &mut sqlx::PgPool) -> anyhow::Result<()> {
//! use sql_batch::{params, postgres::PgResults, Batch};
//! use sqlx::Row;
//!
//! let mut batch = Batch::<PgResults>::new();
//!
//! batch.register(|q| async move {
//!     q.exec("DELETE FROM people", params![]).await?;
//!     Ok(())
//! });
//! batch.register(|q| async move {
//!     let id: i64 = q
//!         .query_row("INSERT INTO people (name) VALUES ($1) RETURNING id", params!["Joe"])
//!         .await
//!         .scan(|row| row.try_get("id"))?;
//!     tracing::info!(id, "inserted Joe");
//!     Ok(())
//! });
//!
//! batch.run(&tokio_util::sync::CancellationToken::new(), pool).await
//! # }
//! ```

mod batch;
pub use batch::Batch;

mod operation;
pub use operation::{Kind, Operation, Type, Typed, Value};

mod querier;
pub use querier::{QueryRow, Querier};

mod submit;
pub use submit::{BatchSubmitter, ResultSet};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("batch round cancelled: {0}")]
    Cancelled(Cause),
    #[error("queued operation failed")]
    Backend(#[source] anyhow::Error),
    #[error("failed to read field of row")]
    Scan(#[source] anyhow::Error),
    #[error("failed to submit batch")]
    Submit(#[source] anyhow::Error),
    #[error("failed to release batch results")]
    Release(#[source] anyhow::Error),
    #[error("participant {index} panicked")]
    Panicked {
        index: usize,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Cause of a cancelled round.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cause {
    /// The caller's CancellationToken was cancelled.
    Cancelled,
    /// The round ended, due to the failure of another participant,
    /// before this call could be resumed.
    Abandoned,
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match *self {
            Cause::Cancelled => "cancelled by caller",
            Cause::Abandoned => "round ended before the call was resumed",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Cause of this Error, if it's a cancellation.
    pub fn cancelled(&self) -> Option<Cause> {
        match self {
            Error::Cancelled(cause) => Some(*cause),
            _ => None,
        }
    }
}
