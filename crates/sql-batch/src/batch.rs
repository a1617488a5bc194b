use super::querier::{cancelled, Call, Querier, Reply};
use super::{BatchSubmitter, Error, Operation, ResultSet};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};

type Logic<R> = Box<dyn FnOnce(Querier<R>) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Batch is a round of participants, each of which issues (at most) one
/// backend call through its Querier. Their calls are collected into a single
/// batch which is submitted once, and results are then delivered back to
/// participants in registration order.
///
/// A Batch is consumed by `run`, and cannot be reused.
pub struct Batch<R: ResultSet> {
    logics: Vec<Logic<R>>,
}

impl<R: ResultSet> Default for Batch<R> {
    fn default() -> Self {
        Self { logics: Vec::new() }
    }
}

impl<R: ResultSet> Batch<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register participant `logic`. The order of registration is the order
    /// in which calls are queued into the batch, and the order in which
    /// their results are delivered.
    pub fn register<F, Fut>(&mut self, logic: F) -> &mut Self
    where
        F: FnOnce(Querier<R>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.logics.push(Box::new(move |querier| logic(querier).boxed()));
        self
    }

    pub fn len(&self) -> usize {
        self.logics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logics.is_empty()
    }

    /// Run one round of the Batch using `submitter`.
    ///
    /// Returns the first failure of a participant, walked in registration
    /// order, or a failure to submit or release the batch. If no participant
    /// issues a call, nothing is submitted.
    ///
    /// All participant tasks have exited by the time `run` returns.
    #[tracing::instrument(
        level = "debug",
        err(level = "debug"),
        skip_all,
        fields(participants = self.len())
    )]
    pub async fn run<S>(self, cancel: &CancellationToken, submitter: &mut S) -> anyhow::Result<()>
    where
        S: BatchSubmitter<Results = R>,
    {
        let round = cancel.child_token();
        // If we're dropped, participants blocked on the round are released, and
        // dropped Tasks abort participants still running ahead of their call.
        let _drop_guard = round.clone().drop_guard();

        let mut tasks: Vec<Task<R>> = self
            .logics
            .into_iter()
            .enumerate()
            .map(|(index, logic)| Task::spawn(index, logic, cancel, &round))
            .collect();

        let outcome = drive(&mut tasks, &round, cancel, submitter).await;

        round.cancel();
        for task in tasks {
            task.shutdown().await;
        }
        outcome
    }
}

async fn drive<R, S>(
    tasks: &mut [Task<R>],
    round: &CancellationToken,
    cancel: &CancellationToken,
    submitter: &mut S,
) -> anyhow::Result<()>
where
    R: ResultSet,
    S: BatchSubmitter<Results = R>,
{
    let mut batch: Vec<Operation> = Vec::with_capacity(tasks.len());
    let mut handlers: Vec<(usize, Reply<R>)> = Vec::with_capacity(tasks.len());

    // Collect one Call from each participant, strictly in registration order.
    for (index, task) in tasks.iter_mut().enumerate() {
        let Some(Call { operation, reply }) = task.rendezvous(round, cancel).await? else {
            continue;
        };
        tracing::debug!(
            index,
            kind = ?operation.kind(),
            statement = operation.statement(),
            "queued operation"
        );

        batch.push(operation);
        handlers.push((index, reply));
    }

    if batch.is_empty() {
        tracing::debug!("no operations were queued; not submitting");
        return Ok(());
    }
    tracing::debug!(operations = batch.len(), "submitting batch");

    let mut results = tokio::select! {
        biased;
        () = round.cancelled() => return Err(cancelled(cancel).into()),
        results = submitter.send_batch(round, &batch) => results.map_err(Error::Submit)?,
    };

    let outcome = resume(tasks, handlers, &mut results, round, cancel).await;

    match (outcome, results.close().await) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(err)) => Err(Error::Release(err).into()),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            tracing::warn!(error = ?close_err, "failed to release results of failed batch round");
            Err(err)
        }
    }
}

// Deliver results to participants in queued order, awaiting each one's outcome
// before moving to the next. The first failure ends the walk; handlers not yet
// walked are dropped, which releases their waiting participants.
async fn resume<R: ResultSet>(
    tasks: &mut [Task<R>],
    handlers: Vec<(usize, Reply<R>)>,
    results: &mut R,
    round: &CancellationToken,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    for (index, reply) in handlers {
        let task = &mut tasks[index];

        reply.deliver(results).await;
        task.stage = Stage::Resumed;

        task.outcome(round, cancel).await?;
    }
    Ok(())
}

/// Task is the orchestrator's handle on one spawned participant.
struct Task<R: ResultSet> {
    index: usize,
    handle: AbortOnDropHandle<anyhow::Result<()>>,
    stage: Stage<R>,
}

enum Stage<R: ResultSet> {
    // Running caller logic which hasn't yet been observed to call.
    Running(oneshot::Receiver<Call<R>>),
    // Suspended at rendezvous, with its Call taken by the orchestrator.
    Suspended,
    // Delivered its result, or finished without calling.
    Resumed,
    // The task has been joined.
    Done,
}

impl<R: ResultSet> Task<R> {
    fn spawn(
        index: usize,
        logic: Logic<R>,
        cancel: &CancellationToken,
        round: &CancellationToken,
    ) -> Self {
        let (pause_tx, pause_rx) = oneshot::channel();
        let querier = Querier::new(pause_tx, cancel.clone(), round.clone());

        Self {
            index,
            handle: AbortOnDropHandle::new(tokio::spawn(logic(querier))),
            stage: Stage::Running(pause_rx),
        }
    }

    // Wait for the participant to call, returning its Call.
    // If it instead finishes without calling, its outcome is awaited and None returned.
    async fn rendezvous(
        &mut self,
        round: &CancellationToken,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<Call<R>>> {
        let Stage::Running(pause) = &mut self.stage else {
            return Ok(None);
        };

        let call = tokio::select! {
            biased;
            () = round.cancelled() => return Err(cancelled(cancel).into()),
            call = pause => call,
        };

        match call {
            Ok(call) => {
                self.stage = Stage::Suspended;
                Ok(Some(call))
            }
            Err(_) => {
                tracing::debug!(index = self.index, "participant finished without a call");
                self.stage = Stage::Resumed;
                self.outcome(round, cancel).await?;
                Ok(None)
            }
        }
    }

    // Wait for the participant's final outcome.
    async fn outcome(
        &mut self,
        round: &CancellationToken,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let joined = tokio::select! {
            biased;
            () = round.cancelled() => return Err(cancelled(cancel).into()),
            joined = &mut self.handle => joined,
        };
        self.stage = Stage::Done;

        match joined {
            Ok(outcome) => outcome,
            Err(source) => Err(Error::Panicked {
                index: self.index,
                source,
            }
            .into()),
        }
    }

    // Ensure the participant task has exited. Must be called after the round
    // token is cancelled. Participants which reached rendezvous (or were
    // resumed) exit on their own, while those still running logic ahead of
    // their call are aborted.
    async fn shutdown(self) {
        let Self {
            index,
            handle,
            stage,
        } = self;

        match stage {
            Stage::Done => return,
            Stage::Running(mut pause) => match pause.try_recv() {
                Ok(_call) => (), // Dropping `_call` releases the participant.
                Err(_) => handle.abort(),
            },
            Stage::Suspended | Stage::Resumed => (),
        }

        match handle.await {
            Ok(Ok(())) => (),
            Ok(Err(error)) => {
                tracing::debug!(index, ?error, "discarding outcome of participant after round ended")
            }
            Err(err) if err.is_cancelled() => {
                tracing::debug!(index, "aborted participant which hadn't reached rendezvous")
            }
            Err(err) => tracing::warn!(index, error = ?err, "participant panicked after round ended"),
        }
    }
}
