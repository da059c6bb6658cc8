//! Operation controller: drives one live operation's result stream.
//!
//! Each started operation gets its own task that pulls from the engine's
//! [`ResultStream`] and forwards results through the connection's
//! [`Outbox`]. Cancelling an [`Operation`] stops the task, drops the
//! stream (which closes its event bridges and releases their bus
//! subscriptions) and guarantees that no further message for the
//! operation id is queued once [`Operation::cancel`] returns.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::messages::OperationMessage;
use super::server::ErrorFormatter;
use crate::execution::{ExecutionResult, GraphQLError, ResultStream};

/// Frame queued for the connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Protocol message serialized as a text frame.
    Message(OperationMessage),
    /// Close the socket with `code` and `reason`.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Sending half of a connection's outbound queue.
///
/// Sends never block; they fail only once the writer has gone away.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    /// Wraps the sending half of the writer queue.
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queues `message`. Returns `false` if the writer is gone.
    pub fn send(&self, message: OperationMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    /// Queues a close frame.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Resolves once the writer has stopped accepting frames.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    /// Queues a `data` message carrying `result`.
    pub fn send_result(&self, id: &str, result: &ExecutionResult, format: &ErrorFormatter) -> bool {
        self.send(OperationMessage::data(id, result.to_payload(|e| format(e))))
    }

    /// Queues an operation-scoped `error` message.
    pub fn send_error(&self, id: &str, error: &GraphQLError, format: &ErrorFormatter) -> bool {
        self.send(OperationMessage::error(Some(id.to_string()), format(error)))
    }
}

/// Notification sent by an operation task when its stream ends on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    /// Operation id.
    pub id: String,
    /// Generation of the operation that finished.
    pub generation: u64,
}

/// Handle to one running operation.
///
/// Dropping the handle cancels the operation without waiting for it.
#[derive(Debug)]
pub struct Operation {
    id: String,
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Operation {
    /// Spawns the task driving `results` for operation `id`.
    ///
    /// `generation` distinguishes this operation from earlier or later
    /// ones that reuse the same id; it is echoed back through `finished`
    /// when the stream ends naturally.
    #[must_use]
    pub fn spawn(
        id: String,
        generation: u64,
        results: ResultStream,
        outbox: Outbox,
        format: ErrorFormatter,
        finished: mpsc::UnboundedSender<Finished>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive(
            id.clone(),
            generation,
            results,
            outbox,
            format,
            cancel.clone(),
            finished,
        ));
        Self {
            id,
            generation,
            cancel,
            task: Some(task),
        }
    }

    /// Operation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Generation assigned at spawn time.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` once the driving task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancels the operation and waits for its task to exit.
    ///
    /// When this returns, the result stream has been dropped and nothing
    /// more will be sent for this operation.
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
            && err.is_panic()
        {
            tracing::warn!(op_id = %self.id, "operation task panicked");
        }
        tracing::debug!(op_id = %self.id, "operation cancelled");
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    id: String,
    generation: u64,
    mut results: ResultStream,
    outbox: Outbox,
    format: ErrorFormatter,
    cancel: CancellationToken,
    finished: mpsc::UnboundedSender<Finished>,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = results.next() => {
                if cancel.is_cancelled() {
                    return;
                }
                match next {
                    Some(Ok(result)) => {
                        if !outbox.send_result(&id, &result, &format) {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!(op_id = %id, error = %err, "operation failed");
                        outbox.send_error(&id, &err, &format);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Release bus subscriptions before announcing completion.
    drop(results);
    if cancel.is_cancelled() {
        return;
    }
    outbox.send(OperationMessage::complete(id.as_str()));
    tracing::debug!(op_id = %id, "operation complete");
    let _ = finished.send(Finished { id, generation });
}
