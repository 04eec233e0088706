//! Caller-facing handle for a submitted task.

use crate::runtime::error::{Error, Result};
use crate::runtime::pipe::Pipe;
use crate::runtime::state::{TaskState, TaskStateCell};
use crate::runtime::task::TaskId;
use crate::runtime::value::Value;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves once with the task's final value or its failure.
pub struct TaskCompletion {
    rx: oneshot::Receiver<Result<Value>>,
}

impl TaskCompletion {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Value>>) -> Self {
        Self { rx }
    }

    /// A completion that is already settled.
    pub(crate) fn settled(result: Result<Value>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for TaskCompletion {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Aborted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle to a submitted task.
///
/// Dropping the handle does not stop the task; its context runs to the end
/// and the result is discarded.
pub struct TaskHandle {
    id: TaskId,
    completion: TaskCompletion,
    pipe: Pipe,
    state: TaskStateCell,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, completion: TaskCompletion, pipe: Pipe, state: TaskStateCell) -> Self {
        Self {
            id,
            completion,
            pipe,
            state,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Caller side of the message pipe.
    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &TaskStateCell {
        &self.state
    }

    pub fn into_completion(self) -> TaskCompletion {
        self.completion
    }

    /// Split into the completion and the pipe.
    pub fn into_parts(self) -> (TaskCompletion, Pipe) {
        (self.completion, self.pipe)
    }

    /// Wait for the final value.
    pub async fn join(self) -> Result<Value> {
        self.completion.await
    }
}

impl IntoFuture for TaskHandle {
    type Output = Result<Value>;
    type IntoFuture = TaskCompletion;

    fn into_future(self) -> Self::IntoFuture {
        self.completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settled_completion() {
        let completion = TaskCompletion::settled(Ok(Value::Int(7)));
        assert_eq!(completion.await.unwrap(), Value::Int(7));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_aborted() {
        let (tx, rx) = oneshot::channel::<Result<Value>>();
        drop(tx);
        let err = TaskCompletion::new(rx).await.unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }

    #[tokio::test]
    async fn test_handle_awaits_directly() {
        let handle = TaskHandle::new(
            TaskId::new(),
            TaskCompletion::settled(Ok(Value::from("done"))),
            Pipe::new(),
            TaskStateCell::new(),
        );
        assert_eq!(handle.state(), TaskState::Launching);
        assert_eq!(handle.await.unwrap(), Value::from("done"));
    }
}
