//! Fan-out/fan-in over several tasks.

use crate::runtime::error::{Error, Result};
use crate::runtime::executor::TaskExecutor;
use crate::runtime::handle::TaskCompletion;
use crate::runtime::task::TaskDescriptor;
use crate::runtime::value::Value;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Completion tagged with its submission index for tracking in FuturesUnordered.
struct IndexedCompletion {
    index: usize,
    completion: TaskCompletion,
}

impl Future for IndexedCompletion {
    type Output = (usize, Result<Value>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let index = self.index;
        match Pin::new(&mut self.completion).poll(cx) {
            Poll::Ready(result) => Poll::Ready((index, result)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Runs a batch of tasks concurrently and collects their results in order.
#[derive(Clone)]
pub struct TaskCoordinator {
    executor: TaskExecutor,
}

impl TaskCoordinator {
    pub fn new(executor: TaskExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Launch every descriptor at once and wait for all of them.
    ///
    /// Results are ordered by submission index, not completion order. The
    /// first failure settles the batch; tasks still running are left to
    /// finish on their own and their results are discarded.
    pub async fn run_all(&self, descriptors: Vec<TaskDescriptor>) -> Result<Vec<Value>> {
        let count = descriptors.len();
        let mut pending: FuturesUnordered<IndexedCompletion> = descriptors
            .into_iter()
            .enumerate()
            .map(|(index, descriptor)| IndexedCompletion {
                index,
                completion: self.executor.submit(descriptor).into_completion(),
            })
            .collect();
        debug!(tasks = count, "coordinating tasks");

        let mut slots: Vec<Option<Value>> = vec![None; count];
        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(value) => slots[index] = Some(value),
                Err(err) => {
                    warn!(index, error = %err, "coordinated task failed");
                    return Err(Error::Task {
                        index,
                        source: Box::new(err),
                    });
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Value::Undefined))
            .collect())
    }
}

/// Run `descriptors` on `executor` with a throwaway coordinator.
pub async fn run_all(executor: &TaskExecutor, descriptors: Vec<TaskDescriptor>) -> Result<Vec<Value>> {
    TaskCoordinator::new(executor.clone()).run_all(descriptors).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::registry::{TaskOutput, TaskRegistry};
    use std::time::Duration;

    fn executor() -> TaskExecutor {
        let mut registry = TaskRegistry::new();
        registry
            .register_task("delayed", |ctx| {
                let value = ctx.arg(0);
                let delay = ctx.arg(1).as_int().unwrap_or(0) as u64;
                Ok(TaskOutput::pending(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(value)
                }))
            })
            .unwrap();
        registry
            .register_task("reject", |_ctx| Err(Error::Registry("rejected".to_string())))
            .unwrap();
        TaskExecutor::new(registry)
    }

    #[tokio::test]
    async fn test_results_follow_submission_order() {
        let coordinator = TaskCoordinator::new(executor());
        let results = coordinator
            .run_all(vec![
                TaskDescriptor::new("delayed").with_arg(1).with_arg(60),
                TaskDescriptor::new("delayed").with_arg(2).with_arg(0),
            ])
            .await
            .unwrap();
        assert_eq!(results, vec![Value::Int(1), Value::Int(2)]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let results = run_all(&executor(), Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_carries_index() {
        let err = run_all(
            &executor(),
            vec![
                TaskDescriptor::new("delayed").with_arg(0).with_arg(200),
                TaskDescriptor::new("reject"),
            ],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Task { index: 1, .. }));
        assert!(err.root().is_context_fault());
    }
}
