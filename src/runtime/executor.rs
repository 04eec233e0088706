//! Task submission and the caller-side relay.
//!
//! `submit` never fails synchronously. Every problem, from a missing Tokio
//! runtime to a panicking body, settles the task's completion instead.

use crate::runtime::codec::{encode, EncodedProgram, GraphDecoder};
use crate::runtime::config::ExecutorConfig;
use crate::runtime::error::{Error, Result};
use crate::runtime::handle::{TaskCompletion, TaskHandle};
use crate::runtime::pipe::Pipe;
use crate::runtime::registry::{self, TaskRegistry};
use crate::runtime::runner::{self, ContextEvent, ContextLink, LaunchSpec};
use crate::runtime::state::{TaskState, TaskStateCell};
use crate::runtime::task::{TaskDescriptor, TaskId};
use crate::runtime::value::Value;
use crate::runtime::wire::{Envelope, EnvelopeKind, Frame};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Launches tasks from a shared registry, one isolated context per task.
#[derive(Clone)]
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    config: Arc<ExecutorConfig>,
}

impl TaskExecutor {
    pub fn new(registry: impl Into<Arc<TaskRegistry>>) -> Self {
        Self {
            registry: registry.into(),
            config: Arc::new(ExecutorConfig::default()),
        }
    }

    pub fn with_config(
        registry: impl Into<Arc<TaskRegistry>>,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: registry.into(),
            config: Arc::new(config),
        })
    }

    /// Executor over the process-wide registry.
    pub fn from_global(config: ExecutorConfig) -> Result<Self> {
        let registry = registry::global()
            .ok_or_else(|| Error::Registry("global task registry is not installed".to_string()))?;
        Self::with_config(registry, config)
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Submit `task` with `args` bound to it.
    pub fn run(&self, task: impl Into<String>, args: impl IntoIterator<Item = Value>) -> TaskHandle {
        self.submit(TaskDescriptor::new(task).with_args(args))
    }

    /// Start a task in a fresh context.
    ///
    /// Must be called from within a Tokio runtime; otherwise the returned
    /// handle is already failed.
    pub fn submit(&self, descriptor: TaskDescriptor) -> TaskHandle {
        let id = TaskId::new();
        let state = TaskStateCell::new();
        let pipe = Pipe::new();
        debug!(task_id = %id, task = %descriptor.task(), "submitting task");

        let args: Vec<EncodedProgram> = descriptor.args().iter().map(encode).collect();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Frame>();
        pipe.subscribe_outgoing(move |value| match Envelope::message(value).to_frame() {
            Ok(frame) => {
                if frame_tx.send(frame).is_err() {
                    trace!("message dropped, task context gone");
                }
            }
            Err(err) => warn!(error = %err, "failed to frame outgoing message"),
        });

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(task_id = %id, "task submitted outside of a tokio runtime");
                state.transition(TaskState::Failed);
                pipe.close();
                let completion = TaskCompletion::settled(Err(Error::Spawn(format!(
                    "no tokio runtime available: {}",
                    err
                ))));
                return TaskHandle::new(id, completion, pipe, state);
            }
        };

        let spec = LaunchSpec {
            task_id: id,
            task: descriptor.task().to_string(),
            args,
            registry: self.registry.clone(),
            config: self.config.clone(),
            inbound: frame_rx,
        };

        let (settle_tx, settle_rx) = oneshot::channel();
        let relay = TaskRelay {
            id,
            pipe: pipe.clone(),
            state: state.clone(),
            decoder: GraphDecoder::new(self.config.limits),
            settle: Some(settle_tx),
            thread: None,
        };
        runtime.spawn(relay.run(spec));

        TaskHandle::new(id, TaskCompletion::new(settle_rx), pipe, state)
    }
}

/// Drives one task from launch to teardown on the caller's runtime.
struct TaskRelay {
    id: TaskId,
    pipe: Pipe,
    state: TaskStateCell,
    decoder: GraphDecoder,
    settle: Option<oneshot::Sender<Result<Value>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TaskRelay {
    async fn run(mut self, spec: LaunchSpec) {
        let ContextLink { mut events, thread } = match runner::launch(spec).await {
            Ok(link) => link,
            Err(err) => {
                self.fail(err);
                self.teardown().await;
                return;
            }
        };
        self.thread = Some(thread);
        self.state.transition(TaskState::Running);
        trace!(task_id = %self.id, "task context acknowledged startup");

        while self.settle.is_some() {
            match events.recv().await {
                Some(ContextEvent::Frame(frame)) => self.on_frame(&frame),
                Some(ContextEvent::Fault(err)) => self.fail(err),
                None => self.fail(Error::ContextFault(
                    "task context exited without producing a result".to_string(),
                )),
            }
        }

        drop(events);
        self.teardown().await;
    }

    fn on_frame(&mut self, frame: &[u8]) {
        let envelope = match Envelope::from_frame(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                return self.fail(Error::Decode(format!(
                    "Failed to decode envelope frame: {}",
                    err
                )))
            }
        };

        match (envelope.kind, envelope.open(&self.decoder)) {
            (EnvelopeKind::Message, Ok(value)) => self.deliver(value),
            (EnvelopeKind::Result, Ok(value)) => self.complete(value),
            (_, Err(err)) => self.fail(err),
        }
    }

    /// Hand a message to the caller's subscribers; a panicking handler
    /// fails the task.
    fn deliver(&mut self, value: Value) {
        let pipe = &self.pipe;
        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| pipe.post_incoming(value)));
        if let Err(payload) = delivered {
            let message = runner::panic_message(payload.as_ref());
            self.fail(Error::ContextFault(format!(
                "caller message handler panicked: {}",
                message
            )));
        }
    }

    fn complete(&mut self, value: Value) {
        if let Some(settle) = self.settle.take() {
            self.state.transition(TaskState::Completed);
            debug!(task_id = %self.id, "task completed");
            let _ = settle.send(Ok(value));
        }
    }

    fn fail(&mut self, err: Error) {
        if let Some(settle) = self.settle.take() {
            self.state.transition(TaskState::Failed);
            debug!(task_id = %self.id, error = %err, "task failed");
            let _ = settle.send(Err(err));
        }
    }

    /// Close the pipe and reap the context thread. Safe to call repeatedly.
    async fn teardown(&mut self) {
        self.pipe.close();
        let Some(thread) = self.thread.take() else {
            return;
        };

        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => trace!(task_id = %self.id, "task context thread joined"),
            Ok(Err(_)) => warn!(task_id = %self.id, "task context thread panicked"),
            Err(err) => warn!(task_id = %self.id, error = %err, "failed to join task context thread"),
        }
    }
}
