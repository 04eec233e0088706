//! Isolated task context.
//!
//! Every task gets a dedicated OS thread with its own current-thread Tokio
//! runtime. Values only reach it as serialized frames: arguments are decoded
//! on the thread, pipe traffic is decoded as it arrives, and the final value
//! is encoded before it leaves.

use crate::runtime::codec::{EncodedProgram, GraphDecoder};
use crate::runtime::config::ExecutorConfig;
use crate::runtime::error::{Error, Result};
use crate::runtime::pipe::Pipe;
use crate::runtime::registry::{TaskContext, TaskOutput, TaskRegistry};
use crate::runtime::task::TaskId;
use crate::runtime::value::Value;
use crate::runtime::wire::{Envelope, EnvelopeKind, Frame};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Traffic from a context to its caller.
#[derive(Debug)]
pub(crate) enum ContextEvent {
    /// Serialized envelope (messages, then exactly one result)
    Frame(Frame),
    /// The context failed before producing a result
    Fault(Error),
}

/// Everything a context needs to start.
pub(crate) struct LaunchSpec {
    pub task_id: TaskId,
    pub task: String,
    pub args: Vec<EncodedProgram>,
    pub registry: Arc<TaskRegistry>,
    pub config: Arc<ExecutorConfig>,
    /// Frames posted by the caller
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Caller's end of a running context.
pub(crate) struct ContextLink {
    pub events: mpsc::UnboundedReceiver<ContextEvent>,
    pub thread: std::thread::JoinHandle<()>,
}

type InitSignal = oneshot::Sender<Result<()>>;

/// Spawn the context thread and wait until its runtime is up.
pub(crate) async fn launch(spec: LaunchSpec) -> Result<ContextLink> {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ContextEvent>();
    let (init_tx, init_rx): (InitSignal, _) = oneshot::channel();

    let mut builder = std::thread::Builder::new().name(format!(
        "{}-{}",
        spec.config.thread_name_prefix, spec.task_id
    ));
    if let Some(size) = spec.config.stack_size {
        builder = builder.stack_size(size);
    }

    let thread = builder
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(Error::Spawn(format!(
                        "failed to build tokio runtime: {}",
                        err
                    ))));
                    return;
                }
            };
            let _ = init_tx.send(Ok(()));

            let core = ContextCore::new(spec, event_tx);
            tokio_rt.block_on(core.run());
        })
        .map_err(|e| Error::Spawn(format!("Failed to spawn task context thread: {}", e)))?;

    match init_rx.await {
        Ok(Ok(())) => Ok(ContextLink {
            events: event_rx,
            thread,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::Spawn(
            "Task context initialization failed".to_string(),
        )),
    }
}

struct ContextCore {
    task_id: TaskId,
    task: String,
    args: Vec<EncodedProgram>,
    registry: Arc<TaskRegistry>,
    decoder: GraphDecoder,
    inbound: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<ContextEvent>,
}

impl ContextCore {
    fn new(spec: LaunchSpec, events: mpsc::UnboundedSender<ContextEvent>) -> Self {
        let LaunchSpec {
            task_id,
            task,
            args,
            registry,
            config,
            inbound,
        } = spec;

        Self {
            task_id,
            task,
            args,
            registry,
            decoder: GraphDecoder::new(config.limits),
            inbound,
            events,
        }
    }

    async fn run(self) {
        let task_id = self.task_id;
        let events = self.events.clone();
        debug!(task_id = %task_id, task = %self.task, "task context started");

        let event = match self.execute().await.and_then(|v| Envelope::result(&v).to_frame()) {
            Ok(frame) => ContextEvent::Frame(frame),
            Err(err) => {
                debug!(task_id = %task_id, error = %err, "task context faulted");
                ContextEvent::Fault(err)
            }
        };

        if events.send(event).is_err() {
            trace!(task_id = %task_id, "caller gone before result was delivered");
        }
    }

    async fn execute(self) -> Result<Value> {
        let ContextCore {
            task_id,
            task,
            args,
            registry,
            decoder,
            inbound,
            events,
        } = self;

        let args = args
            .iter()
            .map(|program| decoder.decode(program))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::Decode(format!("Failed to decode task arguments: {}", e)))?;

        let body = registry
            .task(&task)
            .map(|entry| entry.body.clone())
            .ok_or_else(|| Error::UnknownTask(task.clone()))?;

        let pipe = Pipe::new();
        let outgoing = events.clone();
        let _outgoing = pipe.subscribe_outgoing(move |value| {
            match Envelope::message(value).to_frame() {
                Ok(frame) => {
                    if outgoing.send(ContextEvent::Frame(frame)).is_err() {
                        trace!("message dropped, caller gone");
                    }
                }
                Err(err) => warn!(error = %err, "failed to frame outgoing message"),
            }
        });
        let relay = tokio::spawn(relay_inbound(
            task.clone(),
            inbound,
            pipe.clone(),
            decoder.clone(),
            events,
        ));

        let ctx = TaskContext::new(task_id, args, pipe.clone(), registry.clone());
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| body(ctx))) {
            Ok(Ok(TaskOutput::Ready(value))) => Ok(value),
            Ok(Ok(TaskOutput::Pending(future))) => {
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result.map_err(|e| body_failed(&task, e)),
                    Err(payload) => Err(panicked(&task, payload)),
                }
            }
            Ok(Err(err)) => Err(body_failed(&task, err)),
            Err(payload) => Err(panicked(&task, payload)),
        };

        relay.abort();
        pipe.close();
        result
    }
}

/// Decode caller frames into the task pipe until the caller goes away.
///
/// A malformed frame or a panicking pipe handler faults the task.
async fn relay_inbound(
    task: String,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    pipe: Pipe,
    decoder: GraphDecoder,
    events: mpsc::UnboundedSender<ContextEvent>,
) {
    while let Some(frame) = inbound.recv().await {
        let opened = Envelope::from_frame(&frame).and_then(|envelope| match envelope.kind {
            EnvelopeKind::Message => envelope.open(&decoder),
            EnvelopeKind::Result => Err(Error::Decode(
                "unexpected result envelope from caller".to_string(),
            )),
        });
        let delivered = opened.and_then(|value| {
            std::panic::catch_unwind(AssertUnwindSafe(|| pipe.post_incoming(value))).map_err(
                |payload| {
                    Error::ContextFault(format!(
                        "task '{}' message handler panicked: {}",
                        task,
                        panic_message(payload.as_ref())
                    ))
                },
            )
        });
        if let Err(err) = delivered {
            let _ = events.send(ContextEvent::Fault(err));
            break;
        }
    }
}

fn body_failed(task: &str, err: Error) -> Error {
    match err {
        err @ Error::ContextFault(_) => err,
        other => Error::ContextFault(format!("task '{}' failed: {}", task, other)),
    }
}

fn panicked(task: &str, payload: Box<dyn Any + Send>) -> Error {
    Error::ContextFault(format!(
        "task '{}' panicked: {}",
        task,
        panic_message(payload.as_ref())
    ))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
