//! Isolated task runtime.
//!
//! Each submitted task runs on a dedicated OS thread with its own
//! current-thread Tokio event loop. Values cross between the caller and the
//! task only as encoded programs, so the two sides never share a graph.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod handle;
pub mod pipe;
pub mod registry;
pub mod runner;
pub mod state;
pub mod task;
pub mod value;
pub mod wire;

// Re-export key types for convenience
pub use codec::{decode, encode, CodecLimits, EncodedProgram, GraphDecoder, GraphEncoder};
pub use config::ExecutorConfig;
pub use coordinator::TaskCoordinator;
pub use error::{Error, Result};
pub use executor::TaskExecutor;
pub use handle::{TaskCompletion, TaskHandle};
pub use pipe::{Direction, Pipe, Subscription};
pub use registry::{TaskContext, TaskOutput, TaskRegistry};
pub use state::TaskState;
pub use task::{TaskDescriptor, TaskId};
pub use value::{NodeKind, NodeRef, Value};
pub use wire::{Envelope, EnvelopeKind};
