//! isotask
//!
//! Runs named tasks in isolated contexts and exchanges arbitrary value graphs
//! with them: nested containers, shared references, cycles, Map and Set
//! containers and delegated behavior all survive the crossing.

pub mod runtime;

pub use runtime::{
    decode, encode, Error, ExecutorConfig, Pipe, Result, TaskContext, TaskCoordinator,
    TaskDescriptor, TaskExecutor, TaskHandle, TaskOutput, TaskRegistry, Value,
};
