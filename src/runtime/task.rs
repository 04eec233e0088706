//! Task identity and descriptors.

use crate::runtime::value::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A named task body plus the arguments bound to it.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    task: String,
    args: Vec<Value>,
}

impl TaskDescriptor {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Registry name of the task body
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }
}
