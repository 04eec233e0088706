//! Named task bodies and delegated behaviors.
//!
//! Code never crosses a task boundary. Both sides link the same registry, and
//! a function value is just the name of an entry here. Objects gain behavior
//! by delegating to a node whose properties hold [`Value::Function`] names.

use crate::runtime::error::{Error, Result};
use crate::runtime::pipe::Pipe;
use crate::runtime::task::TaskId;
use crate::runtime::value::Value;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Task body. Runs inside the isolated context.
pub type TaskBody = Arc<dyn Fn(TaskContext) -> Result<TaskOutput> + Send + Sync>;

/// Delegated behavior, called with a receiver (`Undefined` for free calls)
/// and arguments.
pub type FunctionBody = Arc<dyn Fn(&Value, Vec<Value>) -> Result<Value> + Send + Sync>;

/// What a task body produced.
pub enum TaskOutput {
    /// Final value, available immediately
    Ready(Value),
    /// Final value once the future settles on the context runtime
    Pending(BoxFuture<'static, Result<Value>>),
}

impl TaskOutput {
    pub fn ready(value: impl Into<Value>) -> Self {
        TaskOutput::Ready(value.into())
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        TaskOutput::Pending(Box::pin(future))
    }
}

impl From<Value> for TaskOutput {
    fn from(value: Value) -> Self {
        TaskOutput::Ready(value)
    }
}

impl fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutput::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            TaskOutput::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// Everything a task body receives.
pub struct TaskContext {
    task_id: TaskId,
    args: Vec<Value>,
    pipe: Pipe,
    registry: Arc<TaskRegistry>,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, args: Vec<Value>, pipe: Pipe, registry: Arc<TaskRegistry>) -> Self {
        Self {
            task_id,
            args,
            pipe,
            registry,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Decoded bound arguments, in order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Argument at `index`, or `Undefined` if it was not supplied.
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Undefined)
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }

    /// The task side of the message pipe.
    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Call a behavior reachable from `receiver` through its delegation chain.
    pub fn call_method(&self, receiver: &Value, method: &str, args: Vec<Value>) -> Result<Value> {
        self.registry.call_method(receiver, method, args)
    }
}

/// Metadata for a registered task body.
#[derive(Clone)]
pub struct TaskEntry {
    /// Entry ID (registration order)
    pub id: u32,
    pub name: String,
    pub body: TaskBody,
}

/// Registry of task bodies and functions.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskEntry>,
    functions: HashMap<String, FunctionBody>,
    next_id: u32,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task body.
    ///
    /// Returns the entry ID or an error if a task with the same name exists.
    pub fn register_task<F>(&mut self, name: impl Into<String>, body: F) -> Result<u32>
    where
        F: Fn(TaskContext) -> Result<TaskOutput> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(Error::Registry(format!(
                "Task '{}' is already registered",
                name
            )));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(
            name.clone(),
            TaskEntry {
                id,
                name,
                body: Arc::new(body),
            },
        );
        Ok(id)
    }

    /// Register a behavior that values can reference by name.
    pub fn register_function<F>(&mut self, name: impl Into<String>, function: F) -> Result<()>
    where
        F: Fn(&Value, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(Error::Registry(format!(
                "Function '{}' is already registered",
                name
            )));
        }
        self.functions.insert(name, Arc::new(function));
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&TaskEntry> {
        self.tasks.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionBody> {
        self.functions.get(name)
    }

    /// Call a registered function by name.
    pub fn call_function(&self, name: &str, receiver: &Value, args: Vec<Value>) -> Result<Value> {
        let function = self
            .function(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
        function(receiver, args)
    }

    /// Resolve `method` on `receiver` (own properties, then delegates) and
    /// call the function it names.
    pub fn call_method(&self, receiver: &Value, method: &str, args: Vec<Value>) -> Result<Value> {
        match receiver.get(method) {
            Some(Value::Function(name)) => self.call_function(&name, receiver, args),
            Some(_) => Err(Error::NotCallable(format!(
                "property '{}' is not a function",
                method
            ))),
            None => Err(Error::NotCallable(format!(
                "property '{}' is not defined",
                method
            ))),
        }
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

static GLOBAL: OnceCell<Arc<TaskRegistry>> = OnceCell::new();

/// Install the process-wide registry. Can only succeed once.
pub fn install_global(registry: TaskRegistry) -> Result<Arc<TaskRegistry>> {
    GLOBAL
        .set(Arc::new(registry))
        .map_err(|_| Error::Registry("global task registry is already installed".to_string()))?;
    global().ok_or_else(|| Error::Registry("global task registry is not installed".to_string()))
}

/// The process-wide registry, if installed.
pub fn global() -> Option<Arc<TaskRegistry>> {
    GLOBAL.get().cloned()
}
