//! Executor configuration.
//!
//! Controls how task context threads are spawned and how much a decoded
//! program may allocate.

use crate::runtime::codec::CodecLimits;
use crate::runtime::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default prefix for context thread names.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "isotask";

/// Configuration shared by every task an executor launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Context threads are named `<prefix>-<task id>`
    pub thread_name_prefix: String,

    /// Stack size for context threads in bytes (None = platform default)
    pub stack_size: Option<usize>,

    /// Limits applied when decoding arguments, messages and results
    pub limits: CodecLimits,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            stack_size: None,
            limits: CodecLimits::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.limits.max_nodes = max_nodes;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.limits.max_bytes = max_bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_name_prefix.trim().is_empty() {
            return Err(Error::Config(
                "thread_name_prefix cannot be empty".to_string(),
            ));
        }
        if self.stack_size == Some(0) {
            return Err(Error::Config(
                "stack_size must be a positive number of bytes".to_string(),
            ));
        }
        if self.limits.max_nodes == 0 {
            return Err(Error::Config("max_nodes must be at least 1".to_string()));
        }
        Ok(())
    }
}
