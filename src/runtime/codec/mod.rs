//! Graph codec: live values to flat programs and back.
//!
//! The encoder walks a value graph breadth-first with an explicit worklist,
//! so stack use does not grow with graph depth. Aliasing and cycles survive
//! because every composite node is visited once and referenced by index
//! afterwards.

pub mod decoder;
pub mod encoder;
pub mod program;

pub use decoder::{decode, GraphDecoder};
pub use encoder::{encode, GraphEncoder};
pub use program::{EncodedProgram, Edge, Link, LinkKind, Literal, NodeInstr, Slot};

use serde::{Deserialize, Serialize};

/// Default cap on the number of nodes a decoded program may construct.
pub const MAX_NODES: usize = 1_000_000;

/// Default cap on string data a decoded program may carry (10MB).
pub const MAX_BYTES: usize = 10 * 1024 * 1024;

/// Limits applied when replaying a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecLimits {
    pub max_nodes: usize,
    pub max_bytes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_nodes: MAX_NODES,
            max_bytes: MAX_BYTES,
        }
    }
}

/// Running totals checked against [`CodecLimits`].
pub struct LimitTracker {
    max_nodes: usize,
    max_bytes: usize,
    current_nodes: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            max_nodes: limits.max_nodes,
            max_bytes: limits.max_bytes,
            current_nodes: 0,
            current_bytes: 0,
        }
    }

    /// Account for constructed nodes.
    ///
    /// Returns an error if the node limit is exceeded.
    pub fn add_nodes(&mut self, count: usize) -> Result<(), String> {
        self.current_nodes = self.current_nodes.saturating_add(count);
        if self.current_nodes > self.max_nodes {
            return Err(format!(
                "Node count ({}) exceeded maximum limit of {}",
                self.current_nodes, self.max_nodes
            ));
        }
        Ok(())
    }

    /// Add to the byte count.
    ///
    /// Returns an error if the size limit is exceeded.
    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), String> {
        self.current_bytes = self.current_bytes.saturating_add(bytes);
        if self.current_bytes > self.max_bytes {
            return Err(format!(
                "Size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_tracker_basic() {
        let mut tracker = LimitTracker::new(CodecLimits::default());
        assert!(tracker.add_nodes(10).is_ok());
        assert!(tracker.add_bytes(100).is_ok());
    }

    #[test]
    fn test_limit_tracker_nodes_exceeded() {
        let mut tracker = LimitTracker::new(CodecLimits {
            max_nodes: 3,
            max_bytes: 1000,
        });

        assert!(tracker.add_nodes(2).is_ok());
        assert!(tracker.add_nodes(1).is_ok());
        assert!(tracker.add_nodes(1).is_err());
    }

    #[test]
    fn test_limit_tracker_size_exceeded() {
        let mut tracker = LimitTracker::new(CodecLimits {
            max_nodes: 10,
            max_bytes: 100,
        });

        assert!(tracker.add_bytes(50).is_ok());
        assert!(tracker.add_bytes(40).is_ok());
        let err = tracker.add_bytes(20).unwrap_err();
        assert!(err.contains("110 bytes"));
    }
}
