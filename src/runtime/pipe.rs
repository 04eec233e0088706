//! Bidirectional message pipe between a caller and a running task.
//!
//! Each [`Direction`] is a broadcast channel that buffers while nobody is
//! listening. The first subscriber receives the buffered values in order,
//! then every later post is delivered synchronously to all subscribers.

use crate::runtime::value::Value;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Callback invoked for every delivered value.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct DirectionState {
    subscribers: Vec<(u64, Handler)>,
    buffer: VecDeque<Value>,
    closed: bool,
}

#[derive(Default)]
struct DirectionInner {
    state: Mutex<DirectionState>,
    // Serializes deliveries so subscribers observe posts in order; reentrant
    // so a handler may post on the direction it is subscribed to.
    delivery: ReentrantMutex<()>,
    next_id: AtomicU64,
}

/// One direction of a [`Pipe`].
#[derive(Clone, Default)]
pub struct Direction {
    inner: Arc<DirectionInner>,
}

impl Direction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `value` to every subscriber, or buffer it if there are none.
    ///
    /// Posting to a closed direction drops the value.
    pub fn post(&self, value: Value) {
        let _delivery = self.inner.delivery.lock();
        let handlers: Vec<Handler> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                trace!("post after close dropped");
                return;
            }
            if state.subscribers.is_empty() {
                state.buffer.push_back(value);
                return;
            }
            state.subscribers.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            handler(&value);
        }
    }

    /// Register `handler`. Values buffered so far are delivered to it first.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let _delivery = self.inner.delivery.lock();
        let buffered: Vec<Value> = {
            let mut state = self.inner.state.lock();
            state.subscribers.push((id, handler.clone()));
            state.buffer.drain(..).collect()
        };
        for value in &buffered {
            handler(value);
        }

        Subscription {
            direction: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Stop accepting posts and release all subscribers. Idempotent.
    pub fn close(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        drop(released);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Number of values waiting for a first subscriber.
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }
}

/// Handle returned by [`Direction::subscribe`].
pub struct Subscription {
    direction: Weak<DirectionInner>,
    id: u64,
}

impl Subscription {
    /// Remove exactly this subscriber. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.direction.upgrade() {
            inner.state.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Message pipe attached to a task.
///
/// On the caller side, [`Pipe::subscribe`] listens to values the task sends
/// and [`Pipe::post_message`] sends values to the task. Inside the task the
/// roles are the same from the task's point of view.
///
/// Every delivered value is a fresh decoded copy. A message that contains a
/// cycle leaks once its handlers are done with it unless a handler calls
/// [`NodeRef::clear`](crate::runtime::value::NodeRef::clear) on it.
#[derive(Clone, Default)]
pub struct Pipe {
    inbound: Direction,
    outbound: Direction,
}

impl Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for values arriving from the other side.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inbound.subscribe(handler)
    }

    /// Send a value to the other side.
    pub fn post_message(&self, value: impl Into<Value>) {
        self.outbound.post(value.into());
    }

    pub fn inbound(&self) -> &Direction {
        &self.inbound
    }

    pub fn outbound(&self) -> &Direction {
        &self.outbound
    }

    /// Tear down the sending side. Values that already arrived stay
    /// available to late subscribers.
    pub fn close(&self) {
        self.outbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Relay entry point for values decoded from the other side.
    pub(crate) fn post_incoming(&self, value: Value) {
        self.inbound.post(value);
    }

    /// Relay hook for values this side sends.
    pub(crate) fn subscribe_outgoing<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.outbound.subscribe(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |v: &Value| sink.lock().push(v.clone()))
    }

    #[test]
    fn test_buffer_flushes_to_first_subscriber() {
        let direction = Direction::new();
        direction.post(Value::Int(1));
        direction.post(Value::Int(2));
        assert_eq!(direction.buffered(), 2);

        let (first, handler) = collector();
        let _sub = direction.subscribe(handler);
        assert_eq!(*first.lock(), vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(direction.buffered(), 0);

        let (second, handler) = collector();
        let _sub2 = direction.subscribe(handler);
        direction.post(Value::Int(3));
        assert_eq!(*first.lock(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(*second.lock(), vec![Value::Int(3)]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let direction = Direction::new();
        let (seen, handler) = collector();
        let sub = direction.subscribe(handler);
        let (_, other) = collector();
        let _keep = direction.subscribe(other);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(direction.subscriber_count(), 1);

        direction.post(Value::Null);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_buffering_resumes_after_last_unsubscribe() {
        let direction = Direction::new();
        let (_, handler) = collector();
        direction.subscribe(handler).unsubscribe();

        direction.post(Value::Int(9));
        assert_eq!(direction.buffered(), 1);
    }

    #[test]
    fn test_directions_are_independent() {
        let pipe = Pipe::new();
        let (inbound, handler) = collector();
        let _sub = pipe.subscribe(handler);

        pipe.post_message(Value::from("out"));
        assert!(inbound.lock().is_empty());
        assert_eq!(pipe.outbound().buffered(), 1);

        pipe.post_incoming(Value::from("in"));
        assert_eq!(*inbound.lock(), vec![Value::from("in")]);
    }

    #[test]
    fn test_close_drops_outbound_keeps_inbound() {
        let pipe = Pipe::new();
        let (sent, handler) = collector();
        let _relay = pipe.subscribe_outgoing(handler);
        pipe.post_incoming(Value::Int(1));

        pipe.close();
        pipe.close();
        pipe.post_message(Value::Int(2));
        assert!(sent.lock().is_empty());
        assert!(pipe.is_closed());

        let (late, handler) = collector();
        let _sub = pipe.subscribe(handler);
        assert_eq!(*late.lock(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_handler_may_post_reentrantly() {
        let direction = Direction::new();
        let echo = direction.clone();
        let (seen, handler) = collector();
        let _sink = direction.subscribe(handler);
        let _sub = direction.subscribe(move |v| {
            if let Some(n) = v.as_int() {
                if n < 3 {
                    echo.post(Value::Int(n + 1));
                }
            }
        });

        direction.post(Value::Int(0));
        assert_eq!(seen.lock().len(), 4);
    }
}
