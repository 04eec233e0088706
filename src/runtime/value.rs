//! Live value graph exchanged with isolated task contexts.
//!
//! Composite values are [`NodeRef`] handles: shared, interior-mutable nodes
//! compared by identity. Two fields holding clones of the same `NodeRef`
//! alias the same node, and a node may reach itself (cycles). Anything that
//! crosses a task boundary is copied through the graph codec, so a graph is
//! never shared between the caller and a running task.
//!
//! Nodes are reference counted. A cycle keeps its nodes alive after the last
//! outside handle is dropped; call [`NodeRef::clear`] on one node of the cycle
//! to release it. Decoded graphs, including cyclic pipe messages, are no
//! exception.

use indexmap::map::Entry;
use indexmap::IndexMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A value that can be passed to, or returned from, a task.
///
/// Equality (`==`) follows SameValueZero: primitives compare by value, NaN
/// equals NaN, integers and floats compare numerically, and nodes, opaque
/// handles compare by identity. Use [`Value::deep_eq`] for structure.
///
/// A graph that reaches itself leaks unless one of its nodes is cleared with
/// [`NodeRef::clear`].
#[derive(Clone, Debug)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    /// Float, including NaN and ±Infinity
    Float(f64),
    String(String),
    /// Absolute time in milliseconds since the Unix epoch
    Date(i64),
    /// Regular expression pattern and flags
    Regex { source: String, flags: String },
    /// Named behavior from the task registry
    Function(String),
    /// Host handle that cannot cross a task boundary
    Opaque(OpaqueHandle),
    /// Array, object, Map or Set
    Node(NodeRef),
}

impl Value {
    /// Create an array node from items.
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Node(NodeRef::array(items))
    }

    /// Create a plain object node from `(key, value)` pairs.
    pub fn object<K: Into<String>>(props: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Node(NodeRef::object(props))
    }

    /// Create a Map node from `(key, value)` entries.
    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Value::Node(NodeRef::map(entries))
    }

    /// Create a Set node from members.
    pub fn set(members: impl IntoIterator<Item = Value>) -> Self {
        Value::Node(NodeRef::new_set(members))
    }

    pub fn function(name: impl Into<String>) -> Self {
        Value::Function(name.into())
    }

    pub fn regex(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Value::Regex {
            source: source.into(),
            flags: flags.into(),
        }
    }

    pub fn opaque<T: Any + Send + Sync>(handle: T) -> Self {
        Value::Opaque(OpaqueHandle::new(handle))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&NodeRef> {
        match self {
            Value::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Look up `key` on an object node, consulting its delegation chain.
    ///
    /// Returns `None` for non-object values and missing keys.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.as_node().and_then(|node| node.lookup(key))
    }

    /// Structural equality that follows nodes instead of comparing identity.
    ///
    /// Cycles are handled by assuming pairs already under comparison are
    /// equal. Object properties compare as key sets; array elements, Map
    /// entries and Set members compare positionally.
    pub fn deep_eq(&self, other: &Value) -> bool {
        let mut stack = vec![(self.clone(), other.clone())];
        let mut assumed: HashSet<(usize, usize)> = HashSet::new();

        while let Some((left, right)) = stack.pop() {
            let (a, b) = match (&left, &right) {
                (Value::Node(a), Value::Node(b)) => (a, b),
                _ => {
                    if left != right {
                        return false;
                    }
                    continue;
                }
            };

            if a.ptr_eq(b) || !assumed.insert((a.identity(), b.identity())) {
                continue;
            }

            let (da, db) = (a.read(), b.read());
            match (&da.delegate, &db.delegate) {
                (None, None) => {}
                (Some(x), Some(y)) => stack.push((Value::Node(x.clone()), Value::Node(y.clone()))),
                _ => return false,
            }

            match (&da.body, &db.body) {
                (NodeBody::Array(x), NodeBody::Array(y)) => {
                    if x.len() != y.len() {
                        return false;
                    }
                    stack.extend(x.iter().cloned().zip(y.iter().cloned()));
                }
                (NodeBody::Object(x), NodeBody::Object(y)) => {
                    if x.len() != y.len() {
                        return false;
                    }
                    for (key, value) in x {
                        match y.get(key) {
                            Some(other) => stack.push((value.clone(), other.clone())),
                            None => return false,
                        }
                    }
                }
                (NodeBody::Map(x), NodeBody::Map(y)) => {
                    if x.len() != y.len() {
                        return false;
                    }
                    for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                        stack.push((xk.clone(), yk.clone()));
                        stack.push((xv.clone(), yv.clone()));
                    }
                }
                (NodeBody::Set(x), NodeBody::Set(y)) => {
                    if x.len() != y.len() {
                        return false;
                    }
                    stack.extend(x.iter().cloned().zip(y.iter().cloned()));
                }
                _ => return false,
            }
        }

        true
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                float_key(*b) == ValueKey::Int(*a)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (
                Value::Regex { source, flags },
                Value::Regex {
                    source: other_source,
                    flags: other_flags,
                },
            ) => source == other_source && flags == other_flags,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
            (Value::Node(a), Value::Node(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<NodeRef> for Value {
    fn from(node: NodeRef) -> Self {
        Value::Node(node)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Handle to a host-owned object. Compared by identity.
#[derive(Clone)]
pub struct OpaqueHandle(Arc<dyn Any + Send + Sync>);

impl OpaqueHandle {
    pub fn new<T: Any + Send + Sync>(handle: T) -> Self {
        Self(Arc::new(handle))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &OpaqueHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for OpaqueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpaqueHandle(..)")
    }
}

/// Container kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Array,
    Object,
    Map,
    Set,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Array => "array",
            NodeKind::Object => "object",
            NodeKind::Map => "map",
            NodeKind::Set => "set",
        };
        f.write_str(name)
    }
}

/// Own contents of a node.
#[derive(Debug)]
pub enum NodeBody {
    Array(Vec<Value>),
    /// Properties in insertion order
    Object(IndexMap<String, Value>),
    Map(ValueMap),
    Set(ValueSet),
}

impl NodeBody {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeBody::Array(_) => NodeKind::Array,
            NodeBody::Object(_) => NodeKind::Object,
            NodeBody::Map(_) => NodeKind::Map,
            NodeBody::Set(_) => NodeKind::Set,
        }
    }
}

/// A node: own contents plus an optional delegate consulted for lookups
/// that miss the node's own properties.
#[derive(Debug)]
pub struct NodeData {
    pub body: NodeBody,
    pub delegate: Option<NodeRef>,
}

impl NodeData {
    /// Move every child node handle out of this node.
    fn drain_children(&mut self, out: &mut Vec<NodeRef>) {
        if let Some(delegate) = self.delegate.take() {
            out.push(delegate);
        }
        let mut keep = |value: Value| {
            if let Value::Node(node) = value {
                out.push(node);
            }
        };
        match &mut self.body {
            NodeBody::Array(items) => items.drain(..).for_each(&mut keep),
            NodeBody::Object(props) => props.drain(..).for_each(|(_, v)| keep(v)),
            NodeBody::Map(map) => map.entries.drain(..).for_each(|(_, (k, v))| {
                keep(k);
                keep(v);
            }),
            NodeBody::Set(set) => set.members.drain(..).for_each(|(_, m)| keep(m)),
        }
    }
}

// Deep acyclic graphs would otherwise overflow the stack when the last
// handle to their root goes away.
impl Drop for NodeData {
    fn drop(&mut self) {
        let mut stack = Vec::new();
        self.drain_children(&mut stack);
        while let Some(node) = stack.pop() {
            if let Ok(lock) = Arc::try_unwrap(node.0) {
                let mut data = lock.into_inner();
                data.drain_children(&mut stack);
            }
        }
    }
}

/// Shared handle to a composite node.
#[derive(Clone)]
pub struct NodeRef(Arc<RwLock<NodeData>>);

impl NodeRef {
    pub fn new(body: NodeBody) -> Self {
        Self(Arc::new(RwLock::new(NodeData {
            body,
            delegate: None,
        })))
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Self::new(NodeBody::Array(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(props: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::new(NodeBody::Object(
            props.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Self::new(NodeBody::Map(entries.into_iter().collect()))
    }

    pub fn new_set(members: impl IntoIterator<Item = Value>) -> Self {
        Self::new(NodeBody::Set(members.into_iter().collect()))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, NodeData> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, NodeData> {
        self.0.write()
    }

    pub fn ptr_eq(&self, other: &NodeRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity key, stable for the lifetime of the node.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn kind(&self) -> NodeKind {
        self.read().body.kind()
    }

    /// Number of elements, properties, entries or members.
    pub fn len(&self) -> usize {
        match &self.read().body {
            NodeBody::Array(items) => items.len(),
            NodeBody::Object(props) => props.len(),
            NodeBody::Map(map) => map.len(),
            NodeBody::Set(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delegate(&self) -> Option<NodeRef> {
        self.read().delegate.clone()
    }

    pub fn set_delegate(&self, delegate: Option<NodeRef>) {
        self.write().delegate = delegate;
    }

    /// Own property of an object node.
    pub fn get_own(&self, key: &str) -> Option<Value> {
        match &self.read().body {
            NodeBody::Object(props) => props.get(key).cloned(),
            _ => None,
        }
    }

    pub fn has_own(&self, key: &str) -> bool {
        match &self.read().body {
            NodeBody::Object(props) => props.contains_key(key),
            _ => false,
        }
    }

    /// Own property names of an object node, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        match &self.read().body {
            NodeBody::Object(props) => props.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Property lookup through the delegation chain, nearest definition first.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let mut visited = HashSet::new();
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if !visited.insert(node.identity()) {
                return None;
            }
            if let Some(value) = node.get_own(key) {
                return Some(value);
            }
            current = node.delegate();
        }
        None
    }

    /// Set an object property. Returns `false` if this is not an object.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        match &mut self.write().body {
            NodeBody::Object(props) => {
                props.insert(key.into(), value.into());
                true
            }
            _ => false,
        }
    }

    /// Array element at `index`.
    pub fn at(&self, index: usize) -> Option<Value> {
        match &self.read().body {
            NodeBody::Array(items) => items.get(index).cloned(),
            _ => None,
        }
    }

    /// Append to an array node. Returns `false` if this is not an array.
    pub fn push(&self, value: impl Into<Value>) -> bool {
        match &mut self.write().body {
            NodeBody::Array(items) => {
                items.push(value.into());
                true
            }
            _ => false,
        }
    }

    /// Insert into a Map (`key -> value`) or Set (`key`, value ignored).
    pub fn insert(&self, key: impl Into<Value>, value: impl Into<Value>) -> bool {
        match &mut self.write().body {
            NodeBody::Map(map) => {
                map.insert(key.into(), value.into());
                true
            }
            NodeBody::Set(set) => {
                set.insert(key.into());
                true
            }
            _ => false,
        }
    }

    /// Map lookup by key.
    pub fn map_get(&self, key: &Value) -> Option<Value> {
        match &self.read().body {
            NodeBody::Map(map) => map.get(key).cloned(),
            _ => None,
        }
    }

    /// Map key or Set member test.
    pub fn contains(&self, key: &Value) -> bool {
        match &self.read().body {
            NodeBody::Map(map) => map.contains_key(key),
            NodeBody::Set(set) => set.contains(key),
            _ => false,
        }
    }

    /// Remove all contents and the delegate, breaking any cycle through this node.
    pub fn clear(&self) {
        let mut children = Vec::new();
        self.write().drain_children(&mut children);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({}@{:#x})", self.kind(), self.identity())
    }
}

/// Hashable form of SameValueZero equality.
///
/// Integral floats share the `Int` key, every NaN maps to `NaN`, and nodes
/// and opaque handles key by address. The owning entry holds the handle, so
/// the address stays valid for as long as the key exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ValueKey {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    NaN,
    String(String),
    Date(i64),
    Regex(String, String),
    Function(String),
    Opaque(usize),
    Node(usize),
}

impl ValueKey {
    fn of(value: &Value) -> Self {
        match value {
            Value::Undefined => ValueKey::Undefined,
            Value::Null => ValueKey::Null,
            Value::Bool(b) => ValueKey::Bool(*b),
            Value::Int(i) => ValueKey::Int(*i),
            Value::Float(f) => float_key(*f),
            Value::String(s) => ValueKey::String(s.clone()),
            Value::Date(ms) => ValueKey::Date(*ms),
            Value::Regex { source, flags } => ValueKey::Regex(source.clone(), flags.clone()),
            Value::Function(name) => ValueKey::Function(name.clone()),
            Value::Opaque(handle) => ValueKey::Opaque(handle.identity()),
            Value::Node(node) => ValueKey::Node(node.identity()),
        }
    }
}

fn float_key(f: f64) -> ValueKey {
    if f.is_nan() {
        ValueKey::NaN
    } else if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        // also folds -0.0 into 0
        ValueKey::Int(f as i64)
    } else {
        ValueKey::Float(f.to_bits())
    }
}

/// Insertion-ordered map keyed by [`Value`] equality.
#[derive(Debug, Default)]
pub struct ValueMap {
    entries: IndexMap<ValueKey, (Value, Value)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; replacing keeps the original key and position.
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        match self.entries.entry(ValueKey::of(&key)) {
            Entry::Occupied(mut slot) => Some(std::mem::replace(&mut slot.get_mut().1, value)),
            Entry::Vacant(slot) => {
                slot.insert((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(&ValueKey::of(key)).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.entries.contains_key(&ValueKey::of(key))
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        self.entries.shift_remove(&ValueKey::of(key)).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.values().map(|(k, v)| (k, v))
    }
}

impl FromIterator<(Value, Value)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        let mut map = ValueMap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

/// Insertion-ordered set of [`Value`]s.
#[derive(Debug, Default)]
pub struct ValueSet {
    members: IndexMap<ValueKey, Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the value was already a member.
    pub fn insert(&mut self, value: Value) -> bool {
        match self.members.entry(ValueKey::of(&value)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.members.contains_key(&ValueKey::of(value))
    }

    pub fn remove(&mut self, value: &Value) -> bool {
        self.members.shift_remove(&ValueKey::of(value)).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.members.values()
    }
}

impl FromIterator<Value> for ValueSet {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let mut set = ValueSet::new();
        for member in iter {
            set.insert(member);
        }
        set
    }
}
