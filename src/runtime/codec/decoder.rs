//! [`EncodedProgram`] back to a live value graph.

use super::program::{Edge, EncodedProgram, Link, Literal, NodeInstr, Slot};
use super::{CodecLimits, LimitTracker};
use crate::runtime::error::{Error, Result};
use crate::runtime::value::{NodeBody, NodeRef, Value, ValueMap, ValueSet};
use indexmap::IndexMap;
use tracing::trace;

/// Replays programs in two passes: construct every node, then apply every link.
///
/// Map and Set contents are staged positionally while links are applied and
/// hashed into their node once every key is final.
#[derive(Debug, Clone, Default)]
pub struct GraphDecoder {
    limits: CodecLimits,
}

impl GraphDecoder {
    pub fn new(limits: CodecLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> CodecLimits {
        self.limits
    }

    pub fn decode(&self, program: &EncodedProgram) -> Result<Value> {
        let mut tracker = LimitTracker::new(self.limits);
        tracker.add_nodes(program.nodes.len()).map_err(Error::Decode)?;

        let mut nodes = Vec::with_capacity(program.nodes.len());
        let mut staged = Vec::with_capacity(program.nodes.len());
        for instr in &program.nodes {
            tracker.add_bytes(instr.byte_len()).map_err(Error::Decode)?;
            let (node, contents) = construct(instr);
            nodes.push(node);
            staged.push(contents);
        }

        for (position, link) in program.links.iter().enumerate() {
            apply_link(&nodes, &mut staged, position, link)?;
        }
        for (node, contents) in nodes.iter().zip(staged) {
            match contents {
                Some(Staged::Map(entries)) => {
                    node.write().body = NodeBody::Map(entries.into_iter().collect())
                }
                Some(Staged::Set(members)) => {
                    node.write().body = NodeBody::Set(members.into_iter().collect())
                }
                None => {}
            }
        }
        trace!(
            nodes = nodes.len(),
            links = program.links.len(),
            "decoded program"
        );

        match &program.root {
            Slot::Literal(literal) => {
                tracker.add_bytes(literal.byte_len()).map_err(Error::Decode)?;
                Ok(literal_value(literal))
            }
            Slot::Node(index) => nodes.get(*index).cloned().map(Value::Node).ok_or_else(|| {
                Error::Decode(format!(
                    "root index {} out of range ({} nodes)",
                    index,
                    nodes.len()
                ))
            }),
        }
    }
}

/// Decode with default limits.
pub fn decode(program: &EncodedProgram) -> Result<Value> {
    GraphDecoder::default().decode(program)
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Undefined | Literal::Absent | Literal::Pending => Value::Undefined,
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::String(s.clone()),
        Literal::Date(ms) => Value::Date(*ms),
        Literal::Regex { source, flags } => Value::Regex {
            source: source.clone(),
            flags: flags.clone(),
        },
        Literal::Function(name) => Value::Function(name.clone()),
    }
}

/// Map or Set contents awaiting their links.
enum Staged {
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
}

fn construct(instr: &NodeInstr) -> (NodeRef, Option<Staged>) {
    match instr {
        NodeInstr::Array(items) => (
            NodeRef::new(NodeBody::Array(items.iter().map(literal_value).collect())),
            None,
        ),
        NodeInstr::Object(props) => (
            NodeRef::new(NodeBody::Object(
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), literal_value(v)))
                    .collect::<IndexMap<_, _>>(),
            )),
            None,
        ),
        NodeInstr::Map(entries) => (
            NodeRef::new(NodeBody::Map(ValueMap::new())),
            Some(Staged::Map(
                entries
                    .iter()
                    .map(|(k, v)| (literal_value(k), literal_value(v)))
                    .collect(),
            )),
        ),
        NodeInstr::Set(members) => (
            NodeRef::new(NodeBody::Set(ValueSet::new())),
            Some(Staged::Set(members.iter().map(literal_value).collect())),
        ),
    }
}

fn node_at<'a>(nodes: &'a [NodeRef], index: usize, position: usize, role: &str) -> Result<&'a NodeRef> {
    nodes.get(index).ok_or_else(|| {
        Error::Decode(format!(
            "link {}: {} index {} out of range ({} nodes)",
            position,
            role,
            index,
            nodes.len()
        ))
    })
}

fn apply_link(
    nodes: &[NodeRef],
    staged: &mut [Option<Staged>],
    position: usize,
    link: &Link,
) -> Result<()> {
    let source = node_at(nodes, link.source, position, "source")?;
    let target = node_at(nodes, link.target, position, "target")?.clone();

    if link.edge == Edge::PrototypeDelegate {
        source.set_delegate(Some(target));
        return Ok(());
    }
    let target = Value::Node(target);

    let out_of_range = |at: usize| {
        Error::Decode(format!(
            "link {}: position {} out of range in node {}",
            position, at, link.source
        ))
    };

    match (&link.edge, &mut staged[link.source]) {
        (Edge::MapKey(i), Some(Staged::Map(entries))) => {
            entries.get_mut(*i).ok_or_else(|| out_of_range(*i))?.0 = target;
            return Ok(());
        }
        (Edge::MapValue(i), Some(Staged::Map(entries))) => {
            entries.get_mut(*i).ok_or_else(|| out_of_range(*i))?.1 = target;
            return Ok(());
        }
        (Edge::SetMember(i), Some(Staged::Set(members))) => {
            *members.get_mut(*i).ok_or_else(|| out_of_range(*i))? = target;
            return Ok(());
        }
        _ => {}
    }

    let mut data = source.write();
    match (&link.edge, &mut data.body) {
        (Edge::ArrayElement(i), NodeBody::Array(items)) => {
            *items.get_mut(*i).ok_or_else(|| out_of_range(*i))? = target;
        }
        (Edge::ObjectProperty(key), NodeBody::Object(props)) => {
            props.insert(key.clone(), target);
        }
        (edge, body) => {
            return Err(Error::Decode(format!(
                "link {}: {:?} edge does not apply to {} node {}",
                position,
                edge.kind(),
                body.kind(),
                link.source
            )));
        }
    }
    Ok(())
}
