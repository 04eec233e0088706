//! Flat, serializable form of a value graph.
//!
//! A program lists node construction instructions by index, followed by the
//! links that wire composite children into their containers. Replaying the
//! nodes and then the links in order rebuilds the graph.

use serde::{Deserialize, Serialize};

/// A value that needs no node of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    String(String),
    Date(i64),
    Regex { source: String, flags: String },
    Function(String),
    /// Value that could not be represented; decodes to undefined
    Absent,
    /// Placeholder filled by a later link
    Pending,
}

impl Literal {
    /// Bytes of string data carried by this literal.
    pub(crate) fn byte_len(&self) -> usize {
        match self {
            Literal::String(s) | Literal::Function(s) => s.len(),
            Literal::Regex { source, flags } => source.len() + flags.len(),
            _ => 0,
        }
    }
}

/// Construction instruction for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "snake_case")]
pub enum NodeInstr {
    Array(Vec<Literal>),
    Object(Vec<(String, Literal)>),
    Map(Vec<(Literal, Literal)>),
    Set(Vec<Literal>),
}

impl NodeInstr {
    pub(crate) fn byte_len(&self) -> usize {
        match self {
            NodeInstr::Array(items) | NodeInstr::Set(items) => {
                items.iter().map(Literal::byte_len).sum()
            }
            NodeInstr::Object(props) => props.iter().map(|(k, v)| k.len() + v.byte_len()).sum(),
            NodeInstr::Map(entries) => entries
                .iter()
                .map(|(k, v)| k.byte_len() + v.byte_len())
                .sum(),
        }
    }
}

/// Position inside a source node that a link writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "edge", content = "at", rename_all = "snake_case")]
pub enum Edge {
    ArrayElement(usize),
    ObjectProperty(String),
    MapKey(usize),
    MapValue(usize),
    SetMember(usize),
    PrototypeDelegate,
}

/// Edge category, used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    ArrayElement,
    ObjectProperty,
    MapKey,
    MapValue,
    SetMember,
    PrototypeDelegate,
}

impl Edge {
    pub fn kind(&self) -> LinkKind {
        match self {
            Edge::ArrayElement(_) => LinkKind::ArrayElement,
            Edge::ObjectProperty(_) => LinkKind::ObjectProperty,
            Edge::MapKey(_) => LinkKind::MapKey,
            Edge::MapValue(_) => LinkKind::MapValue,
            Edge::SetMember(_) => LinkKind::SetMember,
            Edge::PrototypeDelegate => LinkKind::PrototypeDelegate,
        }
    }
}

/// Child wiring: `target` is stored at `edge` inside `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub source: usize,
    pub edge: Edge,
    pub target: usize,
}

/// Program root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slot", content = "value", rename_all = "snake_case")]
pub enum Slot {
    Literal(Literal),
    Node(usize),
}

/// Encoded value graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedProgram {
    pub nodes: Vec<NodeInstr>,
    pub links: Vec<Link>,
    pub root: Slot,
}

impl EncodedProgram {
    /// Program for a value with no composite parts.
    pub fn literal(literal: Literal) -> Self {
        Self {
            nodes: Vec::new(),
            links: Vec::new(),
            root: Slot::Literal(literal),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Links of one kind, in recorded order.
    pub fn links_of(&self, kind: LinkKind) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |link| link.edge.kind() == kind)
    }
}

/// JSON has no NaN or infinities; those travel as strings.
mod float_repr {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() && value.is_sign_positive() {
            serializer.serialize_str("Infinity")
        } else if value.is_infinite() {
            serializer.serialize_str("-Infinity")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        struct FloatVisitor;

        impl<'de> Visitor<'de> for FloatVisitor {
            type Value = f64;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a number, \"NaN\", \"Infinity\" or \"-Infinity\"")
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<f64, E> {
                Ok(value)
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<f64, E> {
                Ok(value as f64)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<f64, E> {
                Ok(value as f64)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<f64, E> {
                match value {
                    "NaN" => Ok(f64::NAN),
                    "Infinity" => Ok(f64::INFINITY),
                    "-Infinity" => Ok(f64::NEG_INFINITY),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(FloatVisitor)
    }
}
