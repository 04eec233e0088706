//! Value graph to [`EncodedProgram`].

use super::program::{Edge, EncodedProgram, Link, Literal, NodeInstr, Slot};
use crate::runtime::value::{NodeBody, NodeRef, Value};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Node whose instruction has not been built yet.
enum Tail {
    /// A node reached from the graph
    Node { index: usize, node: NodeRef },
    /// A synthesized object holding every property inherited through `head`
    Flattened { index: usize, head: NodeRef },
}

/// Own contents copied out from under the node lock.
enum Snapshot {
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
}

/// Single-use encoder. Identity tracking lives only as long as one `encode` call.
#[derive(Default)]
pub struct GraphEncoder {
    nodes: Vec<Option<NodeInstr>>,
    links: Vec<Link>,
    visits: HashMap<usize, usize>,
    delegates: HashMap<usize, usize>,
    tails: VecDeque<Tail>,
    // Held so node addresses cannot be reused while identities are tracked.
    retained: Vec<NodeRef>,
    gaps: usize,
}

impl GraphEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `value`. Never fails: unrepresentable values become [`Literal::Absent`].
    pub fn encode(mut self, value: &Value) -> EncodedProgram {
        let root = match value {
            Value::Node(node) => Slot::Node(self.visit(node)),
            other => Slot::Literal(self.literal(other)),
        };

        // Leveled passes: everything queued during a pass runs in the next one.
        while !self.tails.is_empty() {
            let run = self.tails.len();
            let level: Vec<Tail> = self.tails.drain(..run).collect();
            for tail in level {
                match tail {
                    Tail::Node { index, node } => self.build_node(index, &node),
                    Tail::Flattened { index, head } => self.build_flattened(index, &head),
                }
            }
        }

        if self.gaps > 0 {
            debug!(gaps = self.gaps, "encoded program with absent values");
        }

        EncodedProgram {
            nodes: self
                .nodes
                .into_iter()
                .map(|instr| instr.unwrap_or_else(|| NodeInstr::Object(Vec::new())))
                .collect(),
            links: self.links,
            root,
        }
    }

    /// Index for `node`, queuing its construction on first sight.
    fn visit(&mut self, node: &NodeRef) -> usize {
        if let Some(&index) = self.visits.get(&node.identity()) {
            return index;
        }
        let index = self.reserve();
        self.visits.insert(node.identity(), index);
        self.retained.push(node.clone());
        self.tails.push_back(Tail::Node {
            index,
            node: node.clone(),
        });
        index
    }

    fn reserve(&mut self) -> usize {
        self.nodes.push(None);
        self.nodes.len() - 1
    }

    fn literal(&mut self, value: &Value) -> Literal {
        match value {
            Value::Undefined => Literal::Undefined,
            Value::Null => Literal::Null,
            Value::Bool(b) => Literal::Bool(*b),
            Value::Int(i) => Literal::Int(*i),
            Value::Float(f) => Literal::Float(*f),
            Value::String(s) => Literal::String(s.clone()),
            Value::Date(ms) => Literal::Date(*ms),
            Value::Regex { source, flags } => Literal::Regex {
                source: source.clone(),
                flags: flags.clone(),
            },
            Value::Function(name) => Literal::Function(name.clone()),
            Value::Opaque(_) => {
                self.gaps += 1;
                debug!("opaque host handle encoded as absent");
                Literal::Absent
            }
            Value::Node(_) => Literal::Pending,
        }
    }

    /// Literal for a child slot; composite children become a link.
    fn child(&mut self, value: &Value, source: usize, edge: Edge) -> Literal {
        match value {
            Value::Node(node) => {
                let target = self.visit(node);
                trace!(source, target, ?edge, "link");
                self.links.push(Link {
                    source,
                    edge,
                    target,
                });
                Literal::Pending
            }
            other => self.literal(other),
        }
    }

    fn build_node(&mut self, index: usize, node: &NodeRef) {
        let (snapshot, delegate) = {
            let data = node.read();
            let snapshot = match &data.body {
                NodeBody::Array(items) => Snapshot::Array(items.clone()),
                NodeBody::Object(props) => Snapshot::Object(
                    props.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                ),
                NodeBody::Map(map) => {
                    Snapshot::Map(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                }
                NodeBody::Set(set) => Snapshot::Set(set.iter().cloned().collect()),
            };
            (snapshot, data.delegate.clone())
        };

        let instr = match snapshot {
            Snapshot::Array(items) => NodeInstr::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.child(item, index, Edge::ArrayElement(i)))
                    .collect(),
            ),
            Snapshot::Object(props) => NodeInstr::Object(self.object_entries(index, props)),
            Snapshot::Map(entries) => NodeInstr::Map(
                entries
                    .iter()
                    .enumerate()
                    .map(|(i, (key, value))| {
                        let key = self.child(key, index, Edge::MapKey(i));
                        let value = self.child(value, index, Edge::MapValue(i));
                        (key, value)
                    })
                    .collect(),
            ),
            Snapshot::Set(members) => NodeInstr::Set(
                members
                    .iter()
                    .enumerate()
                    .map(|(i, member)| self.child(member, index, Edge::SetMember(i)))
                    .collect(),
            ),
        };
        self.nodes[index] = Some(instr);

        if let Some(head) = delegate {
            let target = self.delegate_for(&head);
            self.links.push(Link {
                source: index,
                edge: Edge::PrototypeDelegate,
                target,
            });
        }
    }

    fn object_entries(&mut self, index: usize, props: Vec<(String, Value)>) -> Vec<(String, Literal)> {
        props
            .into_iter()
            .map(|(key, value)| {
                let literal = self.child(&value, index, Edge::ObjectProperty(key.clone()));
                (key, literal)
            })
            .collect()
    }

    /// Node standing in for the delegation chain starting at `head`.
    ///
    /// A single delegate keeps its identity; longer chains collapse into one
    /// synthesized object shared by every node delegating to the same head.
    fn delegate_for(&mut self, head: &NodeRef) -> usize {
        if head.delegate().is_none() {
            return self.visit(head);
        }
        if let Some(&index) = self.delegates.get(&head.identity()) {
            return index;
        }
        let index = self.reserve();
        self.delegates.insert(head.identity(), index);
        self.retained.push(head.clone());
        self.tails.push_back(Tail::Flattened {
            index,
            head: head.clone(),
        });
        index
    }

    fn build_flattened(&mut self, index: usize, head: &NodeRef) {
        let mut inherited: IndexMap<String, Value> = IndexMap::new();
        let mut seen = HashSet::new();
        let mut current = Some(head.clone());

        while let Some(node) = current {
            if !seen.insert(node.identity()) {
                break;
            }
            let data = node.read();
            if let NodeBody::Object(props) = &data.body {
                for (key, value) in props {
                    inherited.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            current = data.delegate.clone();
        }

        let props = inherited.into_iter().collect();
        let instr = NodeInstr::Object(self.object_entries(index, props));
        self.nodes[index] = Some(instr);
    }
}

/// Encode a value with a fresh [`GraphEncoder`].
pub fn encode(value: &Value) -> EncodedProgram {
    GraphEncoder::new().encode(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::codec::LinkKind;

    #[test]
    fn test_primitive_root_has_no_nodes() {
        let program = encode(&Value::Float(f64::NAN));
        assert!(program.nodes.is_empty());
        assert!(matches!(program.root, Slot::Literal(Literal::Float(f)) if f.is_nan()));
    }

    #[test]
    fn test_shared_child_encoded_once() {
        let shared = Value::object([("n", Value::Int(1))]);
        let root = Value::object([("a", shared.clone()), ("b", shared)]);
        let program = encode(&root);

        assert_eq!(program.node_count(), 2);
        let targets: Vec<_> = program.links.iter().map(|l| l.target).collect();
        assert_eq!(targets, vec![1, 1]);
        assert_eq!(
            program.nodes[0],
            NodeInstr::Object(vec![
                ("a".into(), Literal::Pending),
                ("b".into(), Literal::Pending),
            ])
        );
    }

    #[test]
    fn test_cycle_links_back_to_root() {
        let root = NodeRef::object([("name", Value::from("loop"))]);
        root.set("me", root.clone());
        let program = encode(&Value::Node(root.clone()));

        assert_eq!(program.node_count(), 1);
        assert_eq!(
            program.links,
            vec![Link {
                source: 0,
                edge: Edge::ObjectProperty("me".into()),
                target: 0,
            }]
        );
        root.clear();
    }

    #[test]
    fn test_indices_follow_breadth_first_order() {
        let leaf = Value::array([Value::Int(3)]);
        let root = Value::array([
            Value::object([("leaf", leaf)]),
            Value::set([Value::Int(1)]),
        ]);
        let program = encode(&root);

        assert!(matches!(program.nodes[1], NodeInstr::Object(_)));
        assert!(matches!(program.nodes[2], NodeInstr::Set(_)));
        assert!(matches!(program.nodes[3], NodeInstr::Array(_)));
    }

    #[test]
    fn test_map_keys_and_values_link_by_position() {
        let key = Value::object([("k", Value::Int(1))]);
        let map = Value::map([
            (Value::from("plain"), Value::Int(0)),
            (key, Value::array([])),
        ]);
        let program = encode(&map);

        let edges: Vec<_> = program.links.iter().map(|l| l.edge.clone()).collect();
        assert_eq!(edges, vec![Edge::MapKey(1), Edge::MapValue(1)]);
        assert_eq!(
            program.nodes[0],
            NodeInstr::Map(vec![
                (Literal::String("plain".into()), Literal::Int(0)),
                (Literal::Pending, Literal::Pending),
            ])
        );
    }

    #[test]
    fn test_single_delegate_keeps_identity() {
        let proto = NodeRef::object([("base", Value::function("base"))]);
        let a = NodeRef::object([("id", Value::Int(1))]);
        let b = NodeRef::object([("id", Value::Int(2))]);
        a.set_delegate(Some(proto.clone()));
        b.set_delegate(Some(proto.clone()));
        let root = Value::array([Value::Node(a), Value::Node(b), Value::Node(proto)]);
        let program = encode(&root);

        let delegates: Vec<_> = program.links_of(LinkKind::PrototypeDelegate).collect();
        assert_eq!(delegates.len(), 2);
        assert_eq!(delegates[0].target, delegates[1].target);
        // same index as the prototype reached as an array element
        let element = program
            .links
            .iter()
            .find(|l| l.edge == Edge::ArrayElement(2))
            .map(|l| l.target);
        assert_eq!(element, Some(delegates[0].target));
    }

    #[test]
    fn test_long_chain_flattens_nearest_first() {
        let grand = NodeRef::object([
            ("shared", Value::from("grand")),
            ("deep", Value::Int(1)),
        ]);
        let parent = NodeRef::object([("shared", Value::from("parent"))]);
        parent.set_delegate(Some(grand));
        let child = NodeRef::object(Vec::<(String, Value)>::new());
        child.set_delegate(Some(parent));

        let program = encode(&Value::Node(child));
        assert_eq!(program.node_count(), 2);
        assert_eq!(
            program.nodes[1],
            NodeInstr::Object(vec![
                ("shared".into(), Literal::String("parent".into())),
                ("deep".into(), Literal::Int(1)),
            ])
        );
        assert_eq!(program.links_of(LinkKind::PrototypeDelegate).count(), 1);
    }

    #[test]
    fn test_opaque_becomes_absent() {
        let root = Value::object([("handle", Value::opaque(5u8)), ("ok", Value::Bool(true))]);
        let program = encode(&root);
        assert_eq!(
            program.nodes[0],
            NodeInstr::Object(vec![
                ("handle".into(), Literal::Absent),
                ("ok".into(), Literal::Bool(true)),
            ])
        );
    }

    #[test]
    fn test_deep_list_encodes_iteratively() {
        let mut head = Value::Null;
        for i in 0..100_000 {
            head = Value::object([("value", Value::Int(i)), ("next", head)]);
        }
        let program = encode(&head);
        assert_eq!(program.node_count(), 100_000);
        assert_eq!(program.link_count(), 99_999);
    }
}
