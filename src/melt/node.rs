//! Arena representation of input records.
//!
//! Source typing is resolved once into the closed [`Node`] tag set. Containers
//! refer to their children by [`NodeId`], so shared and cyclic structures can
//! be expressed and cycle detection reduces to "is this index already on the
//! active path".

use serde_json::{Number, Value};

/// Index of a node inside a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<NodeId>),
    Map(Vec<(String, NodeId)>),
}

impl Node {
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Node::List(_) | Node::Map(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Node::Null)
    }

    /// Null or an empty string.
    pub fn is_blank(&self) -> bool {
        match self {
            Node::Null => true,
            Node::String(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Node::Null => "null",
            Node::Bool(_) => "bool",
            Node::Int(_) => "int",
            Node::Float(_) => "float",
            Node::String(_) => "string",
            Node::List(_) => "list",
            Node::Map(_) => "map",
        }
    }

    /// JSON scalar for this node, `None` for containers.
    pub fn to_scalar_value(&self) -> Option<Value> {
        let value = match self {
            Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(*b),
            Node::Int(i) => Value::Number((*i).into()),
            Node::Float(f) => match Number::from_f64(*f) {
                Some(n) => Value::Number(n),
                None => Value::String(f.to_string()),
            },
            Node::String(s) => Value::String(s.clone()),
            Node::List(_) | Node::Map(_) => return None,
        };
        Some(value)
    }
}

/// One record held as an arena of nodes.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Document {
    /// A document whose root is the given node.
    pub fn new(root: Node) -> Self {
        Document {
            nodes: vec![root],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a detached node and return its id.
    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Set `key` on a map node, replacing an existing entry with the same key.
    /// Returns false if `map` is not a map.
    pub fn insert_entry(&mut self, map: NodeId, key: impl Into<String>, child: NodeId) -> bool {
        let key = key.into();
        let Node::Map(entries) = &mut self.nodes[map.0] else {
            return false;
        };
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = child,
            None => entries.push((key, child)),
        }
        true
    }

    /// Append an item to a list node. Returns false if `list` is not a list.
    pub fn push_item(&mut self, list: NodeId, child: NodeId) -> bool {
        let Node::List(items) = &mut self.nodes[list.0] else {
            return false;
        };
        items.push(child);
        true
    }

    /// Look up a key on a map node.
    pub fn get(&self, map: NodeId, key: &str) -> Option<NodeId> {
        match self.node(map) {
            Node::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, id)| *id),
            _ => None,
        }
    }

    fn ingest(&mut self, value: Value) -> NodeId {
        let node = match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Node::Int(i),
                None => Node::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Node::String(s),
            Value::Array(items) => {
                let ids = items.into_iter().map(|item| self.ingest(item)).collect();
                Node::List(ids)
            }
            Value::Object(obj) => {
                let entries = obj.into_iter().map(|(k, v)| (k, self.ingest(v))).collect();
                Node::Map(entries)
            }
        };
        self.push(node)
    }
}

impl From<Value> for Document {
    fn from(value: Value) -> Self {
        let mut doc = Document {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        doc.root = doc.ingest(value);
        doc
    }
}
