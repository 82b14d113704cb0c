//! Row identity generation and natural-id discovery.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MeltError, Result};
use crate::melt::node::{Document, Node, NodeId};

/// Namespace for all deterministic ids, so equal content gives equal ids
/// across processes.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b69_6c6e_2d6d_656c_742d_6964_2d6e_7331);

/// Stands in for a composite field that the node does not have.
const ABSENT_MARKER: &str = "\u{0}absent";

/// Written in place of a back-reference when canonicalizing a cyclic node.
const CYCLE_MARKER: &str = "\u{0}cycle";

/// Represents a unique identifier for a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityId(pub Value);

impl EntityId {
    pub fn new(id: impl Into<Value>) -> Self {
        EntityId(id.into())
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

/// How a row's identity is produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdStrategy {
    /// A fresh v4 UUID per row.
    #[default]
    Random,
    /// The value of a required field of the node.
    Natural { field: String },
    /// A UUID derived from the canonical form of the whole node.
    Hash,
    /// A UUID derived from the canonical form of the listed fields only.
    Composite { fields: Vec<String> },
}

impl IdStrategy {
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, IdStrategy::Random)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            IdStrategy::Natural { field } if field.is_empty() => {
                Err(MeltError::config("natural identity needs a field name"))
            }
            IdStrategy::Composite { fields } if fields.is_empty() => {
                Err(MeltError::config("composite identity needs at least one field"))
            }
            _ => Ok(()),
        }
    }

    /// Identity for `node`. `path` is only used for error context.
    pub fn generate(&self, doc: &Document, node: NodeId, path: &[String]) -> Result<EntityId> {
        match self {
            IdStrategy::Random => Ok(random_id()),
            IdStrategy::Hash => Ok(hashed_id(&canonical(doc, node))),
            IdStrategy::Composite { fields } => Ok(hashed_id(&canonical_fields(doc, node, fields))),
            IdStrategy::Natural { field } => {
                let value = doc
                    .get(node, field)
                    .map(|id| doc.node(id))
                    .ok_or_else(|| {
                        MeltError::processing(path, format!("missing natural id field '{field}'"))
                    })?;
                usable_id(value).ok_or_else(|| {
                    MeltError::processing(
                        path,
                        format!("natural id field '{field}' is {}", describe_unusable(value)),
                    )
                })
            }
        }
    }
}

impl FromStr for IdStrategy {
    type Err = MeltError;

    /// `random`, `hash`, `natural:FIELD` or `composite:A,B,...`
    fn from_str(s: &str) -> Result<Self> {
        let (kind, arg) = match s.split_once(':') {
            Some((k, a)) => (k, Some(a)),
            None => (s, None),
        };
        let strategy = match (kind.to_ascii_lowercase().as_str(), arg) {
            ("random", None) => IdStrategy::Random,
            ("hash", None) => IdStrategy::Hash,
            ("natural", Some(field)) => IdStrategy::Natural {
                field: field.trim().to_string(),
            },
            ("composite", Some(fields)) => IdStrategy::Composite {
                fields: fields
                    .split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect(),
            },
            _ => return Err(MeltError::config(format!("unknown identity strategy '{s}'"))),
        };
        strategy.validate()?;
        Ok(strategy)
    }
}

pub fn random_id() -> EntityId {
    EntityId::new(Uuid::new_v4().to_string())
}

/// UUID-shaped id derived from arbitrary canonical text.
pub fn hashed_id(canonical: &str) -> EntityId {
    EntityId::new(Uuid::new_v5(&ID_NAMESPACE, canonical.as_bytes()).to_string())
}

/// Identity for an array element that is not a map and so has no fields to
/// look up. Deterministic strategies hash the owner, position and content.
pub fn positional_id(
    strategy: &IdStrategy,
    doc: &Document,
    node: NodeId,
    owner: &EntityId,
    index: usize,
) -> EntityId {
    match strategy {
        IdStrategy::Random => random_id(),
        _ => hashed_id(&format!(
            "{}\u{1f}{index}\u{1f}{}",
            owner.value(),
            canonical(doc, node)
        )),
    }
}

/// A scalar that can serve as an identity: not null, not an empty string.
fn usable_id(node: &Node) -> Option<EntityId> {
    if node.is_blank() {
        return None;
    }
    node.to_scalar_value().map(EntityId)
}

fn describe_unusable(node: &Node) -> &'static str {
    match node {
        Node::Null => "null",
        Node::String(_) => "empty",
        Node::List(_) | Node::Map(_) => "not a scalar",
        _ => "unusable",
    }
}

/// Key-order independent serialization of a node. Back-references to nodes
/// on the current path are written as a fixed marker.
pub fn canonical(doc: &Document, node: NodeId) -> String {
    let mut out = String::new();
    let mut active = Vec::new();
    write_canonical(doc, node, &mut active, &mut out);
    out
}

/// Canonical form of only the listed fields, absent ones as a fixed marker.
pub fn canonical_fields(doc: &Document, node: NodeId, fields: &[String]) -> String {
    let mut selected: Vec<&String> = fields.iter().collect();
    selected.sort();
    selected.dedup();

    let mut out = String::from("{");
    let mut active = vec![node];
    for (i, field) in selected.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(field, &mut out);
        out.push(':');
        match doc.get(node, field) {
            Some(child) => write_canonical(doc, child, &mut active, &mut out),
            None => write_string(ABSENT_MARKER, &mut out),
        }
    }
    out.push('}');
    out
}

fn write_canonical(doc: &Document, id: NodeId, active: &mut Vec<NodeId>, out: &mut String) {
    if active.contains(&id) {
        write_string(CYCLE_MARKER, out);
        return;
    }
    match doc.node(id) {
        Node::List(items) => {
            active.push(id);
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(doc, *item, active, out);
            }
            out.push(']');
            active.pop();
        }
        Node::Map(entries) => {
            active.push(id);
            let sorted: BTreeMap<&str, NodeId> =
                entries.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            out.push('{');
            for (i, (key, child)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(doc, child, active, out);
            }
            out.push('}');
            active.pop();
        }
        Node::Float(f) => {
            let _ = write!(out, "{f:?}");
        }
        scalar => {
            if let Some(value) = scalar.to_scalar_value() {
                out.push_str(&value.to_string());
            }
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

/// Heuristic lookup of an existing identity field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdDiscovery {
    pub enabled: bool,
    /// Exact table name -> field. The key `*` is the wildcard default.
    pub fields: BTreeMap<String, String>,
    /// Candidate field names in priority order, matched case-insensitively
    pub patterns: Vec<String>,
    /// Also add a synthetic id when a natural one is found
    pub force_synthetic: bool,
}

impl Default for IdDiscovery {
    fn default() -> Self {
        IdDiscovery {
            enabled: false,
            fields: BTreeMap::new(),
            patterns: ["id", "uuid", "guid", "_id", "key", "sku", "code", "identifier"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            force_synthetic: false,
        }
    }
}

/// The natural identity found on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalId {
    /// Raw key of the field
    pub field: String,
    pub id: EntityId,
}

impl IdDiscovery {
    pub const WILDCARD: &'static str = "*";

    /// Find a usable identity field on `node` for rows of `table`.
    pub fn discover(&self, doc: &Document, node: NodeId, table: &str) -> Option<NaturalId> {
        if !self.enabled {
            return None;
        }
        let Node::Map(entries) = doc.node(node) else {
            return None;
        };

        let candidate = |key: &str| -> Option<NaturalId> {
            let (raw, child) = entries.iter().find(|(k, _)| k == key)?;
            usable_id(doc.node(*child)).map(|id| NaturalId {
                field: raw.clone(),
                id,
            })
        };

        if let Some(field) = self.fields.get(table) {
            if let Some(found) = candidate(field.as_str()) {
                return Some(found);
            }
        }
        if let Some(field) = self.fields.get(Self::WILDCARD) {
            if let Some(found) = candidate(field.as_str()) {
                return Some(found);
            }
        }
        for pattern in &self.patterns {
            let matched = entries
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(pattern))
                .find_map(|(k, _)| candidate(k.as_str()));
            if matched.is_some() {
                return matched;
            }
        }
        None
    }
}
