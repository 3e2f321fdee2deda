use crate::InputValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node identifiers are the string keys of the API-format graph ("8", "30", ...)
pub type NodeId = String;

/// API-format workflow graph: node id -> node record
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<NodeId, GraphNode>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn add_node(&mut self, id: impl Into<NodeId>, node: GraphNode) {
        self.nodes.insert(id.into(), node);
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut GraphNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &GraphNode)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All `(from, to)` edges implied by link inputs
    pub fn links(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .flat_map(|(id, node)| {
                node.inputs
                    .values()
                    .filter_map(InputValue::as_link)
                    .map(move |(from, _)| (from, id.as_str()))
            })
            .collect()
    }
}

/// A single node record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub class_type: String,
    pub inputs: BTreeMap<String, InputValue>,
    /// Anything else the exporter wrote (`_meta`, ...), passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GraphNode {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn with_link(mut self, name: impl Into<String>, from: impl Into<NodeId>, slot: u32) -> Self {
        self.inputs.insert(name.into(), InputValue::Link(from.into(), slot));
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputValue> {
        self.inputs.get(name)
    }

    pub fn set_input(&mut self, name: impl Into<String>, value: impl Into<InputValue>) {
        self.inputs.insert(name.into(), value.into());
    }
}
