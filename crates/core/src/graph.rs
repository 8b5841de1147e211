use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{anyhow, bail, Result};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use serde::de::{Error as DeError, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

/// Reference to the `output`-th output of node `node`.
///
/// Serializes as the executor's `["<id>", <index>]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u32)", into = "(String, u32)")]
pub struct NodeRef {
    pub node: String,
    pub output: u32,
}

impl NodeRef {
    pub fn new(node: impl Into<String>, output: u32) -> Self {
        Self {
            node: node.into(),
            output,
        }
    }
}

impl From<(String, u32)> for NodeRef {
    fn from((node, output): (String, u32)) -> Self {
        Self { node, output }
    }
}

impl From<NodeRef> for (String, u32) {
    fn from(r: NodeRef) -> Self {
        (r.node, r.output)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.output)
    }
}

/// Id handed back by node insertion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn out(&self, output: u32) -> NodeRef {
        NodeRef::new(self.0.clone(), output)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Link(NodeRef),
}

impl InputValue {
    pub fn as_link(&self) -> Option<&NodeRef> {
        match self {
            Self::Link(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for InputValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for InputValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for InputValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for InputValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for InputValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for InputValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for InputValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<NodeRef> for InputValue {
    fn from(v: NodeRef) -> Self {
        Self::Link(v)
    }
}

impl From<&NodeRef> for InputValue {
    fn from(v: &NodeRef) -> Self {
        Self::Link(v.clone())
    }
}

pub type NodeInputs = BTreeMap<String, InputValue>;

/// Builds an input map from `(name, value)` pairs.
pub fn inputs<const N: usize>(pairs: [(&str, InputValue); N]) -> NodeInputs {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub class_type: String,
    pub inputs: NodeInputs,
}

impl NodeRecord {
    pub fn links(&self) -> impl Iterator<Item = &NodeRef> {
        self.inputs.values().filter_map(InputValue::as_link)
    }

    pub fn input(&self, name: &str) -> Option<&InputValue> {
        self.inputs.get(name)
    }

    pub fn link(&self, name: &str) -> Option<&NodeRef> {
        self.inputs.get(name).and_then(InputValue::as_link)
    }
}

#[derive(Debug, Clone)]
struct GraphNode {
    id: String,
    record: NodeRecord,
}

/// Workflow under construction: node records keyed by id, with an edge per
/// input link.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    graph: StableDiGraph<GraphNode, String>,
    node_ids: HashMap<String, NodeIndex>,
    order: Vec<String>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node. Every linked node must already be present.
    pub fn add_node(&mut self, id: impl Into<String>, record: NodeRecord) -> Result<NodeId> {
        let id = id.into();
        if self.node_ids.contains_key(&id) {
            bail!("duplicate node id: {id}");
        }

        let mut sources = Vec::new();
        for (input_name, value) in &record.inputs {
            let Some(link) = value.as_link() else {
                continue;
            };
            let source = self.node_ids.get(&link.node).copied().ok_or_else(|| {
                anyhow!(
                    "node '{id}' input '{input_name}' references unknown node id: {}",
                    link.node
                )
            })?;
            sources.push((source, input_name.clone()));
        }

        let index = self.graph.add_node(GraphNode {
            id: id.clone(),
            record,
        });
        for (source, input_name) in sources {
            self.graph.add_edge(source, index, input_name);
        }
        self.node_ids.insert(id.clone(), index);
        self.order.push(id.clone());
        Ok(NodeId(id))
    }

    /// Removes `id` when present and unreferenced. Returns whether it was removed.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let Some(index) = self.node_ids.get(id).copied() else {
            warn!(node = id, "Cannot remove node: not present");
            return false;
        };

        let referenced_by: Vec<&str> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|dependent| self.graph[dependent].id.as_str())
            .collect();
        if !referenced_by.is_empty() {
            warn!(
                node = id,
                referenced_by = ?referenced_by,
                "Cannot remove node: still referenced"
            );
            return false;
        }

        self.graph.remove_node(index);
        self.node_ids.remove(id);
        self.order.retain(|existing| existing != id);
        true
    }

    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.node_ids
            .get(id)
            .and_then(|idx| self.graph.node_weight(*idx))
            .map(|node| &node.record)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node_ids.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Node ids in insertion order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// `(id, record)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeRecord)> {
        self.order
            .iter()
            .filter_map(|id| self.get(id).map(|record| (id.as_str(), record)))
    }

    pub fn nodes_of_type<'a>(&'a self, class_type: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.iter()
            .filter(move |(_, record)| record.class_type == class_type)
            .map(|(id, _)| id)
    }

    pub fn count_of_type(&self, class_type: &str) -> usize {
        self.nodes_of_type(class_type).count()
    }

    /// Ids of nodes whose inputs link to `id`.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        let Some(index) = self.node_ids.get(id).copied() else {
            return Vec::new();
        };
        let mut out: Vec<&str> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|dependent| self.graph[dependent].id.as_str())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn execution_order(&self) -> Result<Vec<String>> {
        let sorted = toposort(&self.graph, None)
            .map_err(|_| anyhow!("cycle detected in workflow graph"))?;
        Ok(sorted
            .into_iter()
            .map(|idx| self.graph[idx].id.clone())
            .collect())
    }

    /// Checks that every link points at a node inserted before its user.
    pub fn validate_construction_order(&self) -> Result<()> {
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(pos, id)| (id.as_str(), pos))
            .collect();

        for (pos, (id, record)) in self.iter().enumerate() {
            for link in record.links() {
                match position.get(link.node.as_str()) {
                    Some(source_pos) if *source_pos < pos => {}
                    Some(_) => bail!("node '{id}' references later node '{}'", link.node),
                    None => bail!("node '{id}' references missing node '{}'", link.node),
                }
            }
        }
        self.execution_order()?;
        Ok(())
    }
}

impl Serialize for WorkflowGraph {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (id, record) in self.iter() {
            map.serialize_entry(id, record)?;
        }
        map.end()
    }
}

struct WorkflowGraphVisitor;

impl<'de> Visitor<'de> for WorkflowGraphVisitor {
    type Value = Vec<(String, NodeRecord)>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of node id to {class_type, inputs}")
    }

    fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = Vec::new();
        while let Some((id, record)) = access.next_entry::<String, NodeRecord>()? {
            entries.push((id, record));
        }
        Ok(entries)
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut pending = deserializer.deserialize_map(WorkflowGraphVisitor)?;
        let mut graph = WorkflowGraph::new();

        // Executor documents are not ordered, so insert whatever has all of
        // its links resolved until nothing is left.
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for (id, record) in pending {
                if record.links().all(|link| graph.contains(&link.node)) {
                    graph.add_node(id, record).map_err(D::Error::custom)?;
                } else {
                    deferred.push((id, record));
                }
            }
            if deferred.len() == before {
                let ids: Vec<&str> = deferred.iter().map(|(id, _)| id.as_str()).collect();
                return Err(D::Error::custom(format!(
                    "unresolvable references or cycle among nodes: {ids:?}"
                )));
            }
            pending = deferred;
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class_type: &str, inputs: NodeInputs) -> NodeRecord {
        NodeRecord {
            class_type: class_type.to_string(),
            inputs,
        }
    }

    fn sample_graph() -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        let loader = graph
            .add_node(
                "4",
                record(
                    "CheckpointLoaderSimple",
                    inputs([("ckpt_name", "model.safetensors".into())]),
                ),
            )
            .expect("loader should be added");
        graph
            .add_node(
                "6",
                record(
                    "CLIPTextEncode",
                    inputs([("clip", loader.out(1).into()), ("text", "a cat".into())]),
                ),
            )
            .expect("encode should be added");
        graph
    }

    #[test]
    fn test_duplicate_node_id_rejected() {
        let mut graph = sample_graph();
        let err = graph
            .add_node("4", record("VAEDecode", NodeInputs::new()))
            .expect_err("duplicate node id should error");
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let mut graph = WorkflowGraph::new();
        let err = graph
            .add_node(
                "8",
                record("VAEDecode", inputs([("samples", NodeRef::new("10", 0).into())])),
            )
            .expect_err("forward reference should error");
        assert!(err.to_string().contains("unknown node id: 10"));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_remove_referenced_node_refused() {
        let mut graph = sample_graph();
        assert!(!graph.remove_node("4"));
        assert!(graph.contains("4"));
        assert_eq!(graph.dependents("4"), vec!["6"]);
    }

    #[test]
    fn test_remove_missing_node_is_noop() {
        let mut graph = sample_graph();
        assert!(!graph.remove_node("30"));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_remove_leaf_node() {
        let mut graph = sample_graph();
        assert!(graph.remove_node("6"));
        assert_eq!(graph.ids(), ["4".to_string()]);
        assert!(graph.remove_node("4"));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_serializes_in_executor_format() {
        let graph = sample_graph();
        let value = serde_json::to_value(&graph).expect("graph should serialize");
        assert_eq!(value["6"]["class_type"], "CLIPTextEncode");
        assert_eq!(value["6"]["inputs"]["clip"], serde_json::json!(["4", 1]));
        assert_eq!(value["6"]["inputs"]["text"], "a cat");
    }

    #[test]
    fn test_deserialize_resolves_out_of_order_entries() {
        let json = r#"{
            "8": {"class_type": "VAEDecode", "inputs": {"samples": ["10", 0], "vae": ["4", 2]}},
            "10": {"class_type": "SwarmKSampler", "inputs": {"model": ["4", 0], "steps": 20, "cfg": 7.5}},
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "m"}}
        }"#;
        let graph: WorkflowGraph = serde_json::from_str(json).expect("graph should deserialize");
        assert_eq!(graph.len(), 3);
        graph
            .validate_construction_order()
            .expect("rebuilt graph should be in construction order");

        let sampler = graph.get("10").expect("sampler should exist");
        assert_eq!(sampler.input("steps"), Some(&InputValue::Int(20)));
        assert_eq!(sampler.input("cfg"), Some(&InputValue::Float(7.5)));
        assert_eq!(sampler.link("model"), Some(&NodeRef::new("4", 0)));
    }

    #[test]
    fn test_deserialize_rejects_dangling_reference() {
        let json = r#"{"8": {"class_type": "VAEDecode", "inputs": {"samples": ["99", 0]}}}"#;
        let err = serde_json::from_str::<WorkflowGraph>(json)
            .expect_err("dangling reference should fail");
        assert!(err.to_string().contains("unresolvable references"));
    }

    #[test]
    fn test_execution_order_follows_links() {
        let graph = sample_graph();
        let order = graph.execution_order().expect("graph should be acyclic");
        assert_eq!(order, vec!["4".to_string(), "6".to_string()]);
    }

    #[test]
    fn test_nodes_of_type() {
        let graph = sample_graph();
        assert_eq!(graph.count_of_type("CLIPTextEncode"), 1);
        assert_eq!(graph.nodes_of_type("VAEDecode").count(), 0);
    }
}
