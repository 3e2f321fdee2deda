// crates/portraitruntime/src/loader.rs

use portraitcore::{AssetError, GraphBindings, WorkflowGraph};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Read and validate the workflow template at `path`.
///
/// Called once per run; each caller gets its own copy of the graph.
pub async fn load_template(path: &Path, bindings: &GraphBindings) -> Result<WorkflowGraph, AssetError> {
    let json = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => AssetError::TemplateNotFound(path.display().to_string()),
        _ => AssetError::InvalidTemplate(format!("{}: {}", path.display(), e)),
    })?;

    let graph = parse_template(&json)?;
    validate_template(&graph, bindings)?;

    tracing::debug!(path = %path.display(), nodes = graph.len(), "Loaded workflow template");
    Ok(graph)
}

pub fn parse_template(json: &str) -> Result<WorkflowGraph, AssetError> {
    WorkflowGraph::from_json_str(json).map_err(|e| AssetError::InvalidTemplate(e.to_string()))
}

/// Structural checks: non-empty, links resolve, no cycles, bound nodes present
pub fn validate_template(graph: &WorkflowGraph, bindings: &GraphBindings) -> Result<(), AssetError> {
    if graph.is_empty() {
        return Err(AssetError::InvalidTemplate("workflow has no nodes".to_string()));
    }

    let mut dag = DiGraph::<&str, ()>::new();
    let mut node_to_index = HashMap::new();

    for (id, _) in graph.nodes() {
        let idx = dag.add_node(id.as_str());
        node_to_index.insert(id.as_str(), idx);
    }

    for (from, to) in graph.links() {
        let from_idx = node_to_index.get(from).ok_or_else(|| {
            AssetError::InvalidTemplate(format!("node '{}' links to unknown node '{}'", to, from))
        })?;
        let to_idx = node_to_index[to];
        dag.add_edge(*from_idx, to_idx, ());
    }

    if toposort(&dag, None).is_err() {
        return Err(AssetError::CyclicDependency);
    }

    bindings.check(graph)
}
