use crate::staging::{RunWorkspace, StagedInputs};
use async_trait::async_trait;
use portraitcore::{EngineError, EventEmitter, WorkflowGraph};

/// Everything an engine gets for one run
pub struct EngineJob<'a> {
    /// The patched graph
    pub graph: &'a WorkflowGraph,
    /// Files already copied into the workspace input directory
    pub inputs: &'a StagedInputs,
    /// Outputs must end up in `workspace.output_dir()`
    pub workspace: &'a RunWorkspace,
    pub events: &'a EventEmitter,
}

/// The external workflow engine, seen from this side as a black box
#[async_trait]
pub trait Engine: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Run the graph to completion. Returns once the engine reports success
    /// and every output file has been written to the workspace output
    /// directory, or with the engine's error.
    async fn submit(&self, job: EngineJob<'_>) -> Result<(), EngineError>;

    /// Optional: check the engine is reachable
    async fn health(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
