use crate::engine::{Engine, EngineJob};
use crate::loader::load_template;
use crate::staging::{RunWorkspace, StagedInputs, DRIVING_PREFIX, FACE_PREFIX};
use portraitcore::{
    EngineError, EventBus, EventEmitter, GraphBindings, PatchSet, PortraitError, PredictionRequest,
    RunId, RunStage,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};

/// Runs one prediction through staging, patching, execution and collection
pub struct Predictor {
    engine: Arc<dyn Engine>,
    template_path: PathBuf,
    bindings: GraphBindings,
    staging_root: PathBuf,
    execution_timeout: Option<Duration>,
}

impl Predictor {
    pub fn new(
        engine: Arc<dyn Engine>,
        template_path: impl Into<PathBuf>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            template_path: template_path.into(),
            bindings: GraphBindings::default(),
            staging_root: staging_root.into(),
            execution_timeout: None,
        }
    }

    pub fn with_bindings(mut self, bindings: GraphBindings) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_timeout(mut self, execution_timeout: Option<Duration>) -> Self {
        self.execution_timeout = execution_timeout;
        self
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Run a validated request. Either every output is returned or nothing is.
    pub async fn predict(
        &self,
        request: &PredictionRequest,
        event_bus: &EventBus,
    ) -> Result<Prediction, PortraitError> {
        let run_id = RunId::new_v4();
        let events = event_bus.create_emitter(run_id);
        let start_time = Instant::now();

        events.started();
        tracing::info!(run_id = %run_id, engine = self.engine.name(), "Starting prediction");

        let mut stage = RunStage::Staging;
        let result = self.run_stages(request, &events, &mut stage).await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        match result {
            Ok(prediction) => {
                tracing::info!(
                    run_id = %run_id,
                    outputs = prediction.outputs.len(),
                    "Prediction completed in {}ms",
                    duration_ms
                );
                events.completed(prediction.outputs.clone(), duration_ms);
                Ok(prediction)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, stage = %stage, "Prediction failed: {}", e);
                events.failed(stage, e.to_string());
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        request: &PredictionRequest,
        events: &EventEmitter,
        stage: &mut RunStage,
    ) -> Result<Prediction, PortraitError> {
        enter(stage, RunStage::Staging, events);
        let workspace = RunWorkspace::create(&self.staging_root, events.run_id()).await?;

        enter(stage, RunStage::InputCopy, events);
        let inputs = StagedInputs {
            face_image: workspace.stage_input(request.face_image(), FACE_PREFIX).await?,
            driving_video: workspace.stage_input(request.driving_video(), DRIVING_PREFIX).await?,
        };

        enter(stage, RunStage::GraphLoad, events);
        let template = load_template(&self.template_path, &self.bindings).await?;

        enter(stage, RunStage::Patch, events);
        let graph = PatchSet::new(
            request.params(),
            inputs.face_image.name.as_str(),
            inputs.driving_video.name.as_str(),
        )
        .apply(&template, &self.bindings)?;

        enter(stage, RunStage::Execute, events);
        let job = EngineJob {
            graph: &graph,
            inputs: &inputs,
            workspace: &workspace,
            events,
        };
        match self.execution_timeout {
            Some(limit) => timeout(limit, self.engine.submit(job))
                .await
                .map_err(|_| EngineError::Timeout {
                    seconds: limit.as_secs(),
                })??,
            None => self.engine.submit(job).await?,
        }

        enter(stage, RunStage::Collect, events);
        let outputs = workspace.collect_outputs().await?;

        Ok(Prediction {
            run_id: events.run_id(),
            outputs,
            workspace,
        })
    }
}

fn enter(current: &mut RunStage, next: RunStage, events: &EventEmitter) {
    *current = next;
    tracing::debug!(run_id = %events.run_id(), stage = %next, "Entering stage");
    events.stage(next);
}

/// Outputs of a successful run.
///
/// The paths point into the run workspace, which is removed when this value
/// is dropped; use [`Prediction::persist_to`] or [`Prediction::keep`] to hold
/// on to the files.
#[derive(Debug)]
pub struct Prediction {
    run_id: RunId,
    outputs: Vec<PathBuf>,
    workspace: RunWorkspace,
}

impl Prediction {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    pub fn workspace(&self) -> &RunWorkspace {
        &self.workspace
    }

    /// Copy the outputs into `dir/<run id>/`, keeping order, and release the workspace
    pub async fn persist_to(self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let target_dir = dir.join(self.run_id.to_string());
        tokio::fs::create_dir_all(&target_dir).await?;

        let mut persisted = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let Some(name) = output.file_name() else {
                continue;
            };
            let target = target_dir.join(name);
            tokio::fs::copy(output, &target).await?;
            persisted.push(target);
        }
        Ok(persisted)
    }

    /// Leave the workspace on disk and return the output paths inside it
    pub fn keep(self) -> Vec<PathBuf> {
        let _ = self.workspace.keep();
        self.outputs
    }
}
