use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

/// Steps of a single prediction run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Staging,
    InputCopy,
    GraphLoad,
    Patch,
    Execute,
    Collect,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Staging => "staging",
            RunStage::InputCopy => "input_copy",
            RunStage::GraphLoad => "graph_load",
            RunStage::Patch => "patch",
            RunStage::Execute => "execute",
            RunStage::Collect => "collect",
        };
        f.write_str(name)
    }
}

/// Events emitted while a prediction runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
    StageEntered {
        run_id: RunId,
        stage: RunStage,
        timestamp: DateTime<Utc>,
    },
    EngineQueued {
        run_id: RunId,
        prompt_id: String,
        timestamp: DateTime<Utc>,
    },
    EngineProgress {
        run_id: RunId,
        message: String,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        outputs: Vec<PathBuf>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        stage: RunStage,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StageEntered { run_id, .. }
            | RunEvent::EngineQueued { run_id, .. }
            | RunEvent::EngineProgress { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. } => *run_id,
        }
    }
}

/// Emitter bound to a single run
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    sender: broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(run_id: RunId, sender: broadcast::Sender<RunEvent>) -> Self {
        Self { run_id, sender }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn emit(&self, event: RunEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn started(&self) {
        self.emit(RunEvent::RunStarted {
            run_id: self.run_id,
            timestamp: Utc::now(),
        });
    }

    pub fn stage(&self, stage: RunStage) {
        self.emit(RunEvent::StageEntered {
            run_id: self.run_id,
            stage,
            timestamp: Utc::now(),
        });
    }

    /// The engine accepted the graph and queued it under `prompt_id`
    pub fn queued(&self, prompt_id: impl Into<String>) {
        self.emit(RunEvent::EngineQueued {
            run_id: self.run_id,
            prompt_id: prompt_id.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.emit(RunEvent::EngineProgress {
            run_id: self.run_id,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn completed(&self, outputs: Vec<PathBuf>, duration_ms: u64) {
        self.emit(RunEvent::RunCompleted {
            run_id: self.run_id,
            outputs,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn failed(&self, stage: RunStage, error: impl Into<String>) {
        self.emit(RunEvent::RunFailed {
            run_id: self.run_id,
            stage,
            error: error.into(),
            timestamp: Utc::now(),
        });
    }
}

/// Process-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, run_id: RunId) -> EventEmitter {
        EventEmitter::new(run_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
