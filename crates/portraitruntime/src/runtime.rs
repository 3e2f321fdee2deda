use crate::engine::Engine;
use crate::executor::{Prediction, Predictor};
use crate::weights::WeightManifest;
use portraitcore::{AssetError, EventBus, GraphBindings, PortraitError, PredictionRequest, RunEvent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;

/// Main runtime for serving predictions
pub struct PortraitRuntime {
    config: RuntimeConfig,
    predictor: Predictor,
    event_bus: Arc<EventBus>,
    weights: WeightManifest,
}

impl PortraitRuntime {
    pub fn new(config: RuntimeConfig, engine: Arc<dyn Engine>) -> Self {
        let predictor = Predictor::new(engine, &config.template_path, &config.staging_root)
            .with_bindings(config.bindings.clone())
            .with_timeout(config.execution_timeout());
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            config,
            predictor,
            event_bus,
            weights: WeightManifest::live_portrait(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn weights(&self) -> &WeightManifest {
        &self.weights
    }

    /// Fail if any required weight file is missing from the weights directory
    pub fn check_weights(&self) -> Result<(), AssetError> {
        self.weights.require(&self.config.weights_dir)
    }

    /// Check the engine is up
    pub async fn health(&self) -> Result<(), PortraitError> {
        self.predictor.engine().health().await?;
        Ok(())
    }

    pub async fn predict(&self, request: &PredictionRequest) -> Result<Prediction, PortraitError> {
        self.predictor.predict(request, &self.event_bus).await
    }

    /// Subscribe to run events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// How to start the engine server when it is not already running
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Engine scratch directory, emptied before the server starts
    pub temp_dir: PathBuf,
    pub startup_timeout_secs: u64,
}

impl Default for EngineLaunch {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python"),
            args: vec!["main.py".to_string()],
            working_dir: PathBuf::from("ComfyUI"),
            input_dir: PathBuf::from("/tmp/inputs"),
            output_dir: PathBuf::from("/tmp/outputs"),
            temp_dir: PathBuf::from("ComfyUI/temp"),
            startup_timeout_secs: 300,
        }
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `host:port` of the engine's HTTP API
    pub engine_address: String,
    pub template_path: PathBuf,
    /// Per-run workspaces are created under here
    pub staging_root: PathBuf,
    pub weights_dir: PathBuf,
    /// Missing weights are fetched from `<weights_url>/<name>` when set
    pub weights_url: Option<String>,
    pub bindings: GraphBindings,
    pub poll_interval_ms: u64,
    /// No limit unless set
    pub execution_timeout_secs: Option<u64>,
    pub event_buffer_size: usize,
    pub engine_launch: Option<EngineLaunch>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine_address: "127.0.0.1:8188".to_string(),
            template_path: PathBuf::from("workflow_api.json"),
            staging_root: std::env::temp_dir().join("portrait"),
            weights_dir: PathBuf::from("ComfyUI/models/liveportrait"),
            weights_url: None,
            bindings: GraphBindings::default(),
            poll_interval_ms: 500,
            execution_timeout_secs: None,
            event_buffer_size: 1000,
            engine_launch: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults, overlaid with `path` if given, overlaid with the environment
    pub fn load(path: Option<&Path>) -> Result<Self, PortraitError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env()
    }

    pub fn from_file(path: &Path) -> Result<Self, PortraitError> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `PORTRAIT_*` environment overrides
    pub fn with_env(self) -> Result<Self, PortraitError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PortraitError> {
        if let Some(address) = lookup("PORTRAIT_ENGINE_ADDRESS") {
            self.engine_address = address;
        }
        if let Some(template) = lookup("PORTRAIT_TEMPLATE") {
            self.template_path = PathBuf::from(template);
        }
        if let Some(root) = lookup("PORTRAIT_STAGING_ROOT") {
            self.staging_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("PORTRAIT_WEIGHTS_DIR") {
            self.weights_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("PORTRAIT_WEIGHTS_URL") {
            self.weights_url = Some(url);
        }
        if let Some(secs) = lookup("PORTRAIT_EXECUTION_TIMEOUT") {
            let secs = secs.trim().parse().map_err(|e| {
                PortraitError::Config(format!("PORTRAIT_EXECUTION_TIMEOUT '{}': {}", secs, e))
            })?;
            self.execution_timeout_secs = Some(secs);
        }
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }
}
