use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortraitError {
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PortraitError {
    /// Input errors are the caller's fault; everything else is ours or the engine's
    pub fn is_input_error(&self) -> bool {
        matches!(self, PortraitError::Request(_))
    }
}

/// Rejected before anything touches the filesystem
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("'{field}' must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("'{field}' must be at least {min}, got {value}")]
    BelowMinimum {
        field: &'static str,
        min: i64,
        value: i64,
    },

    #[error("'{field}' must be a finite number")]
    NotFinite { field: &'static str },

    #[error("Input file not found: {0}")]
    MissingFile(String),

    #[error("Input file not readable: {path}: {reason}")]
    UnreadableFile { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid workflow template: {0}")]
    InvalidTemplate(String),

    #[error("Node '{node_id}' ({role}) not present in workflow template")]
    MissingNode { node_id: String, role: &'static str },

    #[error("Cyclic dependency detected in workflow template")]
    CyclicDependency,

    #[error("Missing model weights: {}", .0.join(", "))]
    MissingWeights(Vec<String>),

    #[error("Failed to download weights '{name}': {reason}")]
    DownloadFailed { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to connect to engine at {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("Engine rejected workflow: {0}")]
    Rejected(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Engine did not start within {seconds}s")]
    StartupTimeout { seconds: u64 },

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Unexpected engine response: {0}")]
    Protocol(String),

    #[error("Engine directory {path}: {reason}")]
    Directory { path: String, reason: String },
}
