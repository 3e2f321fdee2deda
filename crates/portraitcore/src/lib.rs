//! Core types for the portrait prediction endpoint
//!
//! Workflow graph model, prediction requests and their validation, the
//! parameter patch, run events and the error taxonomy. Everything that touches
//! the filesystem or the engine lives in `portraitruntime` and
//! `portraitengine`.

mod error;
pub mod events;
mod graph;
pub mod patch;
mod request;
mod value;

pub use error::{AssetError, EngineError, PortraitError, RequestError};
pub use events::*;
pub use graph::{GraphNode, NodeId, WorkflowGraph};
pub use patch::{GraphBindings, PatchSet};
pub use request::{
    PredictionInput, PredictionParams, PredictionRequest, DSIZE_RANGE, MULTIPLIER_RANGE,
    RATIO_RANGE, SCALE_RANGE,
};
pub use value::InputValue;

/// Result type for portrait operations
pub type Result<T> = std::result::Result<T, PortraitError>;
