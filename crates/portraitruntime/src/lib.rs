//! Prediction runtime
//!
//! Per-run staging workspaces, template loading, the engine abstraction and
//! the predictor that drives a request from staging to collected outputs.

mod engine;
mod executor;
mod loader;
mod runtime;
pub mod staging;
mod weights;

pub use engine::{Engine, EngineJob};
pub use executor::{Prediction, Predictor};
pub use loader::{load_template, parse_template, validate_template};
pub use runtime::{EngineLaunch, PortraitRuntime, RuntimeConfig};
pub use staging::{RunWorkspace, StagedFile, StagedInputs};
pub use weights::{WeightManifest, LIVE_PORTRAIT_WEIGHTS};
