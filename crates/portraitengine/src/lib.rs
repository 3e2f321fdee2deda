//! Engine integrations
//!
//! The ComfyUI HTTP client that executes workflow graphs, the launcher for a
//! local engine server, and weight provisioning.

mod comfy;
mod process;
mod weights;

pub use comfy::{ComfyEngine, HistoryEntry, OutputFile, PromptStatus};
pub use process::{EngineProcess, OFFLINE_ENV};
pub use weights::ensure_weights;
