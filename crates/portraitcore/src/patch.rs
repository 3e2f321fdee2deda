//! Parameter injection into the workflow template.
//!
//! The set of fields written here is closed: a [`PatchSet`] can only be built
//! from validated [`PredictionParams`] and the staged input names, and each of
//! its fields maps to exactly one `(node, input)` pair listed below.

use crate::{AssetError, GraphNode, InputValue, NodeId, PredictionParams, WorkflowGraph};
use serde::{Deserialize, Serialize};

// Video loader inputs
pub const VIDEO: &str = "video";
pub const FRAME_LOAD_CAP: &str = "frame_load_cap";
pub const SELECT_EVERY_N_FRAMES: &str = "select_every_n_frames";

// Animation node inputs
pub const DSIZE: &str = "dsize";
pub const SCALE: &str = "scale";
pub const VX_RATIO: &str = "vx_ratio";
pub const VY_RATIO: &str = "vy_ratio";
pub const LIP_ZERO: &str = "lip_zero";
pub const EYE_RETARGETING: &str = "eye_retargeting";
pub const EYES_RETARGETING_MULTIPLIER: &str = "eyes_retargeting_multiplier";
pub const LIP_RETARGETING: &str = "lip_retargeting";
pub const LIP_RETARGETING_MULTIPLIER: &str = "lip_retargeting_multiplier";
pub const STITCHING: &str = "stitching";
pub const RELATIVE: &str = "relative";

// Image loader input
pub const IMAGE: &str = "image";

/// Which template nodes receive the patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphBindings {
    pub video_loader: NodeId,
    pub animator: NodeId,
    /// Image loader that reads the staged face; `None` leaves it untouched
    pub face_loader: Option<NodeId>,
}

impl Default for GraphBindings {
    fn default() -> Self {
        Self {
            video_loader: "8".to_string(),
            animator: "30".to_string(),
            face_loader: Some("4".to_string()),
        }
    }
}

impl GraphBindings {
    /// Every bound node must exist in the graph
    pub fn check(&self, graph: &WorkflowGraph) -> Result<(), AssetError> {
        require_node(graph, &self.video_loader, "video loader")?;
        require_node(graph, &self.animator, "animator")?;
        if let Some(face_loader) = &self.face_loader {
            require_node(graph, face_loader, "face loader")?;
        }
        Ok(())
    }
}

fn require_node<'a>(
    graph: &'a WorkflowGraph,
    node_id: &str,
    role: &'static str,
) -> Result<&'a GraphNode, AssetError> {
    graph.node(node_id).ok_or_else(|| AssetError::MissingNode {
        node_id: node_id.to_string(),
        role,
    })
}

/// The values written into the template for one run
#[derive(Debug, Clone, PartialEq)]
pub struct PatchSet {
    face_image: String,
    driving_video: String,
    params: PredictionParams,
}

impl PatchSet {
    pub fn new(
        params: &PredictionParams,
        face_image: impl Into<String>,
        driving_video: impl Into<String>,
    ) -> Self {
        Self {
            face_image: face_image.into(),
            driving_video: driving_video.into(),
            params: params.clone(),
        }
    }

    /// `(input, value)` pairs for the face image loader node
    pub fn face_loader_fields(&self) -> Vec<(&'static str, InputValue)> {
        vec![(IMAGE, self.face_image.clone().into())]
    }

    /// `(input, value)` pairs for the video loader node
    pub fn video_loader_fields(&self) -> Vec<(&'static str, InputValue)> {
        vec![
            (VIDEO, self.driving_video.clone().into()),
            (FRAME_LOAD_CAP, self.params.frame_load_cap.into()),
            (SELECT_EVERY_N_FRAMES, self.params.select_every_n_frames.into()),
        ]
    }

    /// `(input, value)` pairs for the animation node
    pub fn animator_fields(&self) -> Vec<(&'static str, InputValue)> {
        let p = &self.params;
        vec![
            (DSIZE, p.dsize.into()),
            (SCALE, p.scale.into()),
            (VX_RATIO, p.vx_ratio.into()),
            (VY_RATIO, p.vy_ratio.into()),
            (LIP_ZERO, p.lip_zero.into()),
            (EYE_RETARGETING, p.eye_retargeting.into()),
            (EYES_RETARGETING_MULTIPLIER, p.eyes_retargeting_multiplier.into()),
            (LIP_RETARGETING, p.lip_retargeting.into()),
            (LIP_RETARGETING_MULTIPLIER, p.lip_retargeting_multiplier.into()),
            (STITCHING, p.stitching.into()),
            (RELATIVE, p.relative.into()),
        ]
    }

    /// Patch a copy of `template`. The template itself is never touched.
    pub fn apply(
        &self,
        template: &WorkflowGraph,
        bindings: &GraphBindings,
    ) -> Result<WorkflowGraph, AssetError> {
        let mut graph = template.clone();
        self.apply_in_place(&mut graph, bindings)?;
        Ok(graph)
    }

    /// Patch `graph` directly. Fails without writing anything if a bound node is missing.
    pub fn apply_in_place(
        &self,
        graph: &mut WorkflowGraph,
        bindings: &GraphBindings,
    ) -> Result<(), AssetError> {
        bindings.check(graph)?;

        write_fields(graph, &bindings.video_loader, self.video_loader_fields());
        write_fields(graph, &bindings.animator, self.animator_fields());
        if let Some(face_loader) = &bindings.face_loader {
            write_fields(graph, face_loader, self.face_loader_fields());
        }

        tracing::debug!(
            video_loader = %bindings.video_loader,
            animator = %bindings.animator,
            face_loader = ?bindings.face_loader,
            "Patched workflow graph"
        );
        Ok(())
    }
}

fn write_fields(graph: &mut WorkflowGraph, node_id: &str, fields: Vec<(&'static str, InputValue)>) {
    if let Some(node) = graph.node_mut(node_id) {
        for (name, value) in fields {
            node.set_input(name, value);
        }
    }
}
