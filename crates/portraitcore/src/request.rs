use crate::RequestError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

pub const DSIZE_RANGE: (i64, i64) = (64, 2048);
pub const SCALE_RANGE: (f64, f64) = (1.0, 4.0);
pub const RATIO_RANGE: (f64, f64) = (-1.0, 1.0);
pub const MULTIPLIER_RANGE: (f64, f64) = (0.01, 10.0);

/// Tunable parameters of one prediction.
///
/// Field names on the wire match the prediction API (`video_*`,
/// `live_portrait_*`). Every field has a default, so a partial JSON object is
/// accepted and filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionParams {
    /// Maximum number of driving frames to load; 0 loads all of them
    #[serde(rename = "video_frame_load_cap")]
    pub frame_load_cap: i64,

    /// Take every nth driving frame; 1 keeps all of them
    #[serde(rename = "video_select_every_n_frames")]
    pub select_every_n_frames: i64,

    /// Size of the output image
    #[serde(rename = "live_portrait_dsize")]
    pub dsize: i64,

    /// Scaling factor for the face
    #[serde(rename = "live_portrait_scale")]
    pub scale: f64,

    #[serde(rename = "live_portrait_vx_ratio")]
    pub vx_ratio: f64,

    #[serde(rename = "live_portrait_vy_ratio")]
    pub vy_ratio: f64,

    #[serde(rename = "live_portrait_lip_zero")]
    pub lip_zero: bool,

    #[serde(rename = "live_portrait_eye_retargeting")]
    pub eye_retargeting: bool,

    #[serde(rename = "live_portrait_eyes_retargeting_multiplier")]
    pub eyes_retargeting_multiplier: f64,

    #[serde(rename = "live_portrait_lip_retargeting")]
    pub lip_retargeting: bool,

    #[serde(rename = "live_portrait_lip_retargeting_multiplier")]
    pub lip_retargeting_multiplier: f64,

    #[serde(rename = "live_portrait_stitching")]
    pub stitching: bool,

    /// Use relative positioning
    #[serde(rename = "live_portrait_relative")]
    pub relative: bool,
}

impl Default for PredictionParams {
    fn default() -> Self {
        Self {
            frame_load_cap: 64,
            select_every_n_frames: 1,
            dsize: 512,
            scale: 2.3,
            vx_ratio: 0.0,
            vy_ratio: -0.125,
            lip_zero: true,
            eye_retargeting: false,
            eyes_retargeting_multiplier: 1.0,
            lip_retargeting: false,
            lip_retargeting_multiplier: 1.0,
            stitching: true,
            relative: true,
        }
    }
}

impl PredictionParams {
    /// Check every field against its declared range
    pub fn validate(&self) -> Result<(), RequestError> {
        check_min("video_frame_load_cap", self.frame_load_cap, 0)?;
        check_min("video_select_every_n_frames", self.select_every_n_frames, 1)?;
        check_range("live_portrait_dsize", self.dsize as f64, DSIZE_RANGE.0 as f64, DSIZE_RANGE.1 as f64)?;
        check_range("live_portrait_scale", self.scale, SCALE_RANGE.0, SCALE_RANGE.1)?;
        check_range("live_portrait_vx_ratio", self.vx_ratio, RATIO_RANGE.0, RATIO_RANGE.1)?;
        check_range("live_portrait_vy_ratio", self.vy_ratio, RATIO_RANGE.0, RATIO_RANGE.1)?;
        check_range(
            "live_portrait_eyes_retargeting_multiplier",
            self.eyes_retargeting_multiplier,
            MULTIPLIER_RANGE.0,
            MULTIPLIER_RANGE.1,
        )?;
        check_range(
            "live_portrait_lip_retargeting_multiplier",
            self.lip_retargeting_multiplier,
            MULTIPLIER_RANGE.0,
            MULTIPLIER_RANGE.1,
        )?;
        Ok(())
    }
}

fn check_min(field: &'static str, value: i64, min: i64) -> Result<(), RequestError> {
    if value < min {
        return Err(RequestError::BelowMinimum { field, min, value });
    }
    Ok(())
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), RequestError> {
    if !value.is_finite() {
        return Err(RequestError::NotFinite { field });
    }
    if value < min || value > max {
        return Err(RequestError::OutOfRange { field, min, max, value });
    }
    Ok(())
}

/// A validated prediction request.
///
/// Only obtainable through [`PredictionRequest::new`], so holding one means
/// both input files were readable and every parameter was in range when it
/// was built.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    face_image: PathBuf,
    driving_video: PathBuf,
    params: PredictionParams,
}

impl PredictionRequest {
    pub fn new(
        face_image: impl Into<PathBuf>,
        driving_video: impl Into<PathBuf>,
        params: PredictionParams,
    ) -> Result<Self, RequestError> {
        params.validate()?;

        let face_image = face_image.into();
        let driving_video = driving_video.into();
        check_readable(&face_image)?;
        check_readable(&driving_video)?;

        Ok(Self {
            face_image,
            driving_video,
            params,
        })
    }

    pub fn face_image(&self) -> &Path {
        &self.face_image
    }

    pub fn driving_video(&self) -> &Path {
        &self.driving_video
    }

    pub fn params(&self) -> &PredictionParams {
        &self.params
    }
}

fn check_readable(path: &Path) -> Result<(), RequestError> {
    if !path.is_file() {
        return Err(RequestError::MissingFile(path.display().to_string()));
    }
    File::open(path).map_err(|e| RequestError::UnreadableFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Wire form of a prediction request: file paths plus flattened parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionInput {
    pub face_image: PathBuf,
    pub driving_video: PathBuf,
    #[serde(flatten)]
    pub params: PredictionParams,
}

impl TryFrom<PredictionInput> for PredictionRequest {
    type Error = RequestError;

    fn try_from(input: PredictionInput) -> Result<Self, Self::Error> {
        PredictionRequest::new(input.face_image, input.driving_video, input.params)
    }
}
