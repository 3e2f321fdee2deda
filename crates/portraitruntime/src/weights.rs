use portraitcore::AssetError;
use std::path::{Path, PathBuf};

/// Model files the LivePortrait nodes load at execution time
pub const LIVE_PORTRAIT_WEIGHTS: &[&str] = &[
    "appearance_feature_extractor.safetensors",
    "landmark.onnx",
    "motion_extractor.safetensors",
    "spade_generator.safetensors",
    "stitching_retargeting_module.safetensors",
    "warping_module.safetensors",
];

/// Named weight files the engine needs before the first run
#[derive(Debug, Clone)]
pub struct WeightManifest {
    names: Vec<String>,
}

impl WeightManifest {
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn live_portrait() -> Self {
        Self::new(LIVE_PORTRAIT_WEIGHTS.iter().copied())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn path_of(&self, weights_dir: &Path, name: &str) -> PathBuf {
        weights_dir.join(name)
    }

    /// Names whose file is not present in `weights_dir`
    pub fn missing(&self, weights_dir: &Path) -> Vec<String> {
        self.names
            .iter()
            .filter(|name| !self.path_of(weights_dir, name).is_file())
            .cloned()
            .collect()
    }

    pub fn require(&self, weights_dir: &Path) -> Result<(), AssetError> {
        let missing = self.missing(weights_dir);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AssetError::MissingWeights(missing))
        }
    }
}

impl Default for WeightManifest {
    fn default() -> Self {
        Self::live_portrait()
    }
}
