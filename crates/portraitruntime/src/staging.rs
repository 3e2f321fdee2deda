use portraitcore::{RequestError, RunId};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

pub const FACE_PREFIX: &str = "face";
pub const DRIVING_PREFIX: &str = "driving";

/// Scratch space owned by a single run.
///
/// Lives in its own uniquely named directory under the staging root and is
/// removed when dropped, so concurrent runs never see each other's files.
#[derive(Debug)]
pub struct RunWorkspace {
    run_id: RunId,
    root: TempDir,
    input_dir: PathBuf,
    output_dir: PathBuf,
    temp_dir: PathBuf,
}

impl RunWorkspace {
    /// Allocate a fresh workspace under `staging_root`, creating the root if needed
    pub async fn create(staging_root: &Path, run_id: RunId) -> io::Result<Self> {
        tokio::fs::create_dir_all(staging_root).await?;
        let parent = staging_root.to_path_buf();
        let root = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&format!("run-{}-", run_id))
                .tempdir_in(parent)
        })
        .await
        .map_err(io::Error::other)??;

        let workspace = Self {
            run_id,
            input_dir: root.path().join("inputs"),
            output_dir: root.path().join("outputs"),
            temp_dir: root.path().join("temp"),
            root,
        };
        workspace.reset().await?;

        tracing::debug!(run_id = %run_id, path = %workspace.path().display(), "Created run workspace");
        Ok(workspace)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Make sure input, output and temp all exist and are empty
    pub async fn reset(&self) -> io::Result<()> {
        for dir in [&self.input_dir, &self.output_dir, &self.temp_dir] {
            clear_dir(dir).await?;
        }
        Ok(())
    }

    /// Copy `source` into the input directory as `<prefix><source extension>`
    pub async fn stage_input(&self, source: &Path, prefix: &str) -> Result<StagedFile, StagingError> {
        let name = staged_name(source, prefix);
        let target = self.input_dir.join(&name);

        tokio::fs::copy(source, &target).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StagingError::Input(RequestError::MissingFile(source.display().to_string()))
            } else {
                StagingError::Input(RequestError::UnreadableFile {
                    path: source.display().to_string(),
                    reason: e.to_string(),
                })
            }
        })?;

        tracing::debug!(source = %source.display(), target = %target.display(), "Staged input");
        Ok(StagedFile { name, path: target })
    }

    /// Every file in the output directory, in directory order
    pub async fn collect_outputs(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.output_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    /// Stop the directory from being removed on drop and return its path
    pub fn keep(self) -> PathBuf {
        self.root.into_path()
    }
}

/// Recursively empty `dir`, creating it if absent
pub async fn clear_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// `prefix` plus the extension of `source` (with its dot), or just `prefix`
pub fn staged_name(source: &Path, prefix: &str) -> String {
    match source.extension() {
        Some(ext) => format!("{}.{}", prefix, ext.to_string_lossy()),
        None => prefix.to_string(),
    }
}

/// A file copied into a run's input directory
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    pub name: String,
    pub path: PathBuf,
}

/// The two inputs of a run
#[derive(Debug, Clone)]
pub struct StagedInputs {
    pub face_image: StagedFile,
    pub driving_video: StagedFile,
}

#[derive(Error, Debug)]
pub enum StagingError {
    #[error(transparent)]
    Input(RequestError),

    #[error("Staging failed: {0}")]
    Io(#[from] io::Error),
}

impl From<StagingError> for portraitcore::PortraitError {
    fn from(e: StagingError) -> Self {
        match e {
            StagingError::Input(e) => e.into(),
            StagingError::Io(e) => e.into(),
        }
    }
}
