use async_trait::async_trait;
use portraitcore::{EngineError, EventEmitter, WorkflowGraph};
use portraitruntime::staging::clear_dir;
use portraitruntime::{Engine, EngineJob, EngineLaunch, StagedFile};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

/// Client for a ComfyUI-compatible engine server.
///
/// Inputs are uploaded into the engine's own input directory, so submissions
/// through one client are serialized: a second run waits until the first has
/// finished and its outputs have been downloaded. When the engine's
/// directories are on this machine they are emptied before every submission.
pub struct ComfyEngine {
    client: reqwest::Client,
    address: String,
    base_url: String,
    client_id: String,
    poll_interval: Duration,
    local_dirs: Vec<PathBuf>,
    submit_lock: Mutex<()>,
}

impl ComfyEngine {
    /// `address` is `host:port`
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{}", address),
            address,
            client_id: Uuid::new_v4().to_string(),
            poll_interval: Duration::from_millis(500),
            local_dirs: Vec::new(),
            submit_lock: Mutex::new(()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Empty the launched engine's input, output and temp directories before each run
    pub fn with_local_dirs(mut self, launch: &EngineLaunch) -> Self {
        self.local_dirs = vec![
            launch.input_dir.clone(),
            launch.output_dir.clone(),
            launch.temp_dir.clone(),
        ];
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn clear_local_dirs(&self) -> Result<(), EngineError> {
        for dir in &self.local_dirs {
            clear_dir(dir).await.map_err(|e| EngineError::Directory {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        if !self.local_dirs.is_empty() {
            tracing::debug!(dirs = self.local_dirs.len(), "Cleared engine directories");
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn connection_error(&self, e: reqwest::Error) -> EngineError {
        EngineError::Connection {
            address: self.address.clone(),
            reason: e.to_string(),
        }
    }

    /// Copy a staged input into the engine's input directory, replacing any file of the same name
    pub async fn upload(&self, file: &StagedFile) -> Result<(), EngineError> {
        let bytes = tokio::fs::read(&file.path)
            .await
            .map_err(|e| EngineError::Protocol(format!("cannot read {}: {}", file.path.display(), e)))?;

        let form = reqwest::multipart::Form::new()
            .part("image", reqwest::multipart::Part::bytes(bytes).file_name(file.name.clone()))
            .text("type", "input")
            .text("overwrite", "true");

        let response = self
            .client
            .post(self.url("/upload/image"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Rejected(format!(
                "upload of {} failed ({}): {}",
                file.name, status, body
            )));
        }

        tracing::debug!(file = %file.name, "Uploaded input to engine");
        Ok(())
    }

    /// Queue the graph and return the engine's prompt id
    pub async fn queue_prompt(&self, graph: &WorkflowGraph) -> Result<String, EngineError> {
        let body = serde_json::json!({
            "prompt": graph,
            "client_id": self.client_id,
        });

        let response = self
            .client
            .post(self.url("/prompt"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.connection_error(e))?;
        if !status.is_success() {
            return Err(EngineError::Rejected(text));
        }

        let queued: PromptResponse = serde_json::from_str(&text)
            .map_err(|e| EngineError::Protocol(format!("invalid /prompt response: {}", e)))?;

        if let Some(errors) = queued.node_errors.as_ref().filter(|e| has_entries(e)) {
            return Err(EngineError::Rejected(errors.to_string()));
        }

        tracing::info!(prompt_id = %queued.prompt_id, number = ?queued.number, "Workflow queued");
        Ok(queued.prompt_id)
    }

    /// Poll the history until the prompt finishes
    pub async fn wait_for_completion(
        &self,
        prompt_id: &str,
        events: &EventEmitter,
    ) -> Result<HistoryEntry, EngineError> {
        let mut polls: u64 = 0;
        loop {
            if let Some(entry) = self.history(prompt_id).await? {
                match entry.status.as_ref() {
                    Some(status) if status.status_str == "error" => {
                        return Err(EngineError::ExecutionFailed(status.error_message()));
                    }
                    Some(status) if !status.completed => {}
                    _ => {
                        tracing::info!(prompt_id = %prompt_id, "Workflow finished");
                        return Ok(entry);
                    }
                }
            }

            polls += 1;
            if polls % 20 == 0 {
                events.progress(format!("waiting for engine ({} polls)", polls));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, EngineError> {
        let response = self
            .client
            .get(self.url(&format!("/history/{}", prompt_id)))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        if !response.status().is_success() {
            return Err(EngineError::Protocol(format!(
                "history request returned {}",
                response.status()
            )));
        }

        let mut history: HashMap<String, HistoryEntry> = response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(format!("invalid history response: {}", e)))?;
        Ok(history.remove(prompt_id))
    }

    /// Download every `output` file listed in `entry` into `output_dir`
    pub async fn download_outputs(
        &self,
        entry: &HistoryEntry,
        output_dir: &Path,
    ) -> Result<usize, EngineError> {
        let files = entry.output_files();
        for file in &files {
            let target = output_dir.join(file.local_name()?);
            let mut response = self
                .client
                .get(self.url("/view"))
                .query(&[
                    ("filename", file.filename.as_str()),
                    ("subfolder", file.subfolder.as_str()),
                    ("type", file.kind.as_str()),
                ])
                .send()
                .await
                .map_err(|e| self.connection_error(e))?;

            if !response.status().is_success() {
                return Err(EngineError::Protocol(format!(
                    "download of {} returned {}",
                    file.filename,
                    response.status()
                )));
            }

            let mut out = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::AlreadyExists => {
                        EngineError::Protocol(format!("duplicate output {}", target.display()))
                    }
                    _ => EngineError::Protocol(format!("cannot write {}: {}", target.display(), e)),
                })?;
            while let Some(chunk) = response.chunk().await.map_err(|e| self.connection_error(e))? {
                out.write_all(&chunk)
                    .await
                    .map_err(|e| EngineError::Protocol(format!("cannot write {}: {}", target.display(), e)))?;
            }
            out.flush()
                .await
                .map_err(|e| EngineError::Protocol(format!("cannot write {}: {}", target.display(), e)))?;

            tracing::debug!(file = %file.filename, "Downloaded output");
        }
        Ok(files.len())
    }
}

#[async_trait]
impl Engine for ComfyEngine {
    fn name(&self) -> &str {
        "comfyui"
    }

    async fn submit(&self, job: EngineJob<'_>) -> Result<(), EngineError> {
        let _guard = self.submit_lock.lock().await;
        self.clear_local_dirs().await?;

        self.upload(&job.inputs.face_image).await?;
        self.upload(&job.inputs.driving_video).await?;

        let prompt_id = self.queue_prompt(job.graph).await?;
        job.events.queued(prompt_id.as_str());

        let entry = self.wait_for_completion(&prompt_id, job.events).await?;
        let count = self.download_outputs(&entry, job.workspace.output_dir()).await?;
        job.events.progress(format!("downloaded {} output file(s)", count));
        Ok(())
    }

    async fn health(&self) -> Result<(), EngineError> {
        let response = self
            .client
            .get(self.url("/system_stats"))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Connection {
                address: self.address.clone(),
                reason: format!("health check returned {}", response.status()),
            })
        }
    }
}

fn has_entries(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: String,
    number: Option<u64>,
    node_errors: Option<serde_json::Value>,
}

/// One prompt's entry in the engine history
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub status: Option<PromptStatus>,
    /// node id -> output kind ("images", "gifs", ...) -> value
    #[serde(default)]
    pub outputs: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl HistoryEntry {
    /// Files written to the engine's output directory, ordered by node id
    pub fn output_files(&self) -> Vec<OutputFile> {
        let mut node_ids: Vec<&String> = self.outputs.keys().collect();
        node_ids.sort();

        let mut files = Vec::new();
        for node_id in node_ids {
            let mut kinds: Vec<(&String, &serde_json::Value)> = self.outputs[node_id].iter().collect();
            kinds.sort_by(|a, b| a.0.cmp(b.0));
            for (_, value) in kinds {
                // Not every output entry is a file list ("animated": [false], ...)
                if let Ok(list) = serde_json::from_value::<Vec<OutputFile>>(value.clone()) {
                    files.extend(list.into_iter().filter(|f| f.kind == "output"));
                }
            }
        }
        files
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptStatus {
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[event name, payload]` pairs
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

impl PromptStatus {
    /// The engine's own description of what went wrong
    pub fn error_message(&self) -> String {
        let reported: Vec<String> = self
            .messages
            .iter()
            .filter(|(name, _)| name == "execution_error")
            .map(|(_, payload)| {
                let node_id = payload.get("node_id").and_then(|v| v.as_str()).unwrap_or("?");
                let node_type = payload.get("node_type").and_then(|v| v.as_str()).unwrap_or("?");
                let message = payload
                    .get("exception_message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error");
                format!("node {} ({}): {}", node_id, node_type, message)
            })
            .collect();

        if reported.is_empty() {
            format!("engine reported status '{}'", self.status_str)
        } else {
            reported.join("; ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl OutputFile {
    /// Flat file name for the run's output directory: `filename`, prefixed by
    /// the subfolder parts joined with `_` when there is a subfolder
    pub fn local_name(&self) -> Result<String, EngineError> {
        let unsafe_name = || {
            EngineError::Protocol(format!(
                "refusing output path '{}' in subfolder '{}'",
                self.filename, self.subfolder
            ))
        };

        let mut parts = Vec::new();
        for component in Path::new(&self.subfolder).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return Err(unsafe_name()),
            }
        }

        let mut components = Path::new(&self.filename).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => parts.push(name.to_string_lossy().into_owned()),
            _ => return Err(unsafe_name()),
        }
        Ok(parts.join("_"))
    }
}
