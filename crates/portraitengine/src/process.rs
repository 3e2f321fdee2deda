use crate::ComfyEngine;
use portraitcore::{EngineError, PortraitError};
use portraitruntime::staging::clear_dir;
use portraitruntime::{Engine, EngineLaunch};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Duration, Instant};

/// Environment for the engine process: model hubs stay offline
pub const OFFLINE_ENV: &[(&str, &str)] = &[
    ("HF_DATASETS_OFFLINE", "1"),
    ("TRANSFORMERS_OFFLINE", "1"),
    ("HF_HUB_DISABLE_TELEMETRY", "1"),
];

/// A locally launched engine server. Killed when dropped.
pub struct EngineProcess {
    child: Child,
    address: String,
}

impl EngineProcess {
    /// Start the engine and wait until its API answers
    pub async fn start(launch: &EngineLaunch, address: &str) -> Result<Self, PortraitError> {
        let (host, port) = split_address(address)?;

        for dir in [&launch.input_dir, &launch.output_dir, &launch.temp_dir] {
            clear_dir(dir).await?;
        }

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .arg("--listen")
            .arg(host)
            .arg("--port")
            .arg(port)
            .arg("--input-directory")
            .arg(&launch.input_dir)
            .arg("--output-directory")
            .arg(&launch.output_dir)
            .current_dir(&launch.working_dir)
            .envs(OFFLINE_ENV.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            program = %launch.program.display(),
            address = %address,
            "Starting engine server"
        );

        let mut child = cmd.spawn().map_err(|e| EngineError::Connection {
            address: address.to_string(),
            reason: format!("failed to spawn engine: {}", e),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }

        let mut process = Self {
            child,
            address: address.to_string(),
        };
        process
            .wait_until_ready(Duration::from_secs(launch.startup_timeout_secs))
            .await?;
        Ok(process)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn wait_until_ready(&mut self, limit: Duration) -> Result<(), EngineError> {
        let client = ComfyEngine::new(self.address.clone());
        let deadline = Instant::now() + limit;

        loop {
            if client.health().await.is_ok() {
                tracing::info!(address = %self.address, "Engine server is ready");
                return Ok(());
            }

            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(EngineError::Connection {
                    address: self.address.clone(),
                    reason: format!("engine exited during startup with {}", status),
                });
            }

            if Instant::now() >= deadline {
                return Err(EngineError::StartupTimeout {
                    seconds: limit.as_secs(),
                });
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn shutdown(mut self) -> std::io::Result<()> {
        tracing::info!(address = %self.address, "Stopping engine server");
        self.child.kill().await
    }
}

fn split_address(address: &str) -> Result<(&str, &str), EngineError> {
    address
        .rsplit_once(':')
        .filter(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .ok_or_else(|| EngineError::Connection {
            address: address.to_string(),
            reason: "expected host:port".to_string(),
        })
}

async fn forward_lines<R>(stream: R, name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "engine", stream = name, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("127.0.0.1:8188").unwrap(), ("127.0.0.1", "8188"));
        assert!(split_address("localhost").is_err());
        assert!(split_address(":8188").is_err());
        assert!(split_address("host:http").is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let launch = EngineLaunch {
            program: dir.path().join("no-such-engine"),
            working_dir: dir.path().to_path_buf(),
            input_dir: dir.path().join("in"),
            output_dir: dir.path().join("out"),
            temp_dir: dir.path().join("tmp"),
            startup_timeout_secs: 1,
            ..Default::default()
        };

        let result = EngineProcess::start(&launch, "127.0.0.1:1").await;
        assert!(matches!(result, Err(PortraitError::Engine(EngineError::Connection { .. }))));
        assert!(dir.path().join("tmp").is_dir());
    }
}
