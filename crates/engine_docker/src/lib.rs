use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{ArchiveInfo, BuildRequest, ContainerEngine, DeployError, ImageRef};
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// `ContainerEngine` backed by the `docker` CLI. Every operation is a single
/// synchronous-in-spirit child process; there are no retries and failures
/// propagate as exit-status errors.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerEngine {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn unavailable(&self) -> DeployError {
        DeployError::EngineUnavailable(self.binary.clone())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn version(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|_| self.unavailable())?;
        if !output.status.success() {
            return Err(self.unavailable().into());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("unknown").trim().to_string())
    }

    async fn image_exists(&self, image: &ImageRef) -> Result<bool> {
        let output = Command::new(&self.binary)
            .args(["image", "inspect"])
            .arg(image.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|_| self.unavailable())?;
        Ok(output.status.success())
    }

    async fn build(&self, request: &BuildRequest) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg("build")
            .arg("-f")
            .arg(&request.dockerfile)
            .arg("-t")
            .arg(request.image.to_string());
        for (key, value) in &request.build_args {
            command.arg("--build-arg").arg(format!("{key}={value}"));
        }
        command.arg(&request.context);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        info!(image = %request.image, "starting image build");
        let mut child = command.spawn().map_err(|_| self.unavailable())?;

        // docker writes build progress to both streams; forward each line
        // into the log as it arrives.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(forward_lines(stdout, false));
        let stderr_task = tokio::spawn(forward_lines(stderr, true));

        let status = child.wait().await.context("failed to wait for build")?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(DeployError::EngineFailed {
                status: status.code().unwrap_or(-1),
            }
            .into());
        }
        info!(image = %request.image, "image build finished");
        Ok(())
    }

    async fn export(&self, image: &ImageRef, output: &Path) -> Result<ArchiveInfo> {
        info!(image = %image, archive = %output.display(), "exporting image");
        let mut child = Command::new(&self.binary)
            .arg("save")
            .arg(image.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|_| self.unavailable())?;

        let mut stdout = child
            .stdout
            .take()
            .context("docker save produced no stdout handle")?;
        let file = File::create(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = stdout
                .read(&mut buf)
                .await
                .context("failed to read docker save stream")?;
            if read == 0 {
                break;
            }
            encoder.write_all(&buf[..read])?;
        }
        encoder.finish().context("failed to finish gzip stream")?;

        let status = child.wait().await.context("failed to wait for export")?;
        if !status.success() {
            // Drop the truncated archive rather than leaving a broken file
            // that looks like a finished export.
            let _ = std::fs::remove_file(output);
            return Err(DeployError::EngineFailed {
                status: status.code().unwrap_or(-1),
            }
            .into());
        }

        let metadata = std::fs::metadata(output);
        match metadata {
            Ok(meta) if meta.len() > 0 => Ok(ArchiveInfo {
                path: output.to_path_buf(),
                bytes: meta.len(),
            }),
            _ => Err(DeployError::ArtifactMissing(output.to_path_buf()).into()),
        }
    }
}

async fn forward_lines(stream: Option<impl tokio::io::AsyncRead + Unpin>, is_stderr: bool) {
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            debug!(target: "engine_docker::build", "{line}");
        } else {
            info!(target: "engine_docker::build", "{line}");
        }
    }
}
