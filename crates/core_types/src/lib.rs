use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub type ConversationId = Uuid;
pub type MessageId = Uuid;

/// Deployment failure taxonomy. Every variant maps to process exit code 1;
/// the variants exist so callers and logs can tell the causes apart.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("container engine `{0}` is not available")]
    EngineUnavailable(String),
    #[error("required file `{}` not found", .0.display())]
    MissingFile(PathBuf),
    #[error("container engine exited with status {status}")]
    EngineFailed { status: i32 },
    #[error("image `{0}` not found locally")]
    ImageNotFound(ImageRef),
    #[error("expected artifact `{}` is missing or empty", .0.display())]
    ArtifactMissing(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub image: ImageRef,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    #[serde(default)]
    pub build_args: Vec<(String, String)>,
}

/// A verified export artifact on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(anyhow!("unknown message role `{other}`")),
        }
    }
}

/// One conversation turn before it is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            intent: None,
            metadata: Value::Null,
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Seam between the CLI and whatever container tooling is installed.
/// `engine_docker` provides the production implementation; tests substitute
/// recording mocks.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Probe that the engine binary is present and answering. Returns the
    /// engine's version line on success.
    async fn version(&self) -> Result<String>;

    async fn image_exists(&self, image: &ImageRef) -> Result<bool>;

    async fn build(&self, request: &BuildRequest) -> Result<()>;

    /// Serialize `image` into a gzip-compressed archive at `output` and
    /// verify the artifact exists and is non-empty.
    async fn export(&self, image: &ImageRef, output: &Path) -> Result<ArchiveInfo>;
}

/// Archive name for an export started at `at`, e.g.
/// `emergency-agents-external-20260830-1405.tar.gz`.
pub fn archive_file_name(image_name: &str, at: DateTime<Local>) -> String {
    format!("{image_name}-{}.tar.gz", at.format("%Y%m%d-%H%M"))
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn archive_name_embeds_minute_timestamp() {
        let at = Local.with_ymd_and_hms(2026, 8, 30, 14, 5, 0).unwrap();
        assert_eq!(
            archive_file_name("emergency-agents-external", at),
            "emergency-agents-external-20260830-1405.tar.gz"
        );
    }

    #[test]
    fn role_token_round_trips() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("operator".parse::<Role>().is_err());
    }

    #[test]
    fn formats_sizes_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 + 256 * 1024), "5.3 MB");
    }

    #[test]
    fn image_ref_displays_name_and_tag() {
        let image = ImageRef::new("emergency-agents-external", "latest");
        assert_eq!(image.to_string(), "emergency-agents-external:latest");
    }
}
