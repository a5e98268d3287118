use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::ImageRef;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Everything the deploy commands need to know about the service being
/// packaged. Paths are resolved relative to the invocation directory unless
/// absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub schema_version: u32,
    pub image_name: String,
    pub default_tag: String,
    pub dockerfile: PathBuf,
    pub env_file: PathBuf,
    pub build_context: PathBuf,
    #[serde(default)]
    pub build_args: Vec<(String, String)>,
    pub output_dir: PathBuf,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            image_name: "emergency-agents-external".to_string(),
            default_tag: "latest".to_string(),
            dockerfile: PathBuf::from("Dockerfile"),
            env_file: PathBuf::from("config/env.external"),
            build_context: PathBuf::from("."),
            build_args: Vec::new(),
            output_dir: PathBuf::from("."),
        }
    }
}

impl DeployConfig {
    /// Image reference for a tag supplied on the command line, falling back
    /// to the configured default tag.
    pub fn image(&self, tag: Option<&str>) -> ImageRef {
        ImageRef::new(&self.image_name, tag.unwrap_or(&self.default_tag))
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn from_default_location() -> Result<Self> {
        let mut dir = dirs::config_dir().context("failed to resolve config_dir")?;
        dir.push("emdeploy");
        Ok(Self::from_dir(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<DeployConfig> {
        if !self.path.exists() {
            let config = DeployConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: DeployConfig =
            serde_json::from_str(&raw).context("failed to parse deploy config json")?;
        self.migrate(&mut config);
        self.save(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &DeployConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut DeployConfig) {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating deploy config schema"
        );

        if config.image_name.is_empty() {
            config.image_name = DeployConfig::default().image_name;
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
    }
}
