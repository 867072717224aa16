//! Provisioning configuration.
//!
//! Layered the same way everywhere: defaults, then an optional TOML file,
//! then `MODELBAKE_*` environment variables, then CLI flags.

use std::path::Path;
use std::str::FromStr;

use modelbake_session::DockerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, ProvisionResult};

/// Serving engine image the pipeline starts from.
pub const DEFAULT_BASE_IMAGE: &str = "ollama/ollama:0.1.44";

/// What to do with the raw weight files after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupPolicy {
    /// Keep the downloaded files in the image.
    Skip,
    /// Remove them; a failed removal aborts the build.
    #[default]
    Fatal,
    /// Remove them; a failed removal is logged and ignored.
    BestEffort,
}

impl FromStr for CleanupPolicy {
    type Err = ProvisionError;

    fn from_str(s: &str) -> ProvisionResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" | "keep" => Ok(CleanupPolicy::Skip),
            "fatal" => Ok(CleanupPolicy::Fatal),
            "best-effort" | "best_effort" => Ok(CleanupPolicy::BestEffort),
            other => Err(ProvisionError::Config(format!(
                "unknown cleanup policy {:?} (expected skip, fatal or best-effort)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CleanupPolicy::Skip => "skip",
            CleanupPolicy::Fatal => "fatal",
            CleanupPolicy::BestEffort => "best-effort",
        };
        write!(f, "{}", s)
    }
}

/// Provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BakeConfig {
    /// Base serving image builds start from
    pub base_image: String,
    /// Directory (inside the container) weights are downloaded to
    pub download_dir: String,
    /// Model-definition filename written inside the container
    pub definition_file: String,
    /// Removal of raw weight files after registration
    pub cleanup: CleanupPolicy,
    /// Check the base-image label of cached images
    pub enforce_compatibility: bool,
    /// Per-step exec limit in seconds (0 = unbounded)
    pub step_timeout_secs: u64,
    /// Container backend settings
    pub docker: DockerConfig,
}

impl Default for BakeConfig {
    fn default() -> Self {
        BakeConfig {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            download_dir: ".".to_string(),
            definition_file: "Modelfile".to_string(),
            cleanup: CleanupPolicy::default(),
            enforce_compatibility: true,
            step_timeout_secs: 0,
            docker: DockerConfig::default(),
        }
    }
}

impl BakeConfig {
    /// Defaults overlaid with `MODELBAKE_*` environment variables.
    pub fn from_env() -> ProvisionResult<Self> {
        Self::default().apply_env()
    }

    /// Load from a TOML file; missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> ProvisionResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BakeConfig = toml::from_str(&content)
            .map_err(|e| ProvisionError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the process environment.
    pub fn apply_env(self) -> ProvisionResult<Self> {
        self.apply_vars(std::env::vars())
    }

    /// Overlay `MODELBAKE_*` variables from an iterator of key/value pairs.
    pub fn apply_vars<I, K, V>(mut self, vars: I) -> ProvisionResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "MODELBAKE_BASE_IMAGE" => self.base_image = value.to_string(),
                "MODELBAKE_DOWNLOAD_DIR" => self.download_dir = value.to_string(),
                "MODELBAKE_DEFINITION_FILE" => self.definition_file = value.to_string(),
                "MODELBAKE_CLEANUP" => self.cleanup = value.parse()?,
                "MODELBAKE_ENFORCE_COMPAT" => {
                    self.enforce_compatibility = parse_var("MODELBAKE_ENFORCE_COMPAT", value)?
                }
                "MODELBAKE_STEP_TIMEOUT_SECS" => {
                    self.step_timeout_secs = parse_var("MODELBAKE_STEP_TIMEOUT_SECS", value)?
                }
                "MODELBAKE_STARTUP_TIMEOUT_SECS" => {
                    self.docker.startup_timeout_secs =
                        parse_var("MODELBAKE_STARTUP_TIMEOUT_SECS", value)?
                }
                "MODELBAKE_DOCKER" => self.docker.docker_bin = value.to_string(),
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        if self.base_image.trim().is_empty() {
            return Err(ProvisionError::Config("base_image must not be empty".to_string()));
        }
        if self.download_dir.trim().is_empty() {
            return Err(ProvisionError::Config("download_dir must not be empty".to_string()));
        }
        if self.definition_file.trim().is_empty() || self.definition_file.contains('/') {
            return Err(ProvisionError::Config(format!(
                "definition_file must be a plain filename, got {:?}",
                self.definition_file
            )));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> ProvisionResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProvisionError::Config(format!("{} has invalid value {:?}", key, value)))
}
