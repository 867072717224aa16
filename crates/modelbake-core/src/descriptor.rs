//! Model descriptors and target images.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ProvisionError, ProvisionResult};

/// Declarative description of a model to bake into an image.
///
/// Immutable once built. The definition text defaults to
/// `FROM <primary_weight_file>` when not supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorFields")]
pub struct ModelDescriptor {
    source_repository: String,
    primary_weight_file: String,
    adapter_weight_file: Option<String>,
    definition_text: String,
    model_name: Option<String>,
}

/// Unvalidated descriptor fields, as read from a file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorFields {
    source_repository: String,
    primary_weight_file: String,
    #[serde(default)]
    adapter_weight_file: Option<String>,
    #[serde(default)]
    definition_text: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
}

impl TryFrom<DescriptorFields> for ModelDescriptor {
    type Error = ProvisionError;

    fn try_from(fields: DescriptorFields) -> ProvisionResult<Self> {
        let mut builder = ModelDescriptor::builder(fields.source_repository, fields.primary_weight_file);
        if let Some(adapter) = fields.adapter_weight_file {
            builder = builder.adapter_weight_file(adapter);
        }
        if let Some(text) = fields.definition_text {
            builder = builder.definition_text(text);
        }
        if let Some(name) = fields.model_name {
            builder = builder.model_name(name);
        }
        builder.build()
    }
}

impl ModelDescriptor {
    /// Descriptor with the default definition text.
    pub fn new(
        source_repository: impl Into<String>,
        primary_weight_file: impl Into<String>,
    ) -> ProvisionResult<Self> {
        Self::builder(source_repository, primary_weight_file).build()
    }

    pub fn builder(
        source_repository: impl Into<String>,
        primary_weight_file: impl Into<String>,
    ) -> DescriptorBuilder {
        DescriptorBuilder {
            source_repository: source_repository.into(),
            primary_weight_file: primary_weight_file.into(),
            adapter_weight_file: None,
            definition_text: None,
            model_name: None,
        }
    }

    /// Load a descriptor from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> ProvisionResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| ProvisionError::InvalidDescriptor(format!("{}: {}", path.display(), e))),
            _ => toml::from_str(&content)
                .map_err(|e| ProvisionError::InvalidDescriptor(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn source_repository(&self) -> &str {
        &self.source_repository
    }

    pub fn primary_weight_file(&self) -> &str {
        &self.primary_weight_file
    }

    pub fn adapter_weight_file(&self) -> Option<&str> {
        self.adapter_weight_file.as_deref()
    }

    pub fn definition_text(&self) -> &str {
        &self.definition_text
    }

    /// Name registered with the serving engine.
    pub fn model_name(&self) -> &str {
        self.model_name
            .as_deref()
            .unwrap_or(&self.primary_weight_file)
    }

    /// Name the serving engine lists and accepts in requests.
    pub fn served_model(&self) -> String {
        let name = self.model_name();
        if name.contains(':') {
            name.to_string()
        } else {
            format!("{}:latest", name)
        }
    }

    /// Weight files downloaded into the container, primary first.
    pub fn weight_files(&self) -> Vec<&str> {
        let mut files = vec![self.primary_weight_file.as_str()];
        files.extend(self.adapter_weight_file.as_deref());
        files
    }

    /// SHA-256 over all fields, stable across runs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            Some(self.source_repository.as_str()),
            Some(self.primary_weight_file.as_str()),
            self.adapter_weight_file.as_deref(),
            Some(self.definition_text.as_str()),
            self.model_name.as_deref(),
        ] {
            match field {
                Some(value) => {
                    hasher.update(b"1");
                    hasher.update(value.as_bytes());
                }
                None => hasher.update(b"0"),
            }
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

/// Builder for [`ModelDescriptor`].
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    source_repository: String,
    primary_weight_file: String,
    adapter_weight_file: Option<String>,
    definition_text: Option<String>,
    model_name: Option<String>,
}

impl DescriptorBuilder {
    pub fn adapter_weight_file(mut self, file: impl Into<String>) -> Self {
        self.adapter_weight_file = Some(file.into());
        self
    }

    pub fn definition_text(mut self, text: impl Into<String>) -> Self {
        self.definition_text = Some(text.into());
        self
    }

    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = Some(name.into());
        self
    }

    pub fn build(self) -> ProvisionResult<ModelDescriptor> {
        require_token("source repository", &self.source_repository)?;
        require_token("primary weight file", &self.primary_weight_file)?;
        if let Some(adapter) = &self.adapter_weight_file {
            require_token("adapter weight file", adapter)?;
        }
        if let Some(name) = &self.model_name {
            require_token("model name", name)?;
        }

        let definition_text = match self.definition_text {
            Some(text) if text.trim().is_empty() => {
                return Err(ProvisionError::InvalidDescriptor(
                    "definition text must not be empty".to_string(),
                ))
            }
            Some(text) => text,
            None => format!("FROM {}", self.primary_weight_file),
        };

        Ok(ModelDescriptor {
            source_repository: self.source_repository,
            primary_weight_file: self.primary_weight_file,
            adapter_weight_file: self.adapter_weight_file,
            definition_text,
            model_name: self.model_name,
        })
    }
}

/// Values passed as single command arguments: non-empty, no whitespace.
fn require_token(what: &str, value: &str) -> ProvisionResult<()> {
    if value.is_empty() {
        return Err(ProvisionError::InvalidDescriptor(format!("{} must not be empty", what)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ProvisionError::InvalidDescriptor(format!(
            "{} must not contain whitespace: {:?}",
            what, value
        )));
    }
    Ok(())
}

/// Image tag a descriptor is baked into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetImage {
    /// Tag under which the built image is stored; the cache key.
    pub name: String,
    /// Base serving image the tag must be runtime-compatible with.
    pub compatible_base: String,
}

impl TargetImage {
    pub fn new(name: impl Into<String>, compatible_base: impl Into<String>) -> ProvisionResult<Self> {
        let name = name.into();
        let compatible_base = compatible_base.into();
        if name.trim().is_empty() {
            return Err(ProvisionError::InvalidDescriptor(
                "target image name must not be empty".to_string(),
            ));
        }
        if compatible_base.trim().is_empty() {
            return Err(ProvisionError::InvalidDescriptor(
                "compatible base image must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            compatible_base,
        })
    }
}

impl std::fmt::Display for TargetImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (base {})", self.name, self.compatible_base)
    }
}
