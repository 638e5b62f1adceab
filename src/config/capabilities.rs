use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Capability;
use crate::workers::{JsonSchemaValidator, NonTrivialContent, Validator};

/// How a capability's artifact is judged acceptable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatorSpec {
    /// File exists with non-trivial content
    #[default]
    NonTrivial,
    /// Non-trivial JSON matching an inline schema
    JsonSchema { schema: Value },
}

/// A capability as declared in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub validator: ValidatorSpec,
}

/// Top-level shape of a capabilities YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesFile {
    #[serde(default)]
    pub capabilities: Vec<CapabilitySpec>,
}

impl CapabilitiesFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read capabilities {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse capabilities {}", path.display()))
    }
}

impl CapabilitySpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            file_path: None,
            validator: ValidatorSpec::NonTrivial,
        }
    }

    /// The capability as tracked by the state store (not yet implemented).
    pub fn to_capability(&self) -> Capability {
        let capability = Capability::new(&self.name, &self.description);
        match &self.file_path {
            Some(path) => capability.with_file(path),
            None => capability,
        }
    }

    /// Build the artifact validator, with `min_bytes` as the content floor.
    pub fn build_validator(&self, min_bytes: usize) -> anyhow::Result<Arc<dyn Validator>> {
        let content = NonTrivialContent::new(min_bytes);
        Ok(match &self.validator {
            ValidatorSpec::NonTrivial => Arc::new(content),
            ValidatorSpec::JsonSchema { schema } => Arc::new(
                JsonSchemaValidator::new(schema, content)
                    .map_err(|e| anyhow::anyhow!("Invalid schema for {}: {}", self.name, e))?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capabilities_yaml() {
        let yaml = r#"
capabilities:
  - name: api
    description: HTTP handlers
    file_path: src/api.rs
  - name: manifest
    description: Tool manifest
    file_path: tools/manifest.json
    validator:
      kind: json_schema
      schema:
        type: object
        required: [tools]
  - name: docs
"#;
        let file: CapabilitiesFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.capabilities.len(), 3);
        assert_eq!(file.capabilities[0].validator, ValidatorSpec::NonTrivial);
        assert!(matches!(
            file.capabilities[1].validator,
            ValidatorSpec::JsonSchema { .. }
        ));
        assert_eq!(file.capabilities[2].file_path, None);
        assert!(file.capabilities[2].description.is_empty());
    }

    #[test]
    fn test_to_capability_starts_unimplemented() {
        let mut spec = CapabilitySpec::new("api", "HTTP handlers");
        spec.file_path = Some("src/api.rs".to_string());

        let capability = spec.to_capability();
        assert!(!capability.implemented);
        assert_eq!(capability.file_path.as_deref(), Some("src/api.rs"));
    }

    #[test]
    fn test_build_validator_rejects_bad_schema() {
        let mut spec = CapabilitySpec::new("manifest", "");
        spec.validator = ValidatorSpec::JsonSchema {
            schema: serde_json::json!({ "type": 5 }),
        };
        assert!(spec.build_validator(1).is_err());

        assert!(CapabilitySpec::new("ok", "").build_validator(1).is_ok());
    }
}
