use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::Validator;

/// Default minimum length of an artifact's trimmed content.
pub const DEFAULT_MIN_BYTES: usize = 16;

/// Artifact exists, is a regular file, and has non-trivial content.
#[derive(Debug, Clone)]
pub struct NonTrivialContent {
    pub min_bytes: usize,
}

impl Default for NonTrivialContent {
    fn default() -> Self {
        Self {
            min_bytes: DEFAULT_MIN_BYTES,
        }
    }
}

impl NonTrivialContent {
    pub fn new(min_bytes: usize) -> Self {
        Self { min_bytes }
    }

    async fn read(&self, path: &Path) -> Option<String> {
        let bytes = tokio::fs::read(path).await.ok()?;
        let content = String::from_utf8_lossy(&bytes).to_string();
        (content.trim().len() >= self.min_bytes.max(1)).then_some(content)
    }
}

#[async_trait]
impl Validator for NonTrivialContent {
    async fn is_valid(&self, path: &Path) -> bool {
        let valid = self.read(path).await.is_some();
        debug!("{:?} non-trivial: {}", path, valid);
        valid
    }
}

/// Non-trivial JSON artifact that also satisfies a JSON schema.
pub struct JsonSchemaValidator {
    content: NonTrivialContent,
    schema: jsonschema::Validator,
}

impl JsonSchemaValidator {
    pub fn new(schema: &Value, content: NonTrivialContent) -> Result<Self, String> {
        let schema = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
        Ok(Self { content, schema })
    }
}

#[async_trait]
impl Validator for JsonSchemaValidator {
    async fn is_valid(&self, path: &Path) -> bool {
        let Some(content) = self.content.read(path).await else {
            return false;
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(instance) => self.schema.is_valid(&instance),
            Err(e) => {
                debug!("{:?} is not JSON: {}", path, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_non_trivial_content() {
        let dir = tempdir().unwrap();
        let validator = NonTrivialContent::new(8);

        let missing = dir.path().join("missing.rs");
        assert!(!validator.is_valid(&missing).await);

        let tiny = dir.path().join("tiny.rs");
        std::fs::write(&tiny, "  \n  x \n").unwrap();
        assert!(!validator.is_valid(&tiny).await);

        let real = dir.path().join("real.rs");
        std::fs::write(&real, "pub fn handler() {}\n").unwrap();
        assert!(validator.is_valid(&real).await);

        // Directories are not artifacts
        assert!(!validator.is_valid(dir.path()).await);
    }

    #[tokio::test]
    async fn test_json_schema_validator() {
        let dir = tempdir().unwrap();
        let schema = json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        });
        let validator = JsonSchemaValidator::new(&schema, NonTrivialContent::new(2)).unwrap();

        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"name": "forge"}"#).unwrap();
        assert!(validator.is_valid(&good).await);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"name": 42}"#).unwrap();
        assert!(!validator.is_valid(&bad).await);

        let text = dir.path().join("text.json");
        std::fs::write(&text, "not json at all").unwrap();
        assert!(!validator.is_valid(&text).await);
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let schema = json!({ "type": 12 });
        assert!(JsonSchemaValidator::new(&schema, NonTrivialContent::default()).is_err());
    }
}
