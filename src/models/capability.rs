use serde::{Deserialize, Serialize};

/// A declared unit of desired system functionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Unique name
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub implemented: bool,
    /// Artifact whose presence proves the capability, relative to the project root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            implemented: false,
            file_path: None,
        }
    }

    pub fn with_file(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }
}
