//! Goal text for unresolved capabilities.
//!
//! The bundled template is embedded with include_str! and used when no
//! project template is found.

use anyhow::{Context, Result};
use minijinja::Environment;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::models::Capability;

/// Bundled default gap goal template
pub const DEFAULT_GOAL_TEMPLATE: &str = include_str!("../templates/goal.j2");

const GOAL: &str = "goal";

/// Template resolution result
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateSource {
    /// Template loaded from a file path
    File(PathBuf),
    /// Bundled default
    Bundled(&'static str),
}

impl TemplateSource {
    pub fn content(&self) -> std::io::Result<String> {
        match self {
            TemplateSource::File(path) => std::fs::read_to_string(path),
            TemplateSource::Bundled(content) => Ok(content.to_string()),
        }
    }
}

/// Resolve the goal template, falling back to the bundled default.
///
/// Resolution priority:
/// 1. Configured path (relative to `base_dir`) if it exists
/// 2. Project-local `.build-forge/templates/goal.j2`
/// 3. Bundled default
pub fn resolve_goal_template(configured: Option<&Path>, base_dir: &Path) -> TemplateSource {
    if let Some(path) = configured {
        let explicit = base_dir.join(path);
        if explicit.exists() {
            debug!("Using goal template from {:?}", explicit);
            return TemplateSource::File(explicit);
        }
        warn!("Goal template {:?} not found, falling back", explicit);
    }

    let local = base_dir.join(".build-forge/templates/goal.j2");
    if local.exists() {
        debug!("Using project goal template {:?}", local);
        return TemplateSource::File(local);
    }

    TemplateSource::Bundled(DEFAULT_GOAL_TEMPLATE)
}

/// Compiled gap goal template.
pub struct GoalTemplate {
    env: Environment<'static>,
}

impl std::fmt::Debug for GoalTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalTemplate").finish_non_exhaustive()
    }
}

impl Default for GoalTemplate {
    fn default() -> Self {
        Self::bundled()
    }
}

impl GoalTemplate {
    pub fn bundled() -> Self {
        let mut env = Environment::new();
        if let Err(e) = env.add_template(GOAL, DEFAULT_GOAL_TEMPLATE) {
            // Rendering then falls back to plain text
            warn!("Bundled goal template failed to compile: {}", e);
        }
        Self { env }
    }

    /// Compile a template from source; syntax errors surface here.
    pub fn from_source(source: String) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template_owned(GOAL, source)
            .context("Failed to compile goal template")?;
        Ok(Self { env })
    }

    pub fn load(source: &TemplateSource) -> Result<Self> {
        match source {
            TemplateSource::Bundled(_) => Ok(Self::bundled()),
            TemplateSource::File(path) => {
                let content = source
                    .content()
                    .with_context(|| format!("Failed to read goal template {:?}", path))?;
                Self::from_source(content)
            }
        }
    }

    /// Goal text for one gap. A render failure falls back to a plain sentence.
    pub fn render(&self, capability: &Capability) -> String {
        let rendered = self
            .env
            .get_template(GOAL)
            .and_then(|tpl| tpl.render(capability));
        match rendered {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Goal template failed for {}: {}", capability.name, e);
                fallback_goal(capability)
            }
        }
    }
}

fn fallback_goal(capability: &Capability) -> String {
    let mut goal = format!(
        "Generate the missing component: {}. Description: {}.",
        capability.name, capability.description
    );
    if let Some(path) = &capability.file_path {
        goal.push_str(&format!(" Target file: {}.", path));
    }
    goal
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bundled_goal_mentions_target() {
        let capability = Capability::new("api", "HTTP handlers").with_file("src/api.rs");
        let goal = GoalTemplate::bundled().render(&capability);

        assert!(goal.starts_with("Generate the missing component: api."));
        assert!(goal.contains("Description: HTTP handlers."));
        assert!(goal.contains("Target file: src/api.rs."));
    }

    #[test]
    fn test_goal_without_file_path() {
        let goal = GoalTemplate::bundled().render(&Capability::new("docs", "User guide"));
        assert!(!goal.contains("Target file"));
    }

    #[test]
    fn test_custom_template() {
        let template = GoalTemplate::from_source("Build {{ name }} at {{ file_path }}".to_string()).unwrap();
        let capability = Capability::new("core", "").with_file("src/core.rs");
        assert_eq!(template.render(&capability), "Build core at src/core.rs");
    }

    #[test]
    fn test_syntax_error_rejected() {
        assert!(GoalTemplate::from_source("{% if %}".to_string()).is_err());
    }

    #[test]
    fn test_resolution_priority() {
        let dir = tempdir().unwrap();
        assert_eq!(
            resolve_goal_template(None, dir.path()),
            TemplateSource::Bundled(DEFAULT_GOAL_TEMPLATE)
        );

        let local = dir.path().join(".build-forge/templates/goal.j2");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, "local").unwrap();
        assert_eq!(
            resolve_goal_template(Some(Path::new("missing.j2")), dir.path()),
            TemplateSource::File(local)
        );

        let explicit = dir.path().join("goal.j2");
        std::fs::write(&explicit, "explicit").unwrap();
        assert_eq!(
            resolve_goal_template(Some(Path::new("goal.j2")), dir.path()),
            TemplateSource::File(explicit)
        );
    }
}
