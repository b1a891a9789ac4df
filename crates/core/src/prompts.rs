//! Prompt Templates
//!
//! Prompts are markdown files keyed by file stem (`select_next_question.md`
//! becomes `select_next_question`). Placeholders are written as `{name}`.
//! The repository's `prompts/` directory is compiled in as the default set so
//! that the flow works without any files on disk.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

pub const SELECT_NEXT_QUESTION: &str = "select_next_question";
pub const TRANSITION: &str = "transition";
pub const CLOSING: &str = "closing";

/// A set of named prompt templates.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    templates: HashMap<String, String>,
}

impl PromptTemplates {
    /// The templates shipped with the repository.
    pub fn builtin() -> Self {
        let templates = [
            (
                SELECT_NEXT_QUESTION,
                include_str!("../../../prompts/select_next_question.md"),
            ),
            (TRANSITION, include_str!("../../../prompts/transition.md")),
            (CLOSING, include_str!("../../../prompts/closing.md")),
        ]
        .into_iter()
        .map(|(key, body)| (key.to_string(), body.to_string()))
        .collect();
        Self { templates }
    }

    /// Loads every `.md` file in `dir`, layered over the built-in set.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut prompts = Self::builtin();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read prompts directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .context("Could not get file stem")?
                    .to_string();
                let content = std::fs::read_to_string(&path)?;
                prompts.templates.insert(key, content);
            }
        }
        Ok(prompts)
    }

    /// Renders template `key`, replacing each `{name}` with its value.
    pub fn render(&self, key: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self
            .templates
            .get(key)
            .with_context(|| format!("Missing prompt template: '{key}'"))?;
        Ok(vars.iter().fold(template.clone(), |acc, (name, value)| {
            acc.replace(&format!("{{{name}}}"), value)
        }))
    }
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::builtin()
    }
}
