//! System prompt loading.
//!
//! Prompt files are Markdown templates with two placeholders:
//! `{filesystem_path}` and `{tools_description}`.

use std::path::{Path, PathBuf};

const FILESYSTEM_PATH_PLACEHOLDER: &str = "{filesystem_path}";
const TOOLS_DESCRIPTION_PLACEHOLDER: &str = "{tools_description}";

#[derive(Debug, Clone)]
pub struct PromptManager {
    prompt_file: PathBuf,
    filesystem_path: String,
    tools_description: String,
}

impl PromptManager {
    pub fn new(prompt_file: impl Into<PathBuf>, filesystem_path: impl Into<String>) -> Self {
        let prompt_file = prompt_file.into();
        tracing::info!(prompt_file = %prompt_file.display(), "Prompt manager ready");
        Self {
            prompt_file,
            filesystem_path: filesystem_path.into(),
            tools_description: "\nNo tools loaded or available.".to_string(),
        }
    }

    pub fn prompt_file(&self) -> &Path {
        &self.prompt_file
    }

    pub fn set_tools_description(&mut self, description: impl Into<String>) {
        self.tools_description = description.into();
    }

    fn render(&self, template: &str) -> String {
        template
            .replace(FILESYSTEM_PATH_PLACEHOLDER, &self.filesystem_path)
            .replace(TOOLS_DESCRIPTION_PLACEHOLDER, &self.tools_description)
    }

    /// Load and render the prompt file, falling back to the built-in prompt
    /// when it is missing or unreadable.
    pub async fn system_prompt(&self) -> String {
        match tokio::fs::read_to_string(&self.prompt_file).await {
            Ok(template) => {
                tracing::info!(prompt_file = %self.prompt_file.display(), "Loaded system prompt");
                self.render(&template)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    prompt_file = %self.prompt_file.display(),
                    "Prompt file not found, using the default prompt"
                );
                self.default_prompt()
            }
            Err(e) => {
                tracing::error!(
                    prompt_file = %self.prompt_file.display(),
                    error = %e,
                    "Failed to read prompt file, using the default prompt"
                );
                self.default_prompt()
            }
        }
    }

    pub async fn reload(&self) -> String {
        tracing::info!("Reloading system prompt");
        self.system_prompt().await
    }

    /// Point at another prompt file. Returns `false`, leaving the current
    /// file in place, when `path` does not exist.
    pub async fn switch(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::info!(prompt_file = %path.display(), "Switched prompt file");
            self.prompt_file = path;
            true
        } else {
            tracing::error!(prompt_file = %path.display(), "Prompt file not found");
            false
        }
    }

    pub fn default_prompt(&self) -> String {
        format!(
            "You are a smart AI assistant with access to a set of tools.

WORKING DIRECTORY: {fs}
All file operations are relative to this directory.

AVAILABLE TOOLS:
{tools}

RULES:
1. Work out which operation the user is asking for
2. Use ONLY the tools listed above
3. Pick tools by their names and descriptions
4. Prefer relative paths; use absolute paths only when a tool requires them
5. When creating files with content, pass the content through the tool parameters
6. When no path is given, work in the working directory
7. If no tool fits exactly, look for an alternative among the available ones
8. NEVER invent tools or commands that do not exist

RESPONSE FORMAT:
- Briefly confirm what was done
- On errors, explain the cause and suggest a fix
- For multi-step operations, describe each step",
            fs = self.filesystem_path,
            tools = self.tools_description,
        )
    }
}

/// `prompt*.md` files in `dir`, sorted by name.
pub async fn available_prompts(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("prompt") && name.ends_with(".md") {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_renders_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("prompt.md");
        std::fs::write(&file, "Dir: {filesystem_path}\nTools:{tools_description}").unwrap();

        let mut pm = PromptManager::new(&file, "/work/");
        pm.set_tools_description("\nREADING FILES:\n  • read_file: Read");
        let prompt = pm.system_prompt().await;
        assert_eq!(prompt, "Dir: /work/\nTools:\nREADING FILES:\n  • read_file: Read");
    }

    #[tokio::test]
    async fn test_missing_file_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PromptManager::new(dir.path().join("nope.md"), "/work/");
        let prompt = pm.system_prompt().await;
        assert!(prompt.contains("WORKING DIRECTORY: /work/"));
        assert!(prompt.contains("No tools loaded or available."));
        assert!(!prompt.contains("{tools_description}"));
    }

    #[tokio::test]
    async fn test_switch_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prompt.md"), "one").unwrap();
        std::fs::write(dir.path().join("prompt_ru.md"), "two").unwrap();
        std::fs::write(dir.path().join("notes.md"), "x").unwrap();

        let mut pm = PromptManager::new(dir.path().join("prompt.md"), "/");
        assert!(!pm.switch(dir.path().join("missing.md")).await);
        assert_eq!(pm.reload().await, "one");
        assert!(pm.switch(dir.path().join("prompt_ru.md")).await);
        assert_eq!(pm.system_prompt().await, "two");

        let names = available_prompts(dir.path()).await.unwrap();
        assert_eq!(names, vec!["prompt.md".to_string(), "prompt_ru.md".to_string()]);
    }
}
