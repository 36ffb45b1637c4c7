//! Agent configuration.
//!
//! Configuration is layered the same way for every run:
//!
//! 1. built-in defaults
//! 2. the JSON config file (`config.json`, or `--config <path>`)
//! 3. documented environment variables (`GEMINI_MODEL`, `OPENROUTER_MODEL`,
//!    `TEMPERATURE`, `FILESYSTEM_PATH`)
//!
//! ```json
//! {
//!   "agent": { "model_name": "gemini-2.5-flash", "model_provider": "gemini" },
//!   "files": { "prompt_file": "prompt.md", "mcp_config_file": "mcp.json" },
//!   "logging": { "level": "INFO", "file": "ai_agent.log" }
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use config::{Config, FileFormat};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_PROMPT_FILE: &str = "prompt.md";
pub const DEFAULT_MCP_CONFIG_FILE: &str = "mcp.json";
pub const DEFAULT_LOG_FILE: &str = "ai_agent.log";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 300.0;
pub const DEFAULT_TOOL_TIMEOUT_SECS: f64 = 300.0;
pub const DEFAULT_RECURSION_LIMIT: usize = 25;
/// Largest accepted `request_timeout` / `tool_timeout`, in seconds.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;
pub const DEFAULT_MAX_CONTEXT_FILES: usize = 20;

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal AI agent for Gemini and OpenRouter with MCP tool servers", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, env = "AGENT_CONFIG_FILE", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("path does not exist: {0}")]
    MissingPath(PathBuf),

    #[error("missing environment variable: {0}")]
    MissingApiKey(&'static str),

    #[error("unsupported model provider: {0}")]
    UnsupportedProvider(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// LLM backend selected by `agent.model_provider`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ModelProvider {
    #[default]
    Gemini,
    OpenRouter,
}

impl ModelProvider {
    /// Environment variable holding the API key for this provider.
    #[must_use]
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::Gemini => "GOOGLE_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Human readable name used in operator messages.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Gemini => "Google Gemini",
            Self::OpenRouter => "OpenRouter",
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(ConfigError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl TryFrom<String> for ModelProvider {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub model_name: String,
    pub model_provider: ModelProvider,
    pub temperature: f32,
    /// Seconds allowed for a single model request (connect + stream).
    pub request_timeout: f64,
    /// Seconds allowed for a single tool call.
    pub tool_timeout: f64,
    /// Maximum model rounds in one turn.
    pub recursion_limit: usize,
    pub use_memory: bool,
    pub max_context_files: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesSection {
    pub prompt_file: PathBuf,
    pub mcp_config_file: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    pub level: String,
    /// Log file path; `null` or an empty string disables the file sink.
    pub file: Option<String>,
    pub format: LogFormat,
    #[serde(default, alias = "debug")]
    pub debug_mode: bool,
}

impl LoggingSection {
    /// Map the configured level onto a `tracing` filter directive.
    ///
    /// Python-style names (`WARNING`, `CRITICAL`) are accepted; anything
    /// unknown falls back to `info`.
    #[must_use]
    pub fn filter_directive(&self) -> &'static str {
        if self.debug_mode {
            return "debug";
        }
        match self.level.trim().to_ascii_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "CRITICAL" | "FATAL" => "error",
            _ => "info",
        }
    }

    #[must_use]
    pub fn file_path(&self) -> Option<&str> {
        self.file.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub files: FilesSection,
    pub logging: LoggingSection,
    /// Working directory for filesystem tools. Only settable through
    /// `FILESYSTEM_PATH`; defaults to the current directory.
    #[serde(skip)]
    pub filesystem_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentSection {
                model_name: DEFAULT_MODEL.to_string(),
                model_provider: ModelProvider::Gemini,
                temperature: 0.0,
                request_timeout: DEFAULT_REQUEST_TIMEOUT_SECS,
                tool_timeout: DEFAULT_TOOL_TIMEOUT_SECS,
                recursion_limit: DEFAULT_RECURSION_LIMIT,
                use_memory: true,
                max_context_files: DEFAULT_MAX_CONTEXT_FILES,
            },
            files: FilesSection {
                prompt_file: PathBuf::from(DEFAULT_PROMPT_FILE),
                mcp_config_file: PathBuf::from(DEFAULT_MCP_CONFIG_FILE),
            },
            logging: LoggingSection {
                level: "INFO".to_string(),
                file: Some(DEFAULT_LOG_FILE.to_string()),
                format: LogFormat::Text,
                debug_mode: false,
            },
            filesystem_path: current_dir(),
        }
    }
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

impl AgentConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// cannot be parsed. The parse error is handed back instead of logged so
    /// the caller can report it once logging is up.
    pub fn load(path: &Path) -> (Self, Option<ConfigError>) {
        match Self::try_load(path) {
            Ok(cfg) => (cfg, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults. A file that exists but cannot be
    /// parsed is an error; callers decide whether to fall back.
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("agent.model_name", DEFAULT_MODEL)?
            .set_default("agent.model_provider", "gemini")?
            .set_default("agent.temperature", 0.0)?
            .set_default("agent.request_timeout", DEFAULT_REQUEST_TIMEOUT_SECS)?
            .set_default("agent.tool_timeout", DEFAULT_TOOL_TIMEOUT_SECS)?
            .set_default("agent.recursion_limit", 25_i64)?
            .set_default("agent.use_memory", true)?
            .set_default("agent.max_context_files", 20_i64)?
            .set_default("files.prompt_file", DEFAULT_PROMPT_FILE)?
            .set_default("files.mcp_config_file", DEFAULT_MCP_CONFIG_FILE)?
            .set_default("logging.level", "INFO")?
            .set_default("logging.file", DEFAULT_LOG_FILE)?
            .set_default("logging.format", "text")?;

        if path.exists() {
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                FileFormat::Json,
            ));
        }

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.filesystem_path = current_dir();
        Ok(cfg)
    }

    /// Apply the documented environment overrides from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env_overrides(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// `OPENROUTER_MODEL` is applied after `GEMINI_MODEL`, so it wins when
    /// both are present.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = non_empty("FILESYSTEM_PATH") {
            self.filesystem_path = PathBuf::from(path);
        }
        if let Some(model) = non_empty("GEMINI_MODEL") {
            self.agent.model_name = model;
            self.agent.model_provider = ModelProvider::Gemini;
        }
        if let Some(model) = non_empty("OPENROUTER_MODEL") {
            self.agent.model_name = model;
            self.agent.model_provider = ModelProvider::OpenRouter;
        }
        if let Some(raw) = non_empty("TEMPERATURE") {
            match raw.trim().parse::<f32>() {
                Ok(t) => self.agent.temperature = t,
                Err(e) => tracing::warn!(value = %raw, error = %e, "Ignoring invalid TEMPERATURE"),
            }
        }
    }

    /// Check the configuration against the process environment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with(|key| std::env::var(key).ok())
    }

    pub fn validate_with<F>(&self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if !self.filesystem_path.exists() {
            return Err(ConfigError::MissingPath(self.filesystem_path.clone()));
        }

        let key_var = self.agent.model_provider.api_key_env();
        if lookup(key_var).is_none_or(|v| v.trim().is_empty()) {
            return Err(ConfigError::MissingApiKey(key_var));
        }

        check_timeout("agent.request_timeout", self.agent.request_timeout)?;
        check_timeout("agent.tool_timeout", self.agent.tool_timeout)?;
        if self.agent.recursion_limit == 0 {
            return Err(ConfigError::Invalid(
                "agent.recursion_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        timeout_duration(self.agent.request_timeout, DEFAULT_REQUEST_TIMEOUT_SECS)
    }

    #[must_use]
    pub fn tool_timeout(&self) -> Duration {
        timeout_duration(self.agent.tool_timeout, DEFAULT_TOOL_TIMEOUT_SECS)
    }

    /// Working directory rendered for prompts and `{filesystem_path}`
    /// placeholders: forward slashes and a trailing separator.
    #[must_use]
    pub fn filesystem_path_display(&self) -> String {
        let mut s = self.filesystem_path.to_string_lossy().replace('\\', "/");
        if !s.ends_with('/') {
            s.push('/');
        }
        s
    }
}

fn check_timeout(field: &str, secs: f64) -> Result<(), ConfigError> {
    if secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECS {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must be between 0 and {MAX_TIMEOUT_SECS} seconds, got {secs}"
        )))
    }
}

/// Out-of-range values fall back to `default`; `validate` reports them.
fn timeout_duration(secs: f64, default: f64) -> Duration {
    let secs = if secs.is_finite() && secs > 0.0 { secs.min(MAX_TIMEOUT_SECS) } else { default };
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(300))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = AgentConfig::try_load(Path::new("definitely-not-here.json")).unwrap();
        assert_eq!(cfg.agent.model_name, DEFAULT_MODEL);
        assert_eq!(cfg.agent.model_provider, ModelProvider::Gemini);
        assert_eq!(cfg.agent.recursion_limit, DEFAULT_RECURSION_LIMIT);
        assert!(cfg.agent.use_memory);
        assert_eq!(cfg.files.mcp_config_file, PathBuf::from("mcp.json"));
        assert_eq!(cfg.logging.file_path(), Some(DEFAULT_LOG_FILE));
    }

    #[test]
    fn test_file_values_override_defaults() {
        let file = write_config(
            r#"{
                "agent": {
                    "model_name": "anthropic/claude-3.5-sonnet",
                    "model_provider": "OpenRouter",
                    "temperature": 0.3,
                    "tool_timeout": 45,
                    "recursion_limit": 8
                },
                "files": { "prompt_file": "prompt_dev.md" },
                "logging": { "level": "debug", "file": null, "format": "json" },
                "unrelated": { "ignored": true }
            }"#,
        );

        let cfg = AgentConfig::try_load(file.path()).unwrap();
        assert_eq!(cfg.agent.model_name, "anthropic/claude-3.5-sonnet");
        assert_eq!(cfg.agent.model_provider, ModelProvider::OpenRouter);
        assert!((cfg.agent.temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(cfg.tool_timeout(), Duration::from_secs(45));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.agent.recursion_limit, 8);
        assert_eq!(cfg.files.prompt_file, PathBuf::from("prompt_dev.md"));
        assert_eq!(cfg.files.mcp_config_file, PathBuf::from("mcp.json"));
        assert_eq!(cfg.logging.file_path(), None);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.filter_directive(), "debug");
    }

    #[test]
    fn test_debug_alias_forces_debug_level() {
        let file = write_config(r#"{ "logging": { "level": "ERROR", "debug": true } }"#);
        let cfg = AgentConfig::try_load(file.path()).unwrap();
        assert!(cfg.logging.debug_mode);
        assert_eq!(cfg.logging.filter_directive(), "debug");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let file = write_config(r#"{ "agent": { "model_name": "#);
        assert!(AgentConfig::try_load(file.path()).is_err());
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let file = write_config(r#"{ "agent": { "model_provider": "ollama" } }"#);
        assert!(AgentConfig::try_load(file.path()).is_err());
        assert!(matches!(
            "ollama".parse::<ModelProvider>(),
            Err(ConfigError::UnsupportedProvider(p)) if p == "ollama"
        ));
    }

    #[test]
    fn test_env_overrides_model_and_provider() {
        let mut cfg = AgentConfig::default();
        cfg.apply_env_overrides(env(&[("GEMINI_MODEL", "gemini-2.5-pro")]));
        assert_eq!(cfg.agent.model_name, "gemini-2.5-pro");
        assert_eq!(cfg.agent.model_provider, ModelProvider::Gemini);

        cfg.apply_env_overrides(env(&[
            ("GEMINI_MODEL", "gemini-2.5-pro"),
            ("OPENROUTER_MODEL", "openai/gpt-4o-mini"),
            ("TEMPERATURE", "0.7"),
            ("FILESYSTEM_PATH", "/tmp"),
        ]));
        assert_eq!(cfg.agent.model_name, "openai/gpt-4o-mini");
        assert_eq!(cfg.agent.model_provider, ModelProvider::OpenRouter);
        assert!((cfg.agent.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(cfg.filesystem_path, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_invalid_temperature_is_ignored() {
        let mut cfg = AgentConfig::default();
        cfg.apply_env_overrides(env(&[("TEMPERATURE", "warm")]));
        assert!(cfg.agent.temperature.abs() < f32::EPSILON);
    }

    #[test]
    fn test_validate_requires_provider_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::default();
        cfg.filesystem_path = dir.path().to_path_buf();

        assert!(matches!(
            cfg.validate_with(env(&[])),
            Err(ConfigError::MissingApiKey("GOOGLE_API_KEY"))
        ));
        assert!(cfg.validate_with(env(&[("GOOGLE_API_KEY", "k")])).is_ok());

        cfg.agent.model_provider = ModelProvider::OpenRouter;
        assert!(matches!(
            cfg.validate_with(env(&[("GOOGLE_API_KEY", "k")])),
            Err(ConfigError::MissingApiKey("OPENROUTER_API_KEY"))
        ));
    }

    #[test]
    fn test_validate_rejects_missing_path_and_bad_limits() {
        let keys = [("GOOGLE_API_KEY", "k")];
        let mut cfg = AgentConfig::default();
        cfg.filesystem_path = PathBuf::from("/no/such/dir/for/agent");
        assert!(matches!(
            cfg.validate_with(env(&keys)),
            Err(ConfigError::MissingPath(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        cfg.filesystem_path = dir.path().to_path_buf();
        cfg.agent.tool_timeout = 0.0;
        assert!(matches!(
            cfg.validate_with(env(&keys)),
            Err(ConfigError::Invalid(_))
        ));

        cfg.agent.tool_timeout = 10.0;
        cfg.agent.request_timeout = 1e20;
        assert!(matches!(
            cfg.validate_with(env(&keys)),
            Err(ConfigError::Invalid(msg)) if msg.contains("agent.request_timeout")
        ));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(86_400));

        cfg.agent.request_timeout = f64::NAN;
        assert_eq!(cfg.request_timeout(), Duration::from_secs(300));

        cfg.agent.request_timeout = 30.0;
        cfg.agent.recursion_limit = 0;
        assert!(matches!(
            cfg.validate_with(env(&keys)),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_filesystem_path_display_has_trailing_slash() {
        let mut cfg = AgentConfig::default();
        cfg.filesystem_path = PathBuf::from("C:\\work\\project");
        assert_eq!(cfg.filesystem_path_display(), "C:/work/project/");
    }
}
