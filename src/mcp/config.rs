use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

const FILESYSTEM_PLACEHOLDER: &str = "{filesystem_path}";

static ENV_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

#[derive(Debug, Error)]
pub enum McpConfigError {
    #[error("failed to read MCP config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid MCP config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP config must be a JSON object of servers")]
    NotAnObject,

    #[error("server '{server}': entry must be a JSON object")]
    InvalidEntry { server: String },

    #[error("server '{server}': unknown transport '{transport}' (expected stdio, sse or streamable-http)")]
    UnknownTransport { server: String, transport: String },

    #[error("server '{server}': missing required field '{field}' for {transport} transport")]
    MissingField {
        server: String,
        field: &'static str,
        transport: &'static str,
    },

    #[error("server '{server}': invalid url '{url}': {reason}")]
    InvalidUrl {
        server: String,
        url: String,
        reason: String,
    },

    #[error("server '{server}': url '{url}' must use http or https")]
    InvalidUrlScheme { server: String, url: String },

    #[error("server '{server}': field '{field}' {expected}")]
    InvalidField {
        server: String,
        field: &'static str,
        expected: &'static str,
    },
}

/// How the agent reaches one MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpTransport {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Sse {
        url: Url,
        headers: HashMap<String, String>,
    },
    StreamableHttp {
        url: Url,
        headers: HashMap<String, String>,
    },
}

impl McpTransport {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable-http",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpServerEntry {
    pub transport: McpTransport,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McpConfig {
    pub servers: BTreeMap<String, McpServerEntry>,
}

impl McpConfig {
    /// Load the registry file.
    ///
    /// A missing or syntactically broken file yields [`McpConfig::default_servers`].
    /// Schema errors are returned: a server that is present but misconfigured
    /// aborts initialisation.
    pub fn load(path: &Path, filesystem_path: &str) -> Result<Self, McpConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "MCP config not found, using default servers"
                );
                return Ok(Self::default_servers(filesystem_path));
            }
            Err(source) => {
                return Err(McpConfigError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        match Self::parse(&text, filesystem_path) {
            Err(McpConfigError::Json(e)) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "MCP config is not valid JSON, using default servers"
                );
                Ok(Self::default_servers(filesystem_path))
            }
            other => other,
        }
    }

    /// Parse and validate a registry document.
    pub fn parse(text: &str, filesystem_path: &str) -> Result<Self, McpConfigError> {
        let root: Value = serde_json::from_str(text)?;
        let root = substitute_placeholder(root, &normalize_path(filesystem_path));

        let Value::Object(mut root) = root else {
            return Err(McpConfigError::NotAnObject);
        };

        let servers = match root.remove("mcpServers") {
            Some(Value::Object(map)) => map,
            Some(_) => return Err(McpConfigError::NotAnObject),
            None => root,
        };

        let mut parsed = BTreeMap::new();
        for (name, raw) in servers {
            let enabled = is_enabled(&name, &raw)?;
            match parse_entry(&name, raw) {
                Ok(entry) => {
                    parsed.insert(name, entry);
                }
                Err(e) if !enabled => {
                    tracing::warn!(
                        server = %name,
                        error = %e,
                        "Ignoring invalid entry of disabled MCP server"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self { servers: parsed })
    }

    /// Servers used when no registry file is available.
    #[must_use]
    pub fn default_servers(filesystem_path: &str) -> Self {
        let stdio = |command: &str, args: &[&str]| McpServerEntry {
            transport: McpTransport::Stdio {
                command: command.to_string(),
                args: args.iter().map(|a| (*a).to_string()).collect(),
                env: HashMap::new(),
            },
            enabled: true,
        };

        let path = normalize_path(filesystem_path);
        let mut servers = BTreeMap::new();
        servers.insert(
            "filesystem".to_string(),
            stdio(
                "npx",
                &["-y", "@modelcontextprotocol/server-filesystem", &path],
            ),
        );
        servers.insert(
            "duckduckgo".to_string(),
            stdio("uvx", &["duckduckgo-mcp-server"]),
        );
        servers.insert("fetch".to_string(), stdio("uvx", &["mcp-server-fetch"]));
        Self { servers }
    }

    /// Enabled servers in name order. Logs the split between enabled and
    /// disabled entries.
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &McpServerEntry)> {
        let disabled: Vec<&str> = self
            .servers
            .iter()
            .filter(|(_, e)| !e.enabled)
            .map(|(n, _)| n.as_str())
            .collect();
        tracing::info!(
            total = self.servers.len(),
            enabled = self.servers.len() - disabled.len(),
            "MCP servers configured"
        );
        if !disabled.is_empty() {
            tracing::info!(servers = ?disabled, "Skipping disabled MCP servers");
        }
        self.servers.iter().filter(|(_, e)| e.enabled)
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn substitute_placeholder(value: Value, path: &str) -> Value {
    match value {
        Value::String(s) if s.contains(FILESYSTEM_PLACEHOLDER) => {
            Value::String(s.replace(FILESYSTEM_PLACEHOLDER, path))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute_placeholder(v, path))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_placeholder(v, path)))
                .collect(),
        ),
        other => other,
    }
}

/// Expand `${VAR}` references from the process environment.
/// Unset variables expand to the empty string.
pub fn expand_env_placeholders(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let Some(re) = ENV_REF.as_ref() else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            tracing::warn!(var = name, "Environment variable referenced in MCP config is not set");
            String::new()
        })
    })
    .into_owned()
}

/// Reads the `enabled` flag before anything else. Entries that are not
/// objects count as enabled so that they fail loudly.
fn is_enabled(server: &str, raw: &Value) -> Result<bool, McpConfigError> {
    match raw.get("enabled") {
        None | Some(Value::Null) => Ok(true),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(invalid(server, "enabled", "must be a boolean")),
    }
}

fn parse_entry(server: &str, raw: Value) -> Result<McpServerEntry, McpConfigError> {
    let enabled = is_enabled(server, &raw)?;
    let Value::Object(obj) = raw else {
        return Err(McpConfigError::InvalidEntry {
            server: server.to_string(),
        });
    };

    let kind = match obj.get("transport") {
        Some(Value::String(t)) => t.trim().to_ascii_lowercase(),
        Some(other) => {
            return Err(McpConfigError::UnknownTransport {
                server: server.to_string(),
                transport: other.to_string(),
            });
        }
        None if obj.contains_key("command") => "stdio".to_string(),
        None if obj.contains_key("url") => "streamable-http".to_string(),
        None => "stdio".to_string(),
    };

    let transport = match kind.as_str() {
        "stdio" => {
            let command = non_empty_str(server, &obj, "command", "stdio")?;
            let args = string_list(server, &obj, "args")?;
            let env = string_map(server, &obj, "env")?;
            McpTransport::Stdio { command, args, env }
        }
        "sse" => McpTransport::Sse {
            url: http_url(server, &obj, "sse")?,
            headers: string_map(server, &obj, "headers")?,
        },
        "streamable-http" | "streamable_http" | "http" => McpTransport::StreamableHttp {
            url: http_url(server, &obj, "streamable-http")?,
            headers: string_map(server, &obj, "headers")?,
        },
        other => {
            return Err(McpConfigError::UnknownTransport {
                server: server.to_string(),
                transport: other.to_string(),
            });
        }
    };

    Ok(McpServerEntry { transport, enabled })
}

fn invalid(server: &str, field: &'static str, expected: &'static str) -> McpConfigError {
    McpConfigError::InvalidField {
        server: server.to_string(),
        field,
        expected,
    }
}

fn non_empty_str(
    server: &str,
    obj: &Map<String, Value>,
    field: &'static str,
    transport: &'static str,
) -> Result<String, McpConfigError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_) | Value::Null) | None => Err(McpConfigError::MissingField {
            server: server.to_string(),
            field,
            transport,
        }),
        Some(_) => Err(invalid(server, field, "must be a string")),
    }
}

fn string_list(
    server: &str,
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, McpConfigError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(server, field, "must be a list of strings"))
            })
            .collect(),
        Some(_) => Err(invalid(server, field, "must be a list of strings")),
    }
}

fn string_map(
    server: &str,
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<HashMap<String, String>, McpConfigError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(HashMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), expand_env_placeholders(s))),
                _ => Err(invalid(server, field, "must map names to strings")),
            })
            .collect(),
        Some(_) => Err(invalid(server, field, "must map names to strings")),
    }
}

fn http_url(
    server: &str,
    obj: &Map<String, Value>,
    transport: &'static str,
) -> Result<Url, McpConfigError> {
    let raw = non_empty_str(server, obj, "url", transport)?;
    let url = Url::parse(raw.trim()).map_err(|e| McpConfigError::InvalidUrl {
        server: server.to_string(),
        url: raw.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(McpConfigError::InvalidUrlScheme {
            server: server.to_string(),
            url: raw,
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: &str = "/work/project/";

    #[test]
    fn test_parses_all_transports() {
        let cfg = McpConfig::parse(
            r#"{
                "files": { "transport": "stdio", "command": "npx", "args": ["-y", "server", "{filesystem_path}"], "env": { "MODE": "ro" } },
                "legacy": { "transport": "sse", "url": "http://localhost:9000/sse", "headers": { "X-Key": "abc" } },
                "remote": { "transport": "streamable-http", "url": "https://mcp.example.com/mcp" },
                "underscore": { "transport": "streamable_http", "url": "https://mcp.example.com/other" }
            }"#,
            FS,
        )
        .unwrap();

        assert_eq!(cfg.servers.len(), 4);
        match &cfg.servers["files"].transport {
            McpTransport::Stdio { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &["-y", "server", "/work/project/"]);
                assert_eq!(env.get("MODE").map(String::as_str), Some("ro"));
            }
            other => panic!("unexpected transport {other:?}"),
        }
        match &cfg.servers["legacy"].transport {
            McpTransport::Sse { url, headers } => {
                assert_eq!(url.as_str(), "http://localhost:9000/sse");
                assert_eq!(headers.get("X-Key").map(String::as_str), Some("abc"));
            }
            other => panic!("unexpected transport {other:?}"),
        }
        assert_eq!(cfg.servers["remote"].transport.kind(), "streamable-http");
        assert_eq!(cfg.servers["underscore"].transport.kind(), "streamable-http");
    }

    #[test]
    fn test_accepts_wrapped_form_and_infers_transport() {
        let cfg = McpConfig::parse(
            r#"{ "mcpServers": {
                "time": { "command": "uvx", "args": ["mcp-server-time"] },
                "web": { "url": "https://mcp.example.com/mcp/" }
            } }"#,
            FS,
        )
        .unwrap();
        assert_eq!(cfg.servers["time"].transport.kind(), "stdio");
        assert_eq!(cfg.servers["web"].transport.kind(), "streamable-http");
    }

    #[test]
    fn test_windows_paths_are_normalised() {
        let cfg = McpConfig::parse(
            r#"{ "fs": { "command": "npx", "args": ["{filesystem_path}"] } }"#,
            "C:\\Users\\me\\work\\",
        )
        .unwrap();
        let McpTransport::Stdio { args, .. } = &cfg.servers["fs"].transport else {
            panic!("expected stdio");
        };
        assert_eq!(args, &["C:/Users/me/work/"]);
    }

    #[test]
    fn test_enabled_filters_disabled_servers() {
        let cfg = McpConfig::parse(
            r#"{
                "a": { "command": "a" },
                "b": { "command": "b", "enabled": false },
                "c": { "command": "c", "enabled": true }
            }"#,
            FS,
        )
        .unwrap();
        let names: Vec<&str> = cfg.enabled().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn test_invalid_disabled_server_does_not_abort_load() {
        let cfg = McpConfig::parse(
            r#"{
                "good": { "command": "npx", "args": ["server"] },
                "broken": { "transport": "sse", "url": "ftp://old.example.com/sse", "enabled": false },
                "half": { "transport": "stdio", "enabled": false }
            }"#,
            FS,
        )
        .unwrap();
        let names: Vec<&str> = cfg.enabled().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["good"]);
        assert!(!cfg.servers.contains_key("broken"));

        let err = McpConfig::parse(
            r#"{ "broken": { "transport": "sse", "url": "ftp://old.example.com/sse", "enabled": true } }"#,
            FS,
        )
        .unwrap_err();
        assert!(matches!(err, McpConfigError::InvalidUrlScheme { .. }));

        let err = McpConfig::parse(r#"{ "odd": { "command": "x", "enabled": "no" } }"#, FS)
            .unwrap_err();
        assert!(matches!(err, McpConfigError::InvalidField { field: "enabled", .. }));
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let err = McpConfig::parse(
            r#"{ "ftp": { "transport": "sse", "url": "ftp://example.com/sse" } }"#,
            FS,
        )
        .unwrap_err();
        assert!(matches!(err, McpConfigError::InvalidUrlScheme { ref server, .. } if server == "ftp"));
        assert!(err.to_string().contains("'ftp'"));
    }

    #[test]
    fn test_rejects_unparseable_url() {
        let err = McpConfig::parse(
            r#"{ "broken": { "transport": "streamable-http", "url": "not a url" } }"#,
            FS,
        )
        .unwrap_err();
        assert!(matches!(err, McpConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn test_rejects_missing_fields() {
        let err = McpConfig::parse(r#"{ "x": { "transport": "stdio" } }"#, FS).unwrap_err();
        assert!(matches!(
            err,
            McpConfigError::MissingField { field: "command", .. }
        ));

        let err = McpConfig::parse(r#"{ "y": { "transport": "sse" } }"#, FS).unwrap_err();
        assert!(matches!(err, McpConfigError::MissingField { field: "url", .. }));

        let err = McpConfig::parse(r#"{ "z": { "command": "  " } }"#, FS).unwrap_err();
        assert!(matches!(err, McpConfigError::MissingField { .. }));
    }

    #[test]
    fn test_rejects_unknown_transport_and_bad_field_types() {
        let err =
            McpConfig::parse(r#"{ "w": { "transport": "websocket", "url": "ws://x" } }"#, FS)
                .unwrap_err();
        assert!(matches!(err, McpConfigError::UnknownTransport { ref transport, .. } if transport == "websocket"));

        let err = McpConfig::parse(r#"{ "a": { "command": "x", "args": "oops" } }"#, FS)
            .unwrap_err();
        assert!(matches!(err, McpConfigError::InvalidField { field: "args", .. }));

        let err = McpConfig::parse(r#"{ "a": { "command": "x", "env": { "K": 1 } } }"#, FS)
            .unwrap_err();
        assert!(matches!(err, McpConfigError::InvalidField { field: "env", .. }));
    }

    #[test]
    fn test_env_expansion() {
        let out = expand_with("Bearer ${TOKEN}-${MISSING}", |name| {
            (name == "TOKEN").then(|| "s3cret".to_string())
        });
        assert_eq!(out, "Bearer s3cret-");
        assert_eq!(expand_with("plain", |_| None), "plain");
    }

    #[test]
    fn test_missing_file_uses_default_servers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = McpConfig::load(&dir.path().join("mcp.json"), FS).unwrap();
        let names: Vec<&str> = cfg.servers.keys().map(String::as_str).collect();
        assert_eq!(names, ["duckduckgo", "fetch", "filesystem"]);
        let McpTransport::Stdio { args, .. } = &cfg.servers["filesystem"].transport else {
            panic!("expected stdio");
        };
        assert_eq!(args.last().map(String::as_str), Some(FS));
    }

    #[test]
    fn test_invalid_json_uses_default_servers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, "{ not json").unwrap();
        let cfg = McpConfig::load(&path, FS).unwrap();
        assert_eq!(cfg, McpConfig::default_servers(FS));
    }

    #[test]
    fn test_schema_error_in_file_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, r#"{ "bad": { "transport": "sse", "url": "file:///tmp/x" } }"#)
            .unwrap();
        assert!(matches!(
            McpConfig::load(&path, FS),
            Err(McpConfigError::InvalidUrlScheme { .. })
        ));
    }
}
