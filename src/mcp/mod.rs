//! Model Context Protocol (MCP) client side.
//!
//! Servers are described in `mcp.json` and reached over one of three
//! transports: `stdio` child processes, legacy `sse`, or `streamable-http`.
//!
//! ```json
//! {
//!   "filesystem": {
//!     "transport": "stdio",
//!     "command": "npx",
//!     "args": ["-y", "@modelcontextprotocol/server-filesystem", "{filesystem_path}"]
//!   },
//!   "search": {
//!     "transport": "streamable-http",
//!     "url": "https://mcp.example.com/mcp",
//!     "headers": { "Authorization": "Bearer ${SEARCH_TOKEN}" }
//!   }
//! }
//! ```
//!
//! # Tool Namespacing
//!
//! Server tools are exposed to the model as `server__tool`
//! (e.g., `filesystem__read_file`). Local tools keep their bare name.

pub mod config;
pub mod registry;
pub mod sse;

pub use config::{McpConfig, McpConfigError, McpServerEntry, McpTransport};
pub use registry::{
    ConnectOptions, McpRegistry, NativeTool, RegisteredTool, ToolError, ToolOutput,
};

use std::collections::HashMap;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Convert configured headers into a `reqwest` header map.
pub(crate) fn header_map(headers: &HashMap<String, String>) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .with_context(|| format!("invalid header name '{k}'"))?;
        let value =
            HeaderValue::from_str(v).with_context(|| format!("invalid value for header '{k}'"))?;
        map.insert(name, value);
    }
    Ok(map)
}
