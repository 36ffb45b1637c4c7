//! Gemini MCP Agent
//!
//! A terminal AI agent that talks to Google Gemini or OpenRouter models and
//! gives them tools served over the Model Context Protocol.
//!
//! # Architecture
//!
//! - **Configuration**: layered `config.json` + environment overrides
//! - **MCP Client**: tool discovery and execution over stdio, SSE and streamable HTTP
//! - **LLM Orchestration**: streaming drivers for Gemini and Chat Completions with a bounded tool loop
//! - **Agent**: prompts, tool categorisation, context analytics and error recovery
//! - **Chat**: interactive terminal REPL
//!
//! # Modules
//!
//! - [`config`]: Agent configuration and CLI
//! - [`mcp`]: MCP server configuration and registry
//! - [`llm`]: LLM driver traits, implementations and the tool loop
//! - [`normalized`]: Unified streaming event model
//! - [`resilience`]: Timeouts, retries and the operation watchdog
//! - [`tools`]: Local tools and tool categorisation
//! - [`agent`]: The agent itself
//! - [`session`]: Conversation memory
//! - [`chat`]: Terminal REPL

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod chat;
pub mod config;
pub mod llm;
pub mod mcp;
pub mod normalized;
pub mod resilience;
pub mod session;
pub mod sse;
pub mod telemetry;
pub mod tools;

pub use agent::{Agent, AgentError, AgentEvent};
pub use config::AgentConfig;
