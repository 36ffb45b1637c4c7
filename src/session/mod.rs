//! Conversation memory.
//!
//! Each conversation thread keeps its own message history. When memory is
//! enabled the agent replays a thread's history on every turn.
//!
//! # Example
//!
//! ```rust
//! use gemini_mcp_agent::llm::Message;
//! use gemini_mcp_agent::session::SessionStore;
//!
//! let store = SessionStore::new();
//! let session = store.get_or_create("default");
//! session.add_message(Message::user("Hello!"));
//!
//! assert_eq!(session.messages().len(), 1);
//! ```

mod thread;

pub use thread::{Session, SessionStore};
