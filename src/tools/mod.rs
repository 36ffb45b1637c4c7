//! Local tools and tool analysis.

pub mod analyzer;
pub mod delete;

pub use analyzer::{ToolAnalyzer, ToolCategory};
pub use delete::{DeleteError, SafeDeleteDirectoryTool, SafeDeleteFileTool};

use std::path::Path;
use std::sync::Arc;

use crate::mcp::NativeTool;

/// Local tools bound to `working_dir`.
pub fn local_tools(working_dir: &Path) -> std::io::Result<Vec<Arc<dyn NativeTool>>> {
    Ok(vec![
        Arc::new(SafeDeleteFileTool::new(working_dir)?),
        Arc::new(SafeDeleteDirectoryTool::new(working_dir)?),
    ])
}
