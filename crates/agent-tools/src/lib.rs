//! # agent-tools
//!
//! Concrete tools implementing [`agent_core::Tool`].
//!
//! | Tool | Output |
//! |------|--------|
//! | `do_date_math` | `YYYY-MM-DD Weekday` per delta |
//! | `read_write_user_details` | per-user notes (username scoped) |
//! | `read_local_file` | `<files>` document, streamed progress |
//! | `get_webpage_contents` | visible page text and links, streamed progress |

mod date_math;
mod local_file;
mod user_details;
mod webpage;

use std::path::PathBuf;

use agent_core::{Result, ToolRegistry};

pub use date_math::{DateMathTool, date_math};
pub use local_file::{LocalFileTool, TEXT_EXTENSIONS, extract_text};
pub use user_details::{DEFAULT_USER_INFO_DIR, UserDetailsTool};
pub use webpage::{DEFAULT_MAX_CHARS, WebpageTool, text_and_links};

/// Registry with every tool in this crate, user notes kept under
/// `user_info_dir`
pub fn default_registry(user_info_dir: impl Into<PathBuf>) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(DateMathTool::new());
    registry.register(UserDetailsTool::new(user_info_dir));
    registry.register(LocalFileTool::new());
    registry.register(WebpageTool::new()?);
    Ok(registry)
}
