//! Short status text for prompts and status lines.

use crate::config::Config;

/// `"[<project_name>]"`, or an empty string when no project name is set.
/// Pure, so it is safe to poll as often as a status line redraws.
pub fn status_line(cfg: &Config) -> String {
    match cfg.project_name.as_deref() {
        Some(name) if !name.is_empty() => format!("[{name}]"),
        _ => String::new(),
    }
}
