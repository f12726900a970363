//! Human-readable status lines for tool invocations.
//!
//! Tool use is relayed to subscribers as a short one-line description keyed
//! by the tool's identity (file path, search pattern, truncated command),
//! never as the raw structured input.

use serde_json::Value;

/// Maximum length of an interpolated command/pattern before truncation.
const DETAIL_MAX_CHARS: usize = 60;

/// Render a `tool_use` block as a short human-readable status line.
pub fn tool_status_line(name: &str, input: &Value) -> String {
    match name {
        "Read" => field(input, "file_path").map_or_else(
            || "Reading a file".to_string(),
            |path| format!("Reading {path}"),
        ),
        "Write" => field(input, "file_path").map_or_else(
            || "Writing a file".to_string(),
            |path| format!("Writing {path}"),
        ),
        "Edit" | "MultiEdit" => field(input, "file_path").map_or_else(
            || "Editing a file".to_string(),
            |path| format!("Editing {path}"),
        ),
        "Bash" => field(input, "command").map_or_else(
            || "Running a command".to_string(),
            |cmd| format!("Running `{}`", truncate(cmd)),
        ),
        "Grep" => field(input, "pattern").map_or_else(
            || "Searching file contents".to_string(),
            |pattern| format!("Searching for `{}`", truncate(pattern)),
        ),
        "Glob" => field(input, "pattern").map_or_else(
            || "Listing files".to_string(),
            |pattern| format!("Listing files matching {pattern}"),
        ),
        "WebFetch" => field(input, "url").map_or_else(
            || "Fetching a page".to_string(),
            |url| format!("Fetching {}", truncate(url)),
        ),
        "TodoWrite" => "Updating the task list".to_string(),
        "Task" => field(input, "description").map_or_else(
            || "Delegating to a subagent".to_string(),
            |desc| format!("Delegating: {}", truncate(desc)),
        ),
        other => format!("Using {other}"),
    }
}

fn field<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key)?.as_str().filter(|s| !s.is_empty())
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= DETAIL_MAX_CHARS {
        return s.to_string();
    }
    let cut: String = s.chars().take(DETAIL_MAX_CHARS).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_shows_file_path() {
        let line = tool_status_line("Read", &json!({"file_path": "src/main.rs"}));
        assert_eq!(line, "Reading src/main.rs");
    }

    #[test]
    fn bash_truncates_long_commands() {
        let long = "cargo test --workspace --all-features -- --nocapture some_very_long_filter";
        let line = tool_status_line("Bash", &json!({ "command": long }));
        assert!(line.starts_with("Running `cargo test"));
        assert!(line.ends_with("…`"));
        // The interpolated detail itself stays bounded
        assert!(line.chars().count() < long.chars().count() + 12);
    }

    #[test]
    fn grep_shows_pattern() {
        let line = tool_status_line("Grep", &json!({"pattern": "fn claim"}));
        assert_eq!(line, "Searching for `fn claim`");
    }

    #[test]
    fn unknown_tool_falls_back_to_name() {
        let line = tool_status_line("NotebookEdit", &json!({}));
        assert_eq!(line, "Using NotebookEdit");
    }

    #[test]
    fn missing_field_uses_generic_wording() {
        let line = tool_status_line("Read", &json!({}));
        assert_eq!(line, "Reading a file");
    }
}
