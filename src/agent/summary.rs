//! 工具输入预览：按工具名提取最有信息量的字段，未知工具退化为截断的 JSON

use serde_json::Value;

/// Shell 类命令预览长度（字符数）
const COMMAND_PREVIEW_CHARS: usize = 100;
/// 通用 JSON 预览长度（字符数）
const JSON_PREVIEW_CHARS: usize = 150;

/// 按 Unicode 字符截断，超出时追加省略号；不会切断多字节字符
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

fn str_field<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| input.get(*k).and_then(Value::as_str))
}

/// 生成工具调用的可读预览
pub fn summarize_tool_input(tool: &str, input: &Value) -> String {
    let picked = match tool {
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookEdit" | "read_file" | "write_file"
        | "replace" => str_field(input, &["file_path", "path", "notebook_path", "absolute_path"])
            .map(str::to_string),
        "Bash" | "Shell" | "run_shell_command" => str_field(input, &["command", "cmd"])
            .map(|c| truncate_chars(c, COMMAND_PREVIEW_CHARS)),
        "Grep" | "Glob" | "search_file_content" | "glob" => {
            str_field(input, &["pattern"]).map(str::to_string)
        }
        "WebFetch" | "web_fetch" => str_field(input, &["url"]).map(str::to_string),
        "WebSearch" | "google_web_search" => str_field(input, &["query"]).map(str::to_string),
        "Task" => str_field(input, &["description"]).map(str::to_string),
        _ => None,
    };
    picked.unwrap_or_else(|| match input {
        Value::Null => String::new(),
        Value::String(s) => truncate_chars(s, JSON_PREVIEW_CHARS),
        other => truncate_chars(&other.to_string(), JSON_PREVIEW_CHARS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_chars("你好世界", 2), "你好…");
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("", 5), "");
    }

    #[test]
    fn test_file_tools_show_path() {
        let input = json!({"file_path": "/src/main.rs", "content": "fn main() {}"});
        assert_eq!(summarize_tool_input("Write", &input), "/src/main.rs");
    }

    #[test]
    fn test_shell_command_truncated() {
        let long = "x".repeat(250);
        let summary = summarize_tool_input("Bash", &json!({ "command": long }));
        assert_eq!(summary.chars().count(), COMMAND_PREVIEW_CHARS + 1);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn test_pattern_tools() {
        assert_eq!(
            summarize_tool_input("Grep", &json!({"pattern": "fn main", "path": "."})),
            "fn main"
        );
    }

    #[test]
    fn test_unknown_tool_falls_back_to_json() {
        let summary = summarize_tool_input("mcp__db__query", &json!({"sql": "select 1"}));
        assert_eq!(summary, r#"{"sql":"select 1"}"#);
    }
}
