//! Gemini CLI 后端（每轮启动 `gemini --output-format stream-json`）

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::agent::per_turn::{TurnProtocol, TurnSession};
use crate::agent::process::{parse_line, prompt_with_image_refs, CommandSpec, Decoded, LineDecoder};
use crate::agent::summary::{summarize_tool_input, truncate_chars};
use crate::agent::{
    home_dir, scan_blocking, Agent, AgentContext, AgentSession, AgentSessionInfo, Event,
};
use crate::config::{GeminiMode, GeminiSection};
use crate::core::AgentError;

const NAME: &str = "gemini";
const LIST_SUMMARY_CHARS: usize = 40;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GeminiLine {
    Init {
        session_id: String,
    },
    Message {
        #[serde(default)]
        role: String,
        #[serde(default)]
        content: String,
    },
    ToolUse {
        tool_name: String,
        #[serde(default)]
        tool_id: Option<String>,
        #[serde(default)]
        parameters: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_id: Option<String>,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        error: Option<ErrorBody>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Result {
        status: String,
        #[serde(default)]
        error: Option<ErrorBody>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Default)]
pub struct GeminiDecoder {
    session_id: Option<String>,
    tool_names: HashMap<String, String>,
}

impl LineDecoder for GeminiDecoder {
    fn decode(&mut self, line: &str) -> Vec<Decoded> {
        let Some(parsed) = parse_line::<GeminiLine>(NAME, line) else {
            return Vec::new();
        };
        let event = match parsed {
            GeminiLine::Init { session_id } => {
                self.session_id = Some(session_id.clone());
                return vec![Decoded::SessionStarted(session_id)];
            }
            GeminiLine::Message { role, content } if role == "assistant" && !content.is_empty() => {
                Event::text(content)
            }
            GeminiLine::ToolUse {
                tool_name,
                tool_id,
                parameters,
            } => {
                let summary = summarize_tool_input(&tool_name, &parameters);
                if let Some(id) = tool_id {
                    self.tool_names.insert(id, tool_name.clone());
                }
                Event::ToolUse {
                    tool: tool_name,
                    summary,
                }
            }
            GeminiLine::ToolResult {
                tool_id,
                output,
                error,
            } => Event::ToolResult {
                tool: tool_id.and_then(|id| self.tool_names.remove(&id)),
                content: output
                    .or_else(|| error.map(|e| e.message))
                    .unwrap_or_default(),
            },
            GeminiLine::Result { status, error } => {
                if status == "success" {
                    Event::Result {
                        content: String::new(),
                        session_id: self.session_id.clone(),
                    }
                } else {
                    Event::error(
                        error
                            .map(|e| e.message)
                            .filter(|m| !m.is_empty())
                            .unwrap_or_else(|| format!("gemini finished with status {}", status)),
                    )
                }
            }
            GeminiLine::Error { message } => {
                tracing::debug!(agent = NAME, "Gemini notice: {}", message);
                return Vec::new();
            }
            GeminiLine::Message { .. } | GeminiLine::Other => return Vec::new(),
        };
        vec![Decoded::Event(event)]
    }
}

pub struct GeminiProtocol {
    config: GeminiSection,
    work_dir: PathBuf,
}

impl GeminiProtocol {
    pub fn new(config: GeminiSection, work_dir: PathBuf) -> Self {
        Self { config, work_dir }
    }
}

impl TurnProtocol for GeminiProtocol {
    type Decoder = GeminiDecoder;

    fn name(&self) -> &'static str {
        NAME
    }

    fn command(
        &self,
        prompt: &str,
        resume_id: Option<&str>,
        image_paths: &[PathBuf],
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.command, &self.work_dir)
            .arg("--output-format")
            .arg("stream-json")
            .opt("--model", self.config.model.as_deref());
        spec = match self.config.mode {
            GeminiMode::Default => spec,
            GeminiMode::AutoEdit => spec.arg("--approval-mode").arg("auto_edit"),
            GeminiMode::Yolo => spec.arg("--yolo"),
        };
        // 以 `--prompt=` 连写，prompt 以 '-' 开头时不会被当成参数
        spec.opt("--resume", resume_id).arg(format!(
            "--prompt={}",
            prompt_with_image_refs(prompt, image_paths, "@")
        ))
    }

    fn decoder(&self) -> GeminiDecoder {
        GeminiDecoder::default()
    }
}

// ---------- 会话列表 ----------

/// ~/.gemini/tmp 下的项目目录名：工作目录路径的 sha256
pub fn project_hash(work_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(work_dir.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRecord {
    session_id: String,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content: Value,
}

fn message_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// 读取 chats 目录下的 session-*.json
pub fn scan_chats_dir(dir: &Path) -> Result<Vec<AgentSessionInfo>, AgentError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AgentError::Listing(e)),
    };
    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !(name.starts_with("session-") && name.ends_with(".json")) {
            continue;
        }
        let record: ChatRecord = match std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
        {
            Some(record) => record,
            None => {
                tracing::debug!("Skipping unreadable chat file {}", path.display());
                continue;
            }
        };
        let summary = record
            .messages
            .iter()
            .find(|m| m.kind == "user")
            .map(|m| message_text(&m.content))
            .unwrap_or_default();
        let modified = record.last_updated.unwrap_or_else(|| {
            entry
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now())
        });
        sessions.push(AgentSessionInfo {
            id: record.session_id,
            summary: truncate_chars(summary.trim(), LIST_SUMMARY_CHARS),
            message_count: record.messages.len(),
            modified,
        });
    }
    Ok(sessions)
}

pub struct GeminiAgent {
    protocol: Arc<GeminiProtocol>,
    ctx: AgentContext,
    cancel: CancellationToken,
}

impl GeminiAgent {
    pub fn new(config: GeminiSection, ctx: AgentContext) -> Self {
        let cancel = ctx.cancel.child_token();
        let protocol = Arc::new(GeminiProtocol::new(config, ctx.work_dir.clone()));
        let ctx = AgentContext {
            cancel: cancel.clone(),
            ..ctx
        };
        Self {
            protocol,
            ctx,
            cancel,
        }
    }
}

#[async_trait]
impl Agent for GeminiAgent {
    fn name(&self) -> &str {
        NAME
    }

    async fn start_session(
        &self,
        resume_id: Option<&str>,
    ) -> Result<Arc<dyn AgentSession>, AgentError> {
        Ok(Arc::new(TurnSession::new(
            Arc::clone(&self.protocol),
            resume_id,
            &self.ctx,
        )))
    }

    async fn list_sessions(&self) -> Result<Vec<AgentSessionInfo>, AgentError> {
        let dir = home_dir()?
            .join(".gemini")
            .join("tmp")
            .join(project_hash(&self.ctx.work_dir))
            .join("chats");
        scan_blocking(move || scan_chats_dir(&dir)).await
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_decode() {
        let mut d = GeminiDecoder::default();
        let lines = [
            json!({"type": "init", "session_id": "g-1", "model": "gemini-2.5-pro"}),
            json!({"type": "message", "role": "user", "content": "hi"}),
            json!({"type": "tool_use", "tool_name": "read_file", "tool_id": "t1", "parameters": {"absolute_path": "/a.rs"}}),
            json!({"type": "tool_result", "tool_id": "t1", "status": "success", "output": "fn a() {}"}),
            json!({"type": "message", "role": "assistant", "content": "Looks fine.", "delta": true}),
            json!({"type": "error", "severity": "warning", "message": "loop detected"}),
            json!({"type": "result", "status": "success", "stats": {}}),
        ];
        let out: Vec<Decoded> = lines.iter().flat_map(|l| d.decode(&l.to_string())).collect();
        assert_eq!(
            out,
            vec![
                Decoded::SessionStarted("g-1".to_string()),
                Decoded::Event(Event::ToolUse { tool: "read_file".to_string(), summary: "/a.rs".to_string() }),
                Decoded::Event(Event::ToolResult { tool: Some("read_file".to_string()), content: "fn a() {}".to_string() }),
                Decoded::Event(Event::text("Looks fine.")),
                Decoded::Event(Event::Result { content: String::new(), session_id: Some("g-1".to_string()) }),
            ]
        );
    }

    #[test]
    fn test_failed_result_is_error() {
        let mut d = GeminiDecoder::default();
        let out = d.decode(&json!({"type": "result", "status": "error", "error": {"type": "Api", "message": "quota"}}).to_string());
        assert_eq!(out, vec![Decoded::Event(Event::error("quota"))]);
        assert!(d.decode("Loaded cached credentials.").is_empty());
    }

    #[test]
    fn test_command_with_images() {
        let p = GeminiProtocol::new(
            GeminiSection {
                mode: GeminiMode::Yolo,
                ..GeminiSection::default()
            },
            PathBuf::from("/work"),
        );
        let spec = p.command("describe", Some("g-1"), &[PathBuf::from("/tmp/x.png")]);
        assert_eq!(
            spec.args,
            vec!["--output-format", "stream-json", "--yolo", "--resume", "g-1", "--prompt=describe\n\n@/tmp/x.png"]
        );
    }

    #[test]
    fn test_dash_prompt_is_not_a_flag() {
        let p = GeminiProtocol::new(GeminiSection::default(), PathBuf::from("/work"));
        let spec = p.command("--version", None, &[]);
        assert_eq!(spec.args.last().map(String::as_str), Some("--prompt=--version"));
        assert!(!spec.args.iter().any(|a| a == "--version"));
    }

    #[test]
    fn test_project_hash_is_stable() {
        let a = project_hash(Path::new("/work"));
        assert_eq!(a.len(), 64);
        assert_eq!(a, project_hash(Path::new("/work")));
        assert_ne!(a, project_hash(Path::new("/work2")));
    }

    #[test]
    fn test_scan_chats_dir() {
        let dir = tempfile::tempdir().unwrap();
        let chat = json!({
            "sessionId": "g-42",
            "lastUpdated": "2025-03-01T10:00:00Z",
            "messages": [
                {"type": "user", "content": "refactor the parser"},
                {"type": "gemini", "content": "sure"}
            ]
        });
        std::fs::write(dir.path().join("session-2025-03-01.json"), chat.to_string()).unwrap();
        std::fs::write(dir.path().join("session-broken.json"), "{").unwrap();

        let sessions = scan_chats_dir(dir.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "g-42");
        assert_eq!(sessions[0].message_count, 2);
        assert_eq!(sessions[0].summary, "refactor the parser");
        assert_eq!(sessions[0].modified.to_rfc3339(), "2025-03-01T10:00:00+00:00");
    }
}
