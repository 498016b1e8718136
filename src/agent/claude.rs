//! Claude Code 后端（常驻双工，stream-json 输入输出）
//!
//! 启动：`claude --output-format stream-json --input-format stream-json --verbose
//! --permission-prompt-tool stdio`，权限请求通过 control_request / control_response 在带内完成。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::duplex::{DuplexProtocol, DuplexSession};
use crate::agent::process::{parse_line, CommandSpec, Decoded, LineDecoder};
use crate::agent::summary::{summarize_tool_input, truncate_chars};
use crate::agent::{
    home_dir, scan_blocking, Agent, AgentContext, AgentSession, AgentSessionInfo, Event,
    PermissionBehavior, PermissionResponse,
};
use crate::config::{ClaudeMode, ClaudeSection};
use crate::core::AgentError;
use crate::platform::ImageAttachment;

const NAME: &str = "claude";
const LIST_SUMMARY_CHARS: usize = 40;

// ---------- 输出协议 ----------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: MessageBody,
    },
    User {
        message: MessageBody,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },
    ControlCancelRequest {
        request_id: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: MessageContent,
}

/// user 消息的 content 可能是纯字符串
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Plain(String),
    Items(Vec<ContentItem>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Items(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentItem {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    subtype: String,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    input: Value,
}

/// tool_result 的 content：字符串，或 `[{type:text,text}]` 数组
fn flatten_tool_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// 解码器记住 tool_use id 对应的工具名，用于标注 ToolResult
#[derive(Default)]
pub struct ClaudeDecoder {
    tool_names: HashMap<String, String>,
}

impl LineDecoder for ClaudeDecoder {
    fn decode(&mut self, line: &str) -> Vec<Decoded> {
        let Some(parsed) = parse_line::<ClaudeLine>(NAME, line) else {
            return Vec::new();
        };
        match parsed {
            ClaudeLine::System {
                subtype,
                session_id,
            } => match (subtype.as_deref(), session_id) {
                (Some("init"), Some(id)) => vec![Decoded::SessionStarted(id)],
                _ => Vec::new(),
            },
            ClaudeLine::Assistant { message } => match message.content {
                MessageContent::Plain(text) if !text.is_empty() => {
                    vec![Decoded::Event(Event::text(text))]
                }
                MessageContent::Plain(_) => Vec::new(),
                MessageContent::Items(items) => items
                    .into_iter()
                    .filter_map(|item| match item {
                        ContentItem::Text { text } => Some(Event::text(text)),
                        ContentItem::Thinking { thinking } if !thinking.is_empty() => {
                            Some(Event::Thinking { content: thinking })
                        }
                        ContentItem::ToolUse { id, name, input } => {
                            let summary = summarize_tool_input(&name, &input);
                            if let Some(id) = id {
                                self.tool_names.insert(id, name.clone());
                            }
                            Some(Event::ToolUse {
                                tool: name,
                                summary,
                            })
                        }
                        _ => None,
                    })
                    .map(Decoded::Event)
                    .collect(),
            },
            ClaudeLine::User { message } => match message.content {
                MessageContent::Plain(_) => Vec::new(),
                MessageContent::Items(items) => items
                    .into_iter()
                    .filter_map(|item| match item {
                        ContentItem::ToolResult {
                            tool_use_id,
                            content,
                        } => Some(Event::ToolResult {
                            tool: tool_use_id.and_then(|id| self.tool_names.remove(&id)),
                            content: flatten_tool_content(&content),
                        }),
                        _ => None,
                    })
                    .map(Decoded::Event)
                    .collect(),
            },
            ClaudeLine::Result {
                result,
                session_id,
                is_error,
            } => {
                let mut out = Vec::new();
                if let Some(id) = session_id.clone() {
                    out.push(Decoded::SessionStarted(id));
                }
                let content = result.unwrap_or_default();
                out.push(Decoded::Event(if is_error {
                    Event::error(if content.is_empty() {
                        "claude reported an error".to_string()
                    } else {
                        content
                    })
                } else {
                    Event::Result {
                        content,
                        session_id,
                    }
                }));
                out
            }
            ClaudeLine::ControlRequest {
                request_id,
                request,
            } => {
                if request.subtype != "can_use_tool" {
                    tracing::debug!(agent = NAME, subtype = %request.subtype, "Ignoring control request");
                    return Vec::new();
                }
                vec![Decoded::PermissionAsk {
                    request_id,
                    tool: request.tool_name.unwrap_or_default(),
                    input: request.input,
                }]
            }
            ClaudeLine::ControlCancelRequest { request_id } => {
                vec![Decoded::PermissionCancelled { request_id }]
            }
            ClaudeLine::Other => Vec::new(),
        }
    }
}

// ---------- 输入协议 ----------

#[derive(Serialize)]
struct UserInput<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: UserInputMessage<'a>,
}

#[derive(Serialize)]
struct UserInputMessage<'a> {
    role: &'static str,
    content: Vec<InputBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputBlock<'a> {
    Text { text: &'a str },
    Image { source: ImageSource<'a> },
}

#[derive(Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'a str,
    data: String,
}

#[derive(Serialize)]
struct ControlResponse<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    response: ControlResponseBody<'a>,
}

#[derive(Serialize)]
struct ControlResponseBody<'a> {
    subtype: &'static str,
    request_id: &'a str,
    response: PermissionResult,
}

#[derive(Serialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
enum PermissionResult {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    Deny {
        message: String,
    },
}

pub struct ClaudeProtocol {
    config: ClaudeSection,
    work_dir: PathBuf,
}

impl ClaudeProtocol {
    pub fn new(config: ClaudeSection, work_dir: PathBuf) -> Self {
        Self { config, work_dir }
    }
}

impl DuplexProtocol for ClaudeProtocol {
    type Decoder = ClaudeDecoder;

    fn name(&self) -> &'static str {
        NAME
    }

    fn command(&self, resume_id: Option<&str>) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.command, &self.work_dir)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--permission-prompt-tool")
            .arg("stdio");
        if self.config.mode != ClaudeMode::Default {
            spec = spec.arg("--permission-mode").arg(self.config.mode.as_str());
        }
        spec = spec.opt("--model", self.config.model.as_deref());
        if !self.config.allowed_tools.is_empty() {
            spec = spec
                .arg("--allowedTools")
                .arg(self.config.allowed_tools.join(","));
        }
        spec.opt("--resume", resume_id.filter(|id| !id.is_empty()))
    }

    fn decoder(&self) -> ClaudeDecoder {
        ClaudeDecoder::default()
    }

    fn encode_prompt(
        &self,
        prompt: &str,
        images: &[ImageAttachment],
    ) -> Result<String, AgentError> {
        let mut content = vec![InputBlock::Text { text: prompt }];
        for image in images {
            content.push(InputBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: &image.mime_type,
                    data: base64::engine::general_purpose::STANDARD.encode(&image.data),
                },
            });
        }
        let input = UserInput {
            kind: "user",
            message: UserInputMessage {
                role: "user",
                content,
            },
        };
        Ok(serde_json::to_string(&input)?)
    }

    fn encode_permission(
        &self,
        request_id: &str,
        response: &PermissionResponse,
    ) -> Result<String, AgentError> {
        let result = match response.behavior {
            PermissionBehavior::Allow => PermissionResult::Allow {
                updated_input: response
                    .updated_input
                    .clone()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            },
            PermissionBehavior::Deny => PermissionResult::Deny {
                message: response
                    .message
                    .clone()
                    .unwrap_or_else(|| "The user denied this tool use".to_string()),
            },
        };
        let msg = ControlResponse {
            kind: "control_response",
            response: ControlResponseBody {
                subtype: "success",
                request_id,
                response: result,
            },
        };
        Ok(serde_json::to_string(&msg)?)
    }

    fn auto_approve(&self) -> bool {
        self.config.mode == ClaudeMode::BypassPermissions
    }
}

// ---------- 会话列表 ----------

/// ~/.claude/projects 下的目录名：工作目录中非字母数字字符替换为 '-'
pub fn project_dir_name(work_dir: &Path) -> String {
    work_dir
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn first_user_text(content: MessageContent) -> Option<String> {
    match content {
        MessageContent::Plain(text) => Some(text),
        MessageContent::Items(items) => items.into_iter().find_map(|item| match item {
            ContentItem::Text { text } => Some(text),
            _ => None,
        }),
    }
}

/// 读取一个项目目录下的 *.jsonl 会话文件
pub fn scan_project_dir(dir: &Path) -> Result<Vec<AgentSessionInfo>, AgentError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AgentError::Listing(e)),
    };
    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!("Skipping unreadable session file {}: {}", path.display(), e);
                continue;
            }
        };
        let mut message_count = 0;
        let mut summary = None;
        for line in text.lines() {
            match serde_json::from_str::<ClaudeLine>(line) {
                Ok(ClaudeLine::User { message }) => {
                    message_count += 1;
                    if summary.is_none() {
                        summary = first_user_text(message.content);
                    }
                }
                Ok(ClaudeLine::Assistant { .. }) => message_count += 1,
                _ => {}
            }
        }
        if message_count == 0 {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        sessions.push(AgentSessionInfo {
            id,
            summary: truncate_chars(summary.unwrap_or_default().trim(), LIST_SUMMARY_CHARS),
            message_count,
            modified,
        });
    }
    Ok(sessions)
}

pub struct ClaudeAgent {
    protocol: Arc<ClaudeProtocol>,
    ctx: AgentContext,
    /// 所有驱动 token 的父 token，stop 时取消
    cancel: CancellationToken,
}

impl ClaudeAgent {
    pub fn new(config: ClaudeSection, ctx: AgentContext) -> Self {
        let cancel = ctx.cancel.child_token();
        let protocol = Arc::new(ClaudeProtocol::new(config, ctx.work_dir.clone()));
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
impl Agent for ClaudeAgent {
    fn name(&self) -> &str {
        NAME
    }

    async fn start_session(
        &self,
        resume_id: Option<&str>,
    ) -> Result<Arc<dyn AgentSession>, AgentError> {
        let session = DuplexSession::start(Arc::clone(&self.protocol), resume_id, &self.ctx)?;
        Ok(Arc::new(session))
    }

    async fn list_sessions(&self) -> Result<Vec<AgentSessionInfo>, AgentError> {
        let dir = home_dir()?
            .join(".claude")
            .join("projects")
            .join(project_dir_name(&self.ctx.work_dir));
        scan_blocking(move || scan_project_dir(&dir)).await
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.cancel.cancel();
        Ok(())
    }
}
