//! Cursor Agent 后端（每轮启动 `cursor-agent --print --output-format stream-json`）
//!
//! Cursor 的会话存储不是按行的 JSON，列表始终为空；续接只依赖输出中的 session_id。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::per_turn::{TurnProtocol, TurnSession};
use crate::agent::process::{parse_line, prompt_with_image_refs, CommandSpec, Decoded, LineDecoder};
use crate::agent::summary::summarize_tool_input;
use crate::agent::{Agent, AgentContext, AgentSession, AgentSessionInfo, Event};
use crate::config::{CursorMode, CursorSection};
use crate::core::AgentError;

const NAME: &str = "cursor";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CursorLine {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: Message,
    },
    Thinking {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        text: String,
    },
    ToolCall {
        subtype: String,
        #[serde(default)]
        tool_call: Map<String, Value>,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentItem {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// `{"readToolCall": {"args": {...}, "result": {...}}}` → ("read", args, result)
fn split_tool_call(tool_call: &Map<String, Value>) -> Option<(String, &Value)> {
    let (key, body) = tool_call.iter().find(|(k, _)| k.ends_with("ToolCall"))?;
    let name = key.trim_end_matches("ToolCall").to_string();
    Some((name, body))
}

fn tool_result_text(body: &Value) -> String {
    let result = body.get("result").unwrap_or(&Value::Null);
    if let Some(success) = result.get("success") {
        for key in ["content", "stdout", "output"] {
            if let Some(text) = success.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
        return success.to_string();
    }
    match result {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Default)]
pub struct CursorDecoder;

impl LineDecoder for CursorDecoder {
    fn decode(&mut self, line: &str) -> Vec<Decoded> {
        let Some(parsed) = parse_line::<CursorLine>(NAME, line) else {
            return Vec::new();
        };
        match parsed {
            CursorLine::System { session_id } => {
                session_id.map(Decoded::SessionStarted).into_iter().collect()
            }
            CursorLine::Assistant { message } => message
                .content
                .into_iter()
                .filter_map(|item| match item {
                    ContentItem::Text { text } if !text.is_empty() => {
                        Some(Decoded::Event(Event::text(text)))
                    }
                    _ => None,
                })
                .collect(),
            CursorLine::Thinking { subtype, text } => {
                if subtype.as_deref() == Some("delta") && !text.is_empty() {
                    vec![Decoded::Event(Event::Thinking { content: text })]
                } else {
                    Vec::new()
                }
            }
            CursorLine::ToolCall { subtype, tool_call } => {
                let Some((name, body)) = split_tool_call(&tool_call) else {
                    return Vec::new();
                };
                let event = match subtype.as_str() {
                    "started" => {
                        let args = body.get("args").unwrap_or(&Value::Null);
                        Event::ToolUse {
                            summary: summarize_tool_input(&name, args),
                            tool: name,
                        }
                    }
                    "completed" => Event::ToolResult {
                        content: tool_result_text(body),
                        tool: Some(name),
                    },
                    _ => return Vec::new(),
                };
                vec![Decoded::Event(event)]
            }
            CursorLine::Result {
                result,
                session_id,
                is_error,
            } => {
                let mut out: Vec<Decoded> =
                    session_id.clone().map(Decoded::SessionStarted).into_iter().collect();
                let content = result.unwrap_or_default();
                out.push(Decoded::Event(if is_error {
                    Event::error(if content.is_empty() {
                        "cursor-agent reported an error".to_string()
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
            CursorLine::Other => Vec::new(),
        }
    }
}

pub struct CursorProtocol {
    config: CursorSection,
    work_dir: PathBuf,
}

impl CursorProtocol {
    pub fn new(config: CursorSection, work_dir: PathBuf) -> Self {
        Self { config, work_dir }
    }
}

impl TurnProtocol for CursorProtocol {
    type Decoder = CursorDecoder;

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
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json");
        if self.config.mode == CursorMode::Force {
            spec = spec.arg("--force");
        }
        spec.opt("--model", self.config.model.as_deref())
            .opt("--resume", resume_id)
            .arg("--")
            .arg(prompt_with_image_refs(prompt, image_paths, ""))
    }

    fn decoder(&self) -> CursorDecoder {
        CursorDecoder
    }
}

pub struct CursorAgent {
    protocol: Arc<CursorProtocol>,
    ctx: AgentContext,
    cancel: CancellationToken,
}

impl CursorAgent {
    pub fn new(config: CursorSection, ctx: AgentContext) -> Self {
        let cancel = ctx.cancel.child_token();
        let protocol = Arc::new(CursorProtocol::new(config, ctx.work_dir.clone()));
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
impl Agent for CursorAgent {
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
        Ok(Vec::new())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.cancel.cancel();
        Ok(())
    }
}
