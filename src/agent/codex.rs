//! Codex 后端（每轮启动 `codex exec --json`，用 thread id 续接）

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::agent::per_turn::{TurnProtocol, TurnSession};
use crate::agent::process::{parse_line, CommandSpec, Decoded, LineDecoder};
use crate::agent::summary::truncate_chars;
use crate::agent::{
    home_dir, scan_blocking, Agent, AgentContext, AgentSession, AgentSessionInfo, Event,
};
use crate::config::{CodexMode, CodexSection};
use crate::core::AgentError;

const NAME: &str = "codex";
const COMMAND_PREVIEW_CHARS: usize = 100;
const LIST_SUMMARY_CHARS: usize = 40;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexLine {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "item.started")]
    ItemStarted { item: Item },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: Item },
    #[serde(rename = "turn.completed")]
    TurnCompleted,
    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<ErrorBody>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Item {
    AgentMessage {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    CommandExecution {
        #[serde(default)]
        command: String,
        #[serde(default)]
        aggregated_output: String,
    },
    FileChange {
        #[serde(default)]
        changes: Vec<FileChange>,
    },
    McpToolCall {
        #[serde(default)]
        server: String,
        #[serde(default)]
        tool: String,
    },
    WebSearch {
        #[serde(default)]
        query: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct FileChange {
    path: String,
}

#[derive(Default)]
pub struct CodexDecoder {
    thread_id: Option<String>,
}

impl CodexDecoder {
    fn started(item: Item) -> Option<Event> {
        match item {
            Item::CommandExecution { command, .. } => Some(Event::ToolUse {
                tool: "Bash".to_string(),
                summary: truncate_chars(&command, COMMAND_PREVIEW_CHARS),
            }),
            Item::McpToolCall { server, tool } => Some(Event::ToolUse {
                tool: format!("{}.{}", server, tool),
                summary: String::new(),
            }),
            Item::WebSearch { query } => Some(Event::ToolUse {
                tool: "WebSearch".to_string(),
                summary: query,
            }),
            _ => None,
        }
    }

    fn completed(item: Item) -> Option<Event> {
        match item {
            Item::AgentMessage { text } if !text.is_empty() => Some(Event::text(text)),
            Item::Reasoning { text } if !text.is_empty() => {
                Some(Event::Thinking { content: text })
            }
            Item::CommandExecution {
                aggregated_output, ..
            } => Some(Event::ToolResult {
                tool: Some("Bash".to_string()),
                content: aggregated_output,
            }),
            Item::FileChange { changes } => Some(Event::ToolUse {
                tool: "Edit".to_string(),
                summary: changes
                    .into_iter()
                    .map(|c| c.path)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
            _ => None,
        }
    }
}

impl LineDecoder for CodexDecoder {
    fn decode(&mut self, line: &str) -> Vec<Decoded> {
        let Some(parsed) = parse_line::<CodexLine>(NAME, line) else {
            return Vec::new();
        };
        match parsed {
            CodexLine::ThreadStarted { thread_id } => {
                self.thread_id = Some(thread_id.clone());
                vec![Decoded::SessionStarted(thread_id)]
            }
            CodexLine::ItemStarted { item } => {
                Self::started(item).map(Decoded::Event).into_iter().collect()
            }
            CodexLine::ItemCompleted { item } => {
                Self::completed(item).map(Decoded::Event).into_iter().collect()
            }
            CodexLine::TurnCompleted => vec![Decoded::Event(Event::Result {
                content: String::new(),
                session_id: self.thread_id.clone(),
            })],
            CodexLine::TurnFailed { error } => {
                let message = error
                    .map(|e| e.message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "codex turn failed".to_string());
                vec![Decoded::Event(Event::error(message))]
            }
            CodexLine::Error { message } => {
                tracing::debug!(agent = NAME, "Codex notice: {}", message);
                Vec::new()
            }
            CodexLine::Other => Vec::new(),
        }
    }
}

pub struct CodexProtocol {
    config: CodexSection,
    work_dir: PathBuf,
}

impl CodexProtocol {
    pub fn new(config: CodexSection, work_dir: PathBuf) -> Self {
        Self { config, work_dir }
    }
}

impl TurnProtocol for CodexProtocol {
    type Decoder = CodexDecoder;

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
            .arg("exec")
            .arg("--json")
            .arg("--skip-git-repo-check");
        spec = match self.config.mode {
            CodexMode::Suggest => spec,
            CodexMode::FullAuto => spec.arg("--full-auto"),
            CodexMode::Yolo => spec.arg("--dangerously-bypass-approvals-and-sandbox"),
        };
        spec = spec.opt("--model", self.config.model.as_deref());
        for path in image_paths {
            spec = spec.arg("--image").arg(path.to_string_lossy());
        }
        if let Some(id) = resume_id {
            spec = spec.arg("resume").arg(id);
        }
        // `--` 之后的 prompt 即使以 '-' 开头也不会被当成参数
        spec.arg("--").arg(prompt)
    }

    fn decoder(&self) -> CodexDecoder {
        CodexDecoder::default()
    }
}

// ---------- 会话列表 ----------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RolloutLine {
    SessionMeta { payload: SessionMeta },
    EventMsg { payload: RolloutEvent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SessionMeta {
    id: String,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RolloutEvent {
    UserMessage {
        #[serde(default)]
        message: String,
    },
    AgentMessage,
    #[serde(other)]
    Other,
}

fn read_rollout(path: &Path, work_dir: &Path) -> Option<AgentSessionInfo> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut lines = text.lines();
    let meta = lines.find_map(|l| match serde_json::from_str::<RolloutLine>(l) {
        Ok(RolloutLine::SessionMeta { payload }) => Some(payload),
        _ => None,
    })?;
    if meta.cwd.as_deref() != Some(work_dir) {
        return None;
    }
    let mut message_count = 0;
    let mut summary = None;
    for line in lines {
        if let Ok(RolloutLine::EventMsg { payload }) = serde_json::from_str::<RolloutLine>(line) {
            match payload {
                RolloutEvent::UserMessage { message } => {
                    message_count += 1;
                    if summary.is_none() {
                        summary = Some(message);
                    }
                }
                RolloutEvent::AgentMessage => message_count += 1,
                RolloutEvent::Other => {}
            }
        }
    }
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Some(AgentSessionInfo {
        id: meta.id,
        summary: truncate_chars(summary.unwrap_or_default().trim(), LIST_SUMMARY_CHARS),
        message_count,
        modified,
    })
}

/// 扫描 sessions 根目录下的 rollout-*.jsonl，只保留工作目录匹配的会话
pub fn scan_sessions_root(root: &Path, work_dir: &Path) -> Result<Vec<AgentSessionInfo>, AgentError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let sessions = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name.starts_with("rollout-") && name.ends_with(".jsonl")
        })
        .filter_map(|e| read_rollout(e.path(), work_dir))
        .collect();
    Ok(sessions)
}

pub struct CodexAgent {
    protocol: Arc<CodexProtocol>,
    ctx: AgentContext,
    cancel: CancellationToken,
}

impl CodexAgent {
    pub fn new(config: CodexSection, ctx: AgentContext) -> Self {
        let cancel = ctx.cancel.child_token();
        let protocol = Arc::new(CodexProtocol::new(config, ctx.work_dir.clone()));
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
impl Agent for CodexAgent {
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
        let root = home_dir()?.join(".codex").join("sessions");
        let work_dir = self.ctx.work_dir.clone();
        scan_blocking(move || scan_sessions_root(&root, &work_dir)).await
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.cancel.cancel();
        Ok(())
    }
}
