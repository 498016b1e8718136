//! Agent 事件：四种后端协议统一翻译成的事件词汇表

use serde::Serialize;
use serde_json::Value;

/// 后端输出的单个事件（每个后端的每行 JSON 可产生零个、一个或多个）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// 模型回复文本片段
    Text { content: String },
    /// 调用工具（summary 为输入预览）
    ToolUse { tool: String, summary: String },
    /// 工具返回
    ToolResult {
        tool: Option<String>,
        content: String,
    },
    /// 请求使用工具的许可；input 原样保留，批准时回传
    PermissionRequest {
        request_id: String,
        tool: String,
        summary: String,
        input: Value,
    },
    /// 推理过程
    Thinking { content: String },
    /// 本轮结束
    Result {
        content: String,
        session_id: Option<String>,
    },
    /// 本轮失败
    Error { message: String },
}

impl Event {
    pub fn text(content: impl Into<String>) -> Self {
        Event::Text {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
        }
    }

    /// Result 与 Error 结束一轮对话
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Result { .. } | Event::Error { .. })
    }
}
