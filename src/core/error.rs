//! 错误类型
//!
//! - `AgentError`：驱动层（子进程启动、stdin 写入、会话关闭、会话列表）
//! - `StoreError`：会话持久化
//! - `PlatformError`：聊天平台收发
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定透明重启还是直接告知用户。

use thiserror::Error;

/// Agent 驱动运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 可执行文件不存在或系统拒绝启动，不重试
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process is not alive")]
    NotAlive,

    #[error("Failed to write to agent stdin: {0}")]
    StdinWrite(#[source] std::io::Error),

    #[error("Agent session is closed")]
    Closed,

    #[error("Failed to encode agent input: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Unknown agent type: {0}")]
    UnknownAgent(String),

    #[error("Attachment error: {0}")]
    Attachment(String),

    #[error("Failed to list agent sessions: {0}")]
    Listing(#[source] std::io::Error),
}

impl AgentError {
    /// 子进程已退出（写 stdin 失败也视为进程死亡），可尝试重启
    pub fn is_process_dead(&self) -> bool {
        matches!(self, AgentError::NotAlive | AgentError::StdinWrite(_))
    }
}

/// 会话存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 聊天平台错误
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("Platform config error: {0}")]
    Config(String),

    #[error("Platform failed to start: {0}")]
    Start(String),

    #[error("Platform request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{platform} API error: {body}")]
    Api { platform: String, body: String },
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 关闭旧进程，启动新进程后重发一次
    Restart,
    /// 放弃，把错误文本回复给用户
    Surface(String),
}
