//! Agent 驱动层：把编码智能体 CLI 子进程包装成统一的会话接口
//!
//! 两种进程生命周期策略实现同一个 [`AgentSession`] 契约：
//! - **duplex**：一个会话一个常驻子进程，prompt 与权限答复写入 stdin（Claude Code）
//! - **per_turn**：每轮启动一个新进程，靠命令行上的会话 id 续接上下文（Codex / Gemini / Cursor）
//!
//! Engine 只调用契约方法，不区分后端类型。

pub mod claude;
pub mod codex;
pub mod cursor;
pub mod duplex;
pub mod event;
pub mod gemini;
pub mod per_turn;
pub mod process;
pub mod registry;
pub mod summary;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::platform::ImageAttachment;

pub use event::Event;
pub use registry::AgentRegistry;

/// 后端自身会话索引中的一条记录（用于 /list 与 /switch）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSessionInfo {
    pub id: String,
    pub summary: String,
    pub message_count: usize,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// 对 PermissionRequest 的答复
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionResponse {
    pub behavior: PermissionBehavior,
    /// 批准时回传的工具输入（原样回显请求中的 input）
    pub updated_input: Option<Value>,
    /// 拒绝时告诉模型的原因
    pub message: Option<String>,
}

impl PermissionResponse {
    pub fn allow(input: Value) -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            updated_input: Some(input),
            message: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            updated_input: None,
            message: Some(message.into()),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.behavior == PermissionBehavior::Allow
    }
}

/// 驱动到 Engine 的有序事件流（有界队列的接收端）
///
/// 驱动读取任务是唯一的发送方；读取任务结束后 `next` 返回 None。
#[derive(Clone)]
pub struct EventStream {
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl EventStream {
    pub async fn next(&self) -> Option<Event> {
        self.rx.lock().await.recv().await
    }
}

/// 创建有界事件队列；队列满时读取任务阻塞（背压），不丢事件
pub fn event_channel(capacity: usize) -> (mpsc::Sender<Event>, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        EventStream {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// 一个对话对应的驱动实例
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// 发送一条 prompt；进程已死返回 `AgentError::NotAlive`
    async fn send(&self, prompt: &str, images: &[ImageAttachment]) -> Result<(), AgentError>;

    /// 答复一个 PermissionRequest（request_id 与事件中的相同）
    async fn respond_permission(
        &self,
        request_id: &str,
        response: PermissionResponse,
    ) -> Result<(), AgentError>;

    fn events(&self) -> EventStream;

    /// 后端分配的会话 id（首次观察到后不再改变）
    fn current_session_id(&self) -> Option<String>;

    fn is_alive(&self) -> bool;

    /// 终止子进程并等待读取任务退出；重复调用直接返回 Ok
    async fn close(&self) -> Result<(), AgentError>;
}

/// 一种后端 CLI
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// 启动驱动；`resume_id` 为已有的后端会话 id
    async fn start_session(
        &self,
        resume_id: Option<&str>,
    ) -> Result<Arc<dyn AgentSession>, AgentError>;

    /// 读取后端自己的会话索引，按修改时间倒序
    async fn list_sessions(&self) -> Result<Vec<AgentSessionInfo>, AgentError>;

    /// 终止该后端的所有子进程
    async fn stop(&self) -> Result<(), AgentError>;
}

/// 各后端共享的运行参数
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub work_dir: PathBuf,
    pub event_buffer: usize,
    /// 父 token；每个驱动持有它的子 token
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(work_dir: impl Into<PathBuf>, event_buffer: usize, cancel: CancellationToken) -> Self {
        Self {
            work_dir: work_dir.into(),
            event_buffer,
            cancel,
        }
    }
}

/// 后端会话索引所在的用户目录
pub(crate) fn home_dir() -> Result<PathBuf, AgentError> {
    dirs::home_dir().ok_or_else(|| {
        AgentError::Listing(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "home directory not found",
        ))
    })
}

/// 在阻塞线程上扫描会话索引
pub(crate) async fn scan_blocking<F>(scan: F) -> Result<Vec<AgentSessionInfo>, AgentError>
where
    F: FnOnce() -> Result<Vec<AgentSessionInfo>, AgentError> + Send + 'static,
{
    let mut sessions = tokio::task::spawn_blocking(scan)
        .await
        .map_err(|e| AgentError::Listing(std::io::Error::other(e)))??;
    sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(sessions)
}
