//! 常驻双工驱动：一个对话一个子进程，prompt 与权限答复写入 stdin，输出逐行翻译成事件
//!
//! 子进程的 stdout 由唯一的读取任务独占；与外部调用方共享的只有 alive 标志、
//! 会话 id 与加锁的 stdin。权限请求到来时读取任务不会停下，挂起发生在 Engine 侧。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::process::{
    collect_stderr, finish_stderr, reap, CommandSpec, Decoded, LineDecoder, LineReader, StderrTail,
};
use crate::agent::summary::summarize_tool_input;
use crate::agent::{
    event_channel, AgentContext, AgentSession, Event, EventStream, PermissionResponse,
};
use crate::core::AgentError;
use crate::platform::ImageAttachment;

/// 双工后端的协议细节
pub trait DuplexProtocol: Send + Sync + 'static {
    type Decoder: LineDecoder;

    fn name(&self) -> &'static str;

    fn command(&self, resume_id: Option<&str>) -> CommandSpec;

    fn decoder(&self) -> Self::Decoder;

    /// 一条 prompt 编码成的一行输入（不含换行）
    fn encode_prompt(&self, prompt: &str, images: &[ImageAttachment])
        -> Result<String, AgentError>;

    fn encode_permission(
        &self,
        request_id: &str,
        response: &PermissionResponse,
    ) -> Result<String, AgentError>;

    /// 为 true 时驱动直接批准所有权限请求，不产生 PermissionRequest 事件
    fn auto_approve(&self) -> bool;
}

/// 读取任务与调用方共享的字段
struct Shared {
    alive: AtomicBool,
    /// 已写入 prompt、尚未收到终止事件
    in_turn: AtomicBool,
    session_id: OnceLock<String>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl Shared {
    async fn write_line(&self, line: &str) -> Result<(), AgentError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(AgentError::NotAlive)?;
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            self.alive.store(false, Ordering::SeqCst);
            return Err(AgentError::StdinWrite(e));
        }
        Ok(())
    }

    fn record_session_id(&self, agent: &str, id: String) {
        match self.session_id.get() {
            None => {
                let _ = self.session_id.set(id);
            }
            Some(existing) if *existing != id => {
                tracing::debug!(agent, existing = %existing, reported = %id, "Ignoring new session id");
            }
            Some(_) => {}
        }
    }
}

pub struct DuplexSession<P: DuplexProtocol> {
    protocol: Arc<P>,
    shared: Arc<Shared>,
    events: EventStream,
    cancel: CancellationToken,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<P: DuplexProtocol> DuplexSession<P> {
    /// 启动子进程与读取任务；启动失败同步返回
    pub fn start(
        protocol: Arc<P>,
        resume_id: Option<&str>,
        ctx: &AgentContext,
    ) -> Result<Self, AgentError> {
        let spec = protocol.command(resume_id);
        let mut child = spec.spawn(true)?;
        let stdout = child.stdout.take().ok_or_else(|| AgentError::Spawn {
            command: spec.program.clone(),
            source: std::io::Error::other("stdout not captured"),
        })?;
        let stderr = child.stderr.take().map(|s| collect_stderr(protocol.name(), s));

        let shared = Arc::new(Shared {
            alive: AtomicBool::new(true),
            in_turn: AtomicBool::new(false),
            session_id: OnceLock::new(),
            stdin: Mutex::new(child.stdin.take()),
        });
        let (tx, events) = event_channel(ctx.event_buffer);
        let cancel = ctx.cancel.child_token();

        tracing::info!(agent = protocol.name(), resume = ?resume_id, "Agent process started");

        let reader = tokio::spawn(read_loop(
            Arc::clone(&protocol),
            child,
            stdout,
            stderr,
            Arc::clone(&shared),
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            protocol,
            shared,
            events,
            cancel,
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        })
    }
}

/// 转发事件；队列满时阻塞，取消时放弃
async fn forward(tx: &mpsc::Sender<Event>, cancel: &CancellationToken, event: Event) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tx.send(event) => {}
    }
}

async fn read_loop<P: DuplexProtocol>(
    protocol: Arc<P>,
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<StderrTail>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let agent = protocol.name();
    let mut decoder = protocol.decoder();
    let mut lines = LineReader::new(stdout);

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(agent, "Failed to read agent stdout: {}", e);
                break;
            }
        };
        for decoded in decoder.decode(&line) {
            match decoded {
                Decoded::Event(event) => {
                    if event.is_terminal() {
                        shared.in_turn.store(false, Ordering::SeqCst);
                    }
                    forward(&tx, &cancel, event).await;
                }
                Decoded::SessionStarted(id) => shared.record_session_id(agent, id),
                Decoded::PermissionAsk {
                    request_id,
                    tool,
                    input,
                } => {
                    if protocol.auto_approve() {
                        tracing::debug!(agent, request_id = %request_id, tool = %tool, "Auto-approving tool use");
                        let response = PermissionResponse::allow(input);
                        let written = match protocol.encode_permission(&request_id, &response) {
                            Ok(line) => shared.write_line(&line).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = written {
                            tracing::warn!(agent, request_id = %request_id, "Failed to auto-approve: {}", e);
                        }
                    } else {
                        let summary = summarize_tool_input(&tool, &input);
                        let event = Event::PermissionRequest {
                            request_id,
                            tool,
                            summary,
                            input,
                        };
                        forward(&tx, &cancel, event).await;
                    }
                }
                Decoded::PermissionCancelled { request_id } => {
                    tracing::debug!(agent, request_id = %request_id, "Permission request cancelled by agent");
                }
            }
        }
    }

    shared.alive.store(false, Ordering::SeqCst);
    shared.stdin.lock().await.take();
    let status = reap(agent, &mut child, &cancel).await;
    let stderr_text = finish_stderr(stderr).await;
    tracing::info!(agent, status = ?status, "Agent process exited");

    // 轮次进行中意外退出：给消费方一个 Error，随后 tx 释放、事件流关闭
    if !cancel.is_cancelled() && shared.in_turn.swap(false, Ordering::SeqCst) {
        let message = if stderr_text.trim().is_empty() {
            match status {
                Ok(s) => format!("{} exited unexpectedly ({})", agent, s),
                Err(e) => format!("{} exited unexpectedly: {}", agent, e),
            }
        } else {
            stderr_text
        };
        let _ = tx.send(Event::error(message)).await;
    }
}

#[async_trait]
impl<P: DuplexProtocol> AgentSession for DuplexSession<P> {
    async fn send(&self, prompt: &str, images: &[ImageAttachment]) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Closed);
        }
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(AgentError::NotAlive);
        }
        let line = self.protocol.encode_prompt(prompt, images)?;
        self.shared.in_turn.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.write_line(&line).await {
            self.shared.in_turn.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn respond_permission(
        &self,
        request_id: &str,
        response: PermissionResponse,
    ) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Closed);
        }
        let line = self.protocol.encode_permission(request_id, &response)?;
        tracing::debug!(agent = self.protocol.name(), request_id, allow = response.is_allow(), "Answering permission request");
        self.shared.write_line(&line).await
    }

    fn events(&self) -> EventStream {
        self.events.clone()
    }

    fn current_session_id(&self) -> Option<String> {
        self.shared.session_id.get().cloned()
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.shared.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AgentError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let handle = self.reader.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(agent = self.protocol.name(), "Agent reader task failed: {}", e);
            }
        }
        Ok(())
    }
}

impl<P: DuplexProtocol> Drop for DuplexSession<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
