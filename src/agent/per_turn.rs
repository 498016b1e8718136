//! 按轮启动驱动：每次 send 启动一个新进程，用上一轮的会话 id 续接上下文
//!
//! 这类后端的工具审批由启动参数决定，不产生 PermissionRequest 事件。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::process::{
    collect_stderr, finish_stderr, reap, remove_temp_files, write_temp_images, CommandSpec,
    Decoded, LineDecoder, LineReader, StderrTail,
};
use crate::agent::{
    event_channel, AgentContext, AgentSession, Event, EventStream, PermissionResponse,
};
use crate::core::AgentError;
use crate::platform::ImageAttachment;

/// 按轮后端的协议细节
pub trait TurnProtocol: Send + Sync + 'static {
    type Decoder: LineDecoder;

    fn name(&self) -> &'static str;

    /// 本轮命令；`image_paths` 为已写入临时目录的图片
    fn command(&self, prompt: &str, resume_id: Option<&str>, image_paths: &[PathBuf])
        -> CommandSpec;

    fn decoder(&self) -> Self::Decoder;
}

pub struct TurnSession<P: TurnProtocol> {
    protocol: Arc<P>,
    /// close 时释放，事件流随之关闭
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events: EventStream,
    session_id: Arc<OnceLock<String>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    /// 某轮进程未产生终止事件就退出
    crashed: Arc<AtomicBool>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl<P: TurnProtocol> TurnSession<P> {
    /// 不启动进程；第一次 send 时才启动
    pub fn new(protocol: Arc<P>, resume_id: Option<&str>, ctx: &AgentContext) -> Self {
        let (tx, events) = event_channel(ctx.event_buffer);
        let session_id = OnceLock::new();
        if let Some(id) = resume_id.filter(|id| !id.is_empty()) {
            let _ = session_id.set(id.to_string());
        }
        Self {
            protocol,
            events_tx: Mutex::new(Some(tx)),
            events,
            session_id: Arc::new(session_id),
            cancel: ctx.cancel.child_token(),
            closed: AtomicBool::new(false),
            crashed: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
        }
    }
}

struct TurnRun {
    agent: &'static str,
    child: tokio::process::Child,
    stdout: ChildStdout,
    stderr: Option<StderrTail>,
    image_paths: Vec<PathBuf>,
}

async fn run_turn<D: LineDecoder>(
    run: TurnRun,
    mut decoder: D,
    session_id: Arc<OnceLock<String>>,
    crashed: Arc<AtomicBool>,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let TurnRun {
        agent,
        mut child,
        stdout,
        stderr,
        image_paths,
    } = run;
    let mut lines = LineReader::new(stdout);
    let mut saw_terminal = false;

    'read: loop {
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
                    saw_terminal = event.is_terminal();
                    tokio::select! {
                        _ = cancel.cancelled() => break 'read,
                        _ = tx.send(event) => {}
                    }
                    // 每轮只转发一个终止事件；之后不再读 stdout（后台进程可能一直持有它）
                    if saw_terminal {
                        break 'read;
                    }
                }
                Decoded::SessionStarted(id) => {
                    if session_id.get().is_none() {
                        let _ = session_id.set(id);
                    }
                }
                Decoded::PermissionAsk { request_id, tool, .. } => {
                    tracing::warn!(agent, request_id = %request_id, tool = %tool, "Unexpected permission request from per-turn agent");
                }
                Decoded::PermissionCancelled { .. } => {}
            }
        }
    }

    let status = reap(agent, &mut child, &cancel).await;
    let stderr_text = finish_stderr(stderr).await;
    remove_temp_files(&image_paths);
    tracing::debug!(agent, status = ?status, "Agent turn process exited");

    if !saw_terminal && !cancel.is_cancelled() {
        let message = if stderr_text.trim().is_empty() {
            match status {
                Ok(s) => format!("{} exited without a result ({})", agent, s),
                Err(e) => format!("{} exited without a result: {}", agent, e),
            }
        } else {
            stderr_text
        };
        crashed.store(true, Ordering::SeqCst);
        let _ = tx.send(Event::error(message)).await;
    }
}

#[async_trait]
impl<P: TurnProtocol> AgentSession for TurnSession<P> {
    async fn send(&self, prompt: &str, images: &[ImageAttachment]) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Closed);
        }
        if self.crashed.load(Ordering::SeqCst) {
            return Err(AgentError::NotAlive);
        }
        let tx = self
            .events_tx
            .lock()
            .await
            .clone()
            .ok_or(AgentError::Closed)?;

        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            let _ = previous.await;
        }

        let image_paths = write_temp_images(images)?;
        let resume = self.session_id.get().cloned();
        let spec = self
            .protocol
            .command(prompt, resume.as_deref(), &image_paths);
        let mut child = match spec.spawn(false) {
            Ok(child) => child,
            Err(e) => {
                remove_temp_files(&image_paths);
                return Err(e);
            }
        };
        let Some(stdout) = child.stdout.take() else {
            remove_temp_files(&image_paths);
            return Err(AgentError::Spawn {
                command: spec.program.clone(),
                source: std::io::Error::other("stdout not captured"),
            });
        };
        let agent = self.protocol.name();
        let stderr = child.stderr.take().map(|s| collect_stderr(agent, s));
        tracing::info!(agent, resume = ?resume, "Agent turn started");

        let run = TurnRun {
            agent,
            child,
            stdout,
            stderr,
            image_paths,
        };
        *current = Some(tokio::spawn(run_turn(
            run,
            self.protocol.decoder(),
            Arc::clone(&self.session_id),
            Arc::clone(&self.crashed),
            tx,
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn respond_permission(
        &self,
        request_id: &str,
        _response: PermissionResponse,
    ) -> Result<(), AgentError> {
        tracing::warn!(agent = self.protocol.name(), request_id, "Per-turn agent has no permission channel");
        Ok(())
    }

    fn events(&self) -> EventStream {
        self.events.clone()
    }

    fn current_session_id(&self) -> Option<String> {
        self.session_id.get().cloned()
    }

    /// 进程按轮启动；未关闭且上一轮没有崩溃即可再次 send
    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.crashed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AgentError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let handle = self.current.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(agent = self.protocol.name(), "Agent turn task failed: {}", e);
            }
        }
        self.events_tx.lock().await.take();
        Ok(())
    }
}

impl<P: TurnProtocol> Drop for TurnSession<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
