//! Engine：对话编排器
//!
//! 每条入站消息按以下顺序路由：
//! 1. 斜杠命令，同步处理，不占轮次锁
//! 2. 对话有待决权限请求时，把消息当作允许 / 拒绝答复（绕过轮次锁）
//! 3. 非阻塞获取轮次锁；失败立即回复忙碌提示并丢弃消息
//! 4. 成功则在独立任务中执行一轮：启动或复用驱动、发送、消费事件流、回复

pub mod chunk;
pub mod commands;
pub mod interactive;
pub mod permission;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::summary::truncate_chars;
use crate::agent::{Agent, AgentSession, Event, PermissionResponse};
use crate::config::EngineSection;
use crate::core::{AgentError, PlatformError, RecoveryAction, RecoveryEngine};
use crate::platform::{Message, Platform, ReplyContext};
use crate::session::{Role, Session, SessionRegistry, TurnGuard};

use chunk::split_message;
use commands::{Command, HELP_TEXT};
use interactive::{InteractiveState, InteractiveTable, PendingPermission};
use permission::{parse_decision, PermissionDecision, DECISION_HINT};

/// 空回复的占位文本
pub const EMPTY_RESPONSE: &str = "(empty response)";
pub const BUSY_NOTICE: &str = "⏳ Still working on the previous message. Please wait.";
pub const AUDIO_NOTICE: &str = "🎤 Voice messages are not supported yet. Please send text.";
pub const EXITED_NOTICE: &str =
    "⚠️ The agent process exited unexpectedly. Send another message to start a new session.";

const THINKING_PREVIEW_CHARS: usize = 200;
const HISTORY_PREVIEW_CHARS: usize = 200;
const TURN_CHANNEL_CAPACITY: usize = 64;

/// 权限请求的等待策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionPolicy {
    /// 一直等到用户答复
    WaitForever,
    /// 超时后自动拒绝
    AutoDeny(Duration),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub history_limit: usize,
    pub permission: PermissionPolicy,
    pub max_restarts: u32,
}

impl EngineSettings {
    pub fn from_config(cfg: &EngineSection) -> Self {
        let permission = match cfg.permission_timeout_secs {
            0 => PermissionPolicy::WaitForever,
            secs => PermissionPolicy::AutoDeny(Duration::from_secs(secs)),
        };
        Self {
            history_limit: cfg.history_limit,
            permission,
            max_restarts: cfg.max_restarts,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineSection::default())
    }
}

/// 一轮对话的结果摘要
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSummary {
    pub session_key: String,
    pub response: String,
    pub tool_count: usize,
    pub session_id: Option<String>,
}

enum TurnOutcome {
    Completed(TurnSummary),
    Failed { partial: String, error: String },
    /// 事件流在终止事件前关闭
    Closed { partial: String },
}

pub struct Engine {
    settings: EngineSettings,
    agent: Arc<dyn Agent>,
    platforms: HashMap<String, Arc<dyn Platform>>,
    sessions: Arc<SessionRegistry>,
    states: InteractiveTable,
    recovery: RecoveryEngine,
    turns: broadcast::Sender<TurnSummary>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        agent: Arc<dyn Agent>,
        platforms: Vec<Arc<dyn Platform>>,
        sessions: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let recovery = RecoveryEngine::new(settings.max_restarts);
        let platforms = platforms
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        let (turns, _) = broadcast::channel(TURN_CHANNEL_CAPACITY);
        Arc::new(Self {
            settings,
            agent,
            platforms,
            sessions,
            states: InteractiveTable::new(),
            recovery,
            turns,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// 订阅已完成轮次的摘要
    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnSummary> {
        self.turns.subscribe()
    }

    /// 启动所有平台并消费入站消息，直到 `shutdown` 触发；退出前关闭所有驱动并写盘
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), PlatformError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for platform in self.platforms.values() {
            platform.start(tx.clone()).await?;
            info!(platform = platform.name(), "Platform started");
        }
        drop(tx);
        info!(agent = self.agent.name(), "Engine running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping engine");
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        warn!("All platforms closed their message channels");
                        break;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// 路由一条入站消息；一轮对话在独立任务中运行，本函数不等待它
    pub async fn handle_message(self: &Arc<Self>, msg: Message) {
        let Some(platform) = self.platforms.get(&msg.platform).cloned() else {
            warn!(platform = %msg.platform, "Message from unknown platform dropped");
            return;
        };
        debug!(session_key = %msg.session_key, user = %msg.user_id, "Inbound message");

        if let Some(cmd) = Command::parse(&msg.content) {
            self.handle_command(&platform, &msg, cmd).await;
            return;
        }

        if let Some(state) = self.states.get(&msg.session_key).await {
            if state.has_pending() {
                self.handle_decision(&platform, &msg, &state).await;
                return;
            }
        }

        if msg.content.trim().is_empty() && msg.images.is_empty() {
            if msg.audio.is_some() {
                self.reply(&platform, &msg.reply_ctx, AUDIO_NOTICE).await;
            }
            return;
        }

        let session = self.sessions.get_or_create(&msg.session_key).await;
        let Some(guard) = session.try_lock() else {
            info!(session_key = %msg.session_key, "Session busy, message rejected");
            self.reply(&platform, &msg.reply_ctx, BUSY_NOTICE).await;
            return;
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.process_turn(platform, msg, guard).await;
        });
    }

    async fn handle_decision(
        &self,
        platform: &Arc<dyn Platform>,
        msg: &Message,
        state: &InteractiveState,
    ) {
        let Some(decision) = parse_decision(&msg.content) else {
            let tool = state.pending_tool().unwrap_or_default();
            let hint = format!("🔐 `{}` is waiting for your approval.\n{}", tool, DECISION_HINT);
            self.reply(platform, &msg.reply_ctx, &hint).await;
            return;
        };
        let Some(tool) = state.resolve_pending(decision) else {
            return;
        };
        let ack = match decision {
            PermissionDecision::Allow => format!("✅ Allowed `{}`.", tool),
            PermissionDecision::AllowAll => {
                "✅ Allowed. All further tool requests in this session will be approved.".to_string()
            }
            PermissionDecision::Deny => format!("❌ Denied `{}`.", tool),
        };
        self.reply(platform, &msg.reply_ctx, &ack).await;
    }

    async fn process_turn(self: Arc<Self>, platform: Arc<dyn Platform>, msg: Message, guard: TurnGuard) {
        let session = Arc::clone(guard.session());
        let key = msg.session_key.clone();
        let state = self.states.get_or_create(&key).await;
        self.sessions
            .append_history(&session, Role::User, &msg.content)
            .await;

        let driver = match self.send_with_restart(&state, &session, &msg).await {
            Ok(driver) => driver,
            Err(text) => {
                self.reply(&platform, &msg.reply_ctx, &format!("❌ {}", text)).await;
                return;
            }
        };

        match self.drain_events(&platform, &msg, &state, &driver).await {
            TurnOutcome::Completed(summary) => {
                self.sessions
                    .append_history(&session, Role::Assistant, &summary.response)
                    .await;
                if let Some(id) = &summary.session_id {
                    self.sessions.assign_agent_session_id(&session, id).await;
                }
                self.deliver(&platform, &msg.reply_ctx, &summary.response).await;
                info!(
                    session_key = %key,
                    tool_count = summary.tool_count,
                    session_id = summary.session_id.as_deref().unwrap_or(""),
                    response_chars = summary.response.chars().count(),
                    "Turn completed"
                );
                // 没有订阅者时发送失败，忽略
                let _ = self.turns.send(summary);
            }
            TurnOutcome::Failed { partial, error } => {
                warn!(session_key = %key, error = %error, "Turn failed");
                // 进程已退出（如按轮驱动未产出结果）时丢弃状态，下一条消息重新启动
                let current = driver.is_alive() || self.discard_state(&key, &state, &driver).await;
                if current {
                    if let Some(id) = driver.current_session_id() {
                        self.sessions.assign_agent_session_id(&session, &id).await;
                    }
                }
                let text = if partial.trim().is_empty() {
                    format!("❌ {}", error)
                } else {
                    partial
                };
                self.deliver(&platform, &msg.reply_ctx, &text).await;
            }
            TurnOutcome::Closed { partial } => {
                let was_current = self.discard_state(&key, &state, &driver).await;
                if was_current {
                    if let Some(id) = driver.current_session_id() {
                        self.sessions.assign_agent_session_id(&session, &id).await;
                    }
                }
                if !partial.trim().is_empty() {
                    self.deliver(&platform, &msg.reply_ctx, &partial).await;
                } else if was_current {
                    warn!(session_key = %key, "Agent exited mid-turn");
                    self.reply(&platform, &msg.reply_ctx, EXITED_NOTICE).await;
                }
            }
        }

        guard.unlock();
    }

    /// 从表中移除状态并关闭驱动；返回状态是否仍是当前状态（/stop 后为 false）
    async fn discard_state(
        &self,
        key: &str,
        state: &Arc<InteractiveState>,
        driver: &Arc<dyn AgentSession>,
    ) -> bool {
        let was_current = self.states.remove_if_same(key, state).await;
        state.clear_driver_if(driver).await;
        if let Err(e) = driver.close().await {
            warn!("Failed to close agent session: {}", e);
        }
        was_current
    }

    /// 返回可用的驱动；进程不在时启动新的，并以会话中记录的后端 id 续接
    async fn ensure_driver(
        &self,
        state: &InteractiveState,
        session: &Session,
    ) -> Result<Arc<dyn AgentSession>, AgentError> {
        let mut slot = state.driver_slot().await;
        if let Some(driver) = slot.as_ref() {
            if driver.is_alive() {
                return Ok(Arc::clone(driver));
            }
        }
        if let Some(dead) = slot.take() {
            if let Some(id) = dead.current_session_id() {
                self.sessions.assign_agent_session_id(session, &id).await;
            }
            if let Err(e) = dead.close().await {
                debug!("Closing dead agent session: {}", e);
            }
        }
        let resume = session.agent_session_id();
        info!(
            session_key = session.key(),
            agent = self.agent.name(),
            resume = resume.as_deref().unwrap_or(""),
            "Starting agent session"
        );
        let driver = self.agent.start_session(resume.as_deref()).await?;
        *slot = Some(Arc::clone(&driver));
        Ok(driver)
    }

    /// 发送 prompt；进程已死时按恢复策略重启后重发
    async fn send_with_restart(
        &self,
        state: &InteractiveState,
        session: &Session,
        msg: &Message,
    ) -> Result<Arc<dyn AgentSession>, String> {
        let mut attempts = 0;
        loop {
            let result = match self.ensure_driver(state, session).await {
                Ok(driver) => driver
                    .send(&msg.content, &msg.images)
                    .await
                    .map(|_| Arc::clone(&driver))
                    .map_err(|e| (Some(driver), e)),
                Err(e) => Err((None, e)),
            };
            let (driver, err) = match result {
                Ok(driver) => return Ok(driver),
                Err(failure) => failure,
            };
            match self.recovery.on_send_failure(&err, attempts) {
                RecoveryAction::Restart => {
                    attempts += 1;
                    warn!(session_key = session.key(), attempts, "Agent not alive, restarting: {}", err);
                    if let Some(driver) = driver {
                        if let Some(id) = driver.current_session_id() {
                            self.sessions.assign_agent_session_id(session, &id).await;
                        }
                        state.clear_driver_if(&driver).await;
                        if let Err(e) = driver.close().await {
                            debug!("Closing dead agent session: {}", e);
                        }
                    }
                }
                RecoveryAction::Surface(text) => {
                    error!(session_key = session.key(), "Failed to send prompt: {}", err);
                    if let Some(driver) = driver {
                        if !driver.is_alive() {
                            state.clear_driver_if(&driver).await;
                            if let Err(e) = driver.close().await {
                                debug!("Closing dead agent session: {}", e);
                            }
                        }
                    }
                    return Err(text);
                }
            }
        }
    }

    /// 消费事件流直到终止事件或流关闭
    async fn drain_events(
        &self,
        platform: &Arc<dyn Platform>,
        msg: &Message,
        state: &InteractiveState,
        driver: &Arc<dyn AgentSession>,
    ) -> TurnOutcome {
        let events = driver.events();
        let mut text = String::new();
        let mut tool_count = 0;
        loop {
            let Some(event) = events.next().await else {
                return TurnOutcome::Closed { partial: text };
            };
            match event {
                Event::Text { content } => text.push_str(&content),
                Event::ToolUse { tool, summary } => {
                    tool_count += 1;
                    if !state.is_quiet() {
                        let notice = if summary.is_empty() {
                            format!("🔧 {}", tool)
                        } else {
                            format!("🔧 {}: {}", tool, summary)
                        };
                        self.notify(platform, &msg.reply_ctx, &notice).await;
                    }
                }
                Event::ToolResult { tool, content } => {
                    debug!(tool = tool.as_deref().unwrap_or(""), chars = content.chars().count(), "Tool result");
                }
                Event::Thinking { content } => {
                    if !state.is_quiet() && !content.trim().is_empty() {
                        let notice = format!("💭 {}", truncate_chars(content.trim(), THINKING_PREVIEW_CHARS));
                        self.notify(platform, &msg.reply_ctx, &notice).await;
                    }
                }
                Event::PermissionRequest {
                    request_id,
                    tool,
                    summary,
                    input,
                } => {
                    self.handle_permission_request(platform, msg, state, driver, request_id, tool, summary, input)
                        .await;
                }
                Event::Result { content, session_id } => {
                    let response = if !content.trim().is_empty() {
                        content
                    } else if !text.trim().is_empty() {
                        text
                    } else {
                        EMPTY_RESPONSE.to_string()
                    };
                    return TurnOutcome::Completed(TurnSummary {
                        session_key: msg.session_key.clone(),
                        response,
                        tool_count,
                        session_id: session_id
                            .filter(|id| !id.is_empty())
                            .or_else(|| driver.current_session_id()),
                    });
                }
                Event::Error { message } => {
                    return TurnOutcome::Failed {
                        partial: text,
                        error: message,
                    };
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_permission_request(
        &self,
        platform: &Arc<dyn Platform>,
        msg: &Message,
        state: &InteractiveState,
        driver: &Arc<dyn AgentSession>,
        request_id: String,
        tool: String,
        summary: String,
        input: Value,
    ) {
        let response = if state.approve_all() || state.is_tool_allowed(&tool) {
            debug!(tool = %tool, "Permission auto-approved");
            PermissionResponse::allow(input)
        } else {
            let (pending, rx) = PendingPermission::new(request_id.clone(), tool.clone(), input);
            state.set_pending(pending);
            let mut prompt = format!("🔐 Permission request\nTool: {}", tool);
            if !summary.is_empty() {
                prompt.push('\n');
                prompt.push_str(&summary);
            }
            prompt.push_str("\n\n");
            prompt.push_str(DECISION_HINT);
            self.reply(platform, &msg.reply_ctx, &prompt).await;
            info!(session_key = %msg.session_key, tool = %tool, request_id = %request_id, "Waiting for permission");

            let deadline = match self.settings.permission {
                PermissionPolicy::WaitForever => None,
                PermissionPolicy::AutoDeny(timeout) => Some(timeout),
            };
            match state.await_decision(&request_id, rx, deadline).await {
                Some(response) => response,
                None => {
                    warn!(tool = %tool, request_id = %request_id, "Permission request timed out");
                    let notice = format!("⌛ No answer for `{}`, denied.", tool);
                    self.reply(platform, &msg.reply_ctx, &notice).await;
                    PermissionResponse::deny("The user did not answer in time")
                }
            }
        };
        if let Err(e) = driver.respond_permission(&request_id, response).await {
            warn!(request_id = %request_id, "Failed to answer permission request: {}", e);
        }
    }

    async fn handle_command(&self, platform: &Arc<dyn Platform>, msg: &Message, cmd: Command) {
        let key = msg.session_key.as_str();
        info!(session_key = key, command = ?cmd, "Command");
        let text = match cmd {
            Command::New => {
                self.teardown(key).await;
                let session = self.sessions.get_or_create(key).await;
                self.sessions.reset_agent_session(&session).await;
                "🆕 Started a new session. Your next message goes to a fresh agent session.".to_string()
            }
            Command::List => self.list_text(key).await,
            Command::Switch(target) => self.switch(key, &target).await,
            Command::Current => {
                let session = self.sessions.get_or_create(key).await;
                let id = session
                    .agent_session_id()
                    .unwrap_or_else(|| "not started".to_string());
                format!(
                    "Agent: {}\nSession: {}\nMessages: {}",
                    self.agent.name(),
                    id,
                    session.history_len()
                )
            }
            Command::History(n) => {
                let session = self.sessions.get_or_create(key).await;
                let entries = session.history(n.unwrap_or(self.settings.history_limit));
                if entries.is_empty() {
                    "No history yet.".to_string()
                } else {
                    entries
                        .iter()
                        .map(|e| {
                            let role = match e.role {
                                Role::User => "👤",
                                Role::Assistant => "🤖",
                            };
                            format!("{} {}", role, truncate_chars(&e.content, HISTORY_PREVIEW_CHARS))
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Command::Allow(Some(tool)) => {
                self.states.get_or_create(key).await.allow_tool(&tool);
                format!("✅ `{}` will be allowed without asking.", tool)
            }
            Command::Allow(None) => {
                let tools = match self.states.get(key).await {
                    Some(state) => state.allowed_tools(),
                    None => Vec::new(),
                };
                if tools.is_empty() {
                    "No tools are always allowed. Use /allow <tool>.".to_string()
                } else {
                    format!("Always allowed: {}", tools.join(", "))
                }
            }
            Command::Quiet => {
                if self.states.get_or_create(key).await.toggle_quiet() {
                    "🔇 Quiet mode on.".to_string()
                } else {
                    "🔔 Quiet mode off.".to_string()
                }
            }
            Command::Stop => {
                if self.teardown(key).await {
                    "⏹ Stopped.".to_string()
                } else {
                    "Nothing is running.".to_string()
                }
            }
            Command::Help => HELP_TEXT.to_string(),
            Command::Unknown(name) => format!("Unknown command /{}. Send /help for the list.", name),
        };
        self.reply(platform, &msg.reply_ctx, &text).await;
    }

    /// 移除交互状态并拒绝待决请求，驱动在后台关闭；返回是否存在状态
    async fn teardown(&self, key: &str) -> bool {
        let Some(state) = self.states.remove(key).await else {
            return false;
        };
        state.resolve_pending(PermissionDecision::Deny);
        let key = key.to_string();
        tokio::spawn(async move {
            state.teardown().await;
            debug!(session_key = %key, "Agent session closed");
        });
        true
    }

    async fn list_text(&self, key: &str) -> String {
        let sessions = match self.agent.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Failed to list agent sessions: {}", e);
                return format!("❌ Failed to list sessions: {}", e);
            }
        };
        if sessions.is_empty() {
            return "No sessions found for this project.".to_string();
        }
        let current = match self.sessions.get(key).await {
            Some(session) => session.agent_session_id(),
            None => None,
        };
        sessions
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let marker = if current.as_deref() == Some(s.id.as_str()) {
                    "▶"
                } else {
                    " "
                };
                let short: String = s.id.chars().take(8).collect();
                format!(
                    "{} {}. {} · {} · {} msgs · {}",
                    marker,
                    i + 1,
                    short,
                    truncate_chars(&s.summary, 60),
                    s.message_count,
                    s.modified.format("%Y-%m-%d %H:%M")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn switch(&self, key: &str, target: &str) -> String {
        let sessions = match self.agent.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => return format!("❌ Failed to list sessions: {}", e),
        };
        let chosen = match target.parse::<usize>() {
            Ok(n) if n >= 1 && n <= sessions.len() => Some(&sessions[n - 1]),
            _ => sessions.iter().find(|s| s.id.starts_with(target)),
        };
        let Some(chosen) = chosen else {
            return format!("No session matches `{}`. Send /list to see sessions.", target);
        };
        self.teardown(key).await;
        let session = self.sessions.get_or_create(key).await;
        self.sessions.switch_agent_session(&session, &chosen.id).await;
        format!(
            "🔀 Switched to {} ({}).",
            chosen.id,
            truncate_chars(&chosen.summary, 60)
        )
    }

    /// 分段回复：第一段引用原消息，其余作为新消息；任一段失败即停止
    async fn deliver(&self, platform: &Arc<dyn Platform>, ctx: &ReplyContext, text: &str) {
        for (i, chunk) in split_message(text, platform.max_message_len()).iter().enumerate() {
            let result = if i == 0 {
                platform.reply(ctx, chunk).await
            } else {
                platform.send(ctx, chunk).await
            };
            if let Err(e) = result {
                error!(platform = platform.name(), chunk = i, "Failed to deliver reply: {}", e);
                return;
            }
        }
    }

    async fn reply(&self, platform: &Arc<dyn Platform>, ctx: &ReplyContext, text: &str) {
        if let Err(e) = platform.reply(ctx, text).await {
            error!(platform = platform.name(), "Failed to reply: {}", e);
        }
    }

    /// 进度提示；失败只记录
    async fn notify(&self, platform: &Arc<dyn Platform>, ctx: &ReplyContext, text: &str) {
        if let Err(e) = platform.send(ctx, text).await {
            debug!(platform = platform.name(), "Failed to send progress notice: {}", e);
        }
    }

    /// 停止平台、关闭所有驱动、停止后端并写盘
    pub async fn shutdown(&self) {
        for platform in self.platforms.values() {
            if let Err(e) = platform.stop().await {
                warn!(platform = platform.name(), "Failed to stop platform: {}", e);
            }
        }
        let states = self.states.drain_all().await;
        info!(sessions = states.len(), "Closing agent sessions");
        futures_util::future::join_all(states.iter().map(|s| s.teardown())).await;
        if let Err(e) = self.agent.stop().await {
            warn!(agent = self.agent.name(), "Failed to stop agent: {}", e);
        }
        if let Err(e) = self.sessions.save().await {
            error!("Failed to save sessions: {}", e);
        }
        info!("Engine stopped");
    }
}
