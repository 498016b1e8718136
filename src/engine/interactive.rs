//! 交互状态表：对话键 → 运行中的驱动、待决权限请求与对话级开关
//!
//! 状态只在内存中。驱动崩溃、/stop、/new、/switch 时整条记录被移除，下一条消息重新创建。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, RwLock};

use crate::agent::{AgentSession, PermissionResponse};
use crate::engine::permission::PermissionDecision;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 正在等待用户答复的权限请求
pub struct PendingPermission {
    pub request_id: String,
    pub tool: String,
    /// 批准时原样回传给后端
    pub input: Value,
    resolve: oneshot::Sender<PermissionResponse>,
}

impl PendingPermission {
    pub fn new(
        request_id: String,
        tool: String,
        input: Value,
    ) -> (Self, oneshot::Receiver<PermissionResponse>) {
        let (resolve, rx) = oneshot::channel();
        (
            Self {
                request_id,
                tool,
                input,
                resolve,
            },
            rx,
        )
    }

    /// 关闭等待信号；接收方已放弃时忽略
    fn resolve(self, response: PermissionResponse) {
        let _ = self.resolve.send(response);
    }
}

/// 一个对话的运行时状态
#[derive(Default)]
pub struct InteractiveState {
    agent_session: tokio::sync::Mutex<Option<Arc<dyn AgentSession>>>,
    pending: Mutex<Option<PendingPermission>>,
    approve_all: AtomicBool,
    quiet: AtomicBool,
    allowed_tools: Mutex<HashSet<String>>,
}

impl InteractiveState {
    /// 当前驱动的锁；启动新驱动时持有它，避免同一对话启动两个进程
    pub async fn driver_slot(
        &self,
    ) -> tokio::sync::MutexGuard<'_, Option<Arc<dyn AgentSession>>> {
        self.agent_session.lock().await
    }

    pub async fn take_driver(&self) -> Option<Arc<dyn AgentSession>> {
        self.agent_session.lock().await.take()
    }

    /// 仅当槽中仍是 `driver` 时清空
    pub async fn clear_driver_if(&self, driver: &Arc<dyn AgentSession>) {
        let mut slot = self.agent_session.lock().await;
        if slot.as_ref().is_some_and(|d| Arc::ptr_eq(d, driver)) {
            slot.take();
        }
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }

    pub fn pending_tool(&self) -> Option<String> {
        lock(&self.pending).as_ref().map(|p| p.tool.clone())
    }

    pub fn set_pending(&self, pending: PendingPermission) {
        let previous = lock(&self.pending).replace(pending);
        if let Some(previous) = previous {
            tracing::warn!(request_id = %previous.request_id, "Replacing unresolved permission request");
            previous.resolve(PermissionResponse::deny("Superseded by a newer request"));
        }
    }

    /// 用用户的决定关闭待决请求；返回被关闭请求的工具名
    pub fn resolve_pending(&self, decision: PermissionDecision) -> Option<String> {
        let pending = lock(&self.pending).take()?;
        let tool = pending.tool.clone();
        let response = match decision {
            PermissionDecision::Allow => PermissionResponse::allow(pending.input.clone()),
            PermissionDecision::AllowAll => {
                self.approve_all.store(true, Ordering::SeqCst);
                PermissionResponse::allow(pending.input.clone())
            }
            PermissionDecision::Deny => PermissionResponse::deny("The user denied this tool use"),
        };
        tracing::info!(request_id = %pending.request_id, tool = %tool, ?decision, "Permission resolved");
        pending.resolve(response);
        Some(tool)
    }

    /// 仅当待决请求仍是 `request_id` 时撤回（超时路径）
    pub fn withdraw_pending(&self, request_id: &str) -> bool {
        let mut pending = lock(&self.pending);
        if pending.as_ref().is_some_and(|p| p.request_id == request_id) {
            pending.take();
            true
        } else {
            false
        }
    }

    /// 等待用户答复；超时且请求仍待决时撤回并返回 None
    ///
    /// 超时与用户答复同时发生时，以用户的答复为准。
    pub async fn await_decision(
        &self,
        request_id: &str,
        mut rx: oneshot::Receiver<PermissionResponse>,
        deadline: Option<Duration>,
    ) -> Option<PermissionResponse> {
        let abandoned = || PermissionResponse::deny("Permission request abandoned");
        let Some(deadline) = deadline else {
            return Some(rx.await.unwrap_or_else(|_| abandoned()));
        };
        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(resolved) => Some(resolved.unwrap_or_else(|_| abandoned())),
            Err(_) if self.withdraw_pending(request_id) => None,
            Err(_) => {
                tracing::debug!(request_id, "Permission answered at the deadline");
                Some(rx.await.unwrap_or_else(|_| abandoned()))
            }
        }
    }

    pub fn approve_all(&self) -> bool {
        self.approve_all.load(Ordering::SeqCst)
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    /// 切换安静模式，返回切换后的值
    pub fn toggle_quiet(&self) -> bool {
        !self.quiet.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn allow_tool(&self, tool: &str) {
        lock(&self.allowed_tools).insert(tool.to_string());
    }

    pub fn is_tool_allowed(&self, tool: &str) -> bool {
        lock(&self.allowed_tools).contains(tool)
    }

    pub fn allowed_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = lock(&self.allowed_tools).iter().cloned().collect();
        tools.sort();
        tools
    }

    /// 拒绝待决请求并关闭驱动
    pub async fn teardown(&self) {
        self.resolve_pending(PermissionDecision::Deny);
        if let Some(driver) = self.take_driver().await {
            if let Err(e) = driver.close().await {
                tracing::warn!("Failed to close agent session: {}", e);
            }
        }
    }
}

/// 对话键 → InteractiveState
#[derive(Default)]
pub struct InteractiveTable {
    states: RwLock<HashMap<String, Arc<InteractiveState>>>,
}

impl InteractiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<InteractiveState>> {
        self.states.read().await.get(key).cloned()
    }

    pub async fn get_or_create(&self, key: &str) -> Arc<InteractiveState> {
        if let Some(state) = self.get(key).await {
            return state;
        }
        let mut states = self.states.write().await;
        Arc::clone(states.entry(key.to_string()).or_default())
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<InteractiveState>> {
        self.states.write().await.remove(key)
    }

    /// 仅当表中仍是 `state` 时移除；返回是否移除
    pub async fn remove_if_same(&self, key: &str, state: &Arc<InteractiveState>) -> bool {
        let mut states = self.states.write().await;
        if states.get(key).is_some_and(|s| Arc::ptr_eq(s, state)) {
            states.remove(key);
            true
        } else {
            false
        }
    }

    pub async fn drain_all(&self) -> Vec<Arc<InteractiveState>> {
        self.states.write().await.drain().map(|(_, s)| s).collect()
    }
}
