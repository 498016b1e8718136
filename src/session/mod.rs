//! 会话注册表：对话键 → 持久化的 Session（后端会话 id、历史、轮次锁）
//!
//! 每次追加历史、首次分配后端 id 时写盘；轮次锁只在内存中，不持久化。

pub mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::StoreError;

pub use store::{SessionFile, SessionRecord, StoreData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 一条历史记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 一个对话的持久状态
#[derive(Debug)]
pub struct Session {
    key: String,
    /// 空串表示尚未分配
    agent_session_id: Mutex<String>,
    history: Mutex<Vec<HistoryEntry>>,
    busy: AtomicBool,
}

impl Session {
    fn new(key: &str, record: SessionRecord) -> Self {
        Self {
            key: key.to_string(),
            agent_session_id: Mutex::new(record.agent_session_id),
            history: Mutex::new(record.history),
            busy: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 非阻塞地获取轮次锁；已被占用时立即返回 None
    pub fn try_lock(self: &Arc<Self>) -> Option<TurnGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TurnGuard {
                session: Arc::clone(self),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn agent_session_id(&self) -> Option<String> {
        let id = lock(&self.agent_session_id);
        if id.is_empty() {
            None
        } else {
            Some(id.clone())
        }
    }

    /// 最近 `limit` 条历史，按原顺序
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        let history = lock(&self.history);
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.history).len()
    }

    fn record(&self) -> SessionRecord {
        SessionRecord {
            agent_session_id: lock(&self.agent_session_id).clone(),
            history: lock(&self.history).clone(),
        }
    }
}

/// 轮次锁持有者；drop 或 unlock 时释放
#[derive(Debug)]
pub struct TurnGuard {
    session: Arc<Session>,
}

impl TurnGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn unlock(self) {}
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.session.busy.store(false, Ordering::Release);
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    store: Option<SessionFile>,
    /// 串行化写盘，避免并发写同一个临时文件
    save_lock: tokio::sync::Mutex<()>,
}

impl SessionRegistry {
    /// 从存储文件加载已有会话
    pub fn open(store: SessionFile) -> Result<Self, StoreError> {
        let data = store.load()?;
        tracing::info!(
            path = %store.path().display(),
            sessions = data.sessions.len(),
            "Session store loaded"
        );
        let sessions = data
            .sessions
            .into_iter()
            .map(|(key, record)| {
                let session = Arc::new(Session::new(&key, record));
                (key, session)
            })
            .collect();
        Ok(Self {
            sessions: RwLock::new(sessions),
            store: Some(store),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// 不落盘的注册表
    pub fn in_memory() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store: None,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn get_or_create(&self, key: &str) -> Arc<Session> {
        if let Some(session) = self.get(key).await {
            return session;
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(key.to_string()).or_insert_with(|| {
            tracing::debug!(session_key = key, "Session created");
            Arc::new(Session::new(key, SessionRecord::default()))
        }))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// 追加历史并写盘
    pub async fn append_history(&self, session: &Session, role: Role, content: &str) {
        lock(&session.history).push(HistoryEntry::new(role, content));
        self.persist().await;
    }

    /// 仅在尚未分配时记录后端会话 id；返回是否写入
    pub async fn assign_agent_session_id(&self, session: &Session, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        {
            let mut current = lock(&session.agent_session_id);
            if !current.is_empty() {
                return false;
            }
            *current = id.to_string();
        }
        tracing::info!(session_key = %session.key, agent_session_id = id, "Agent session assigned");
        self.persist().await;
        true
    }

    /// /new：清空后端会话 id，历史保留
    pub async fn reset_agent_session(&self, session: &Session) {
        lock(&session.agent_session_id).clear();
        self.persist().await;
    }

    /// /switch：改用指定的后端会话
    pub async fn switch_agent_session(&self, session: &Session, id: &str) {
        *lock(&session.agent_session_id) = id.to_string();
        self.persist().await;
    }

    /// 写盘；无存储时直接返回
    pub async fn save(&self) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let data = {
            let sessions = self.sessions.read().await;
            StoreData {
                sessions: sessions
                    .iter()
                    .map(|(key, session)| (key.clone(), session.record()))
                    .collect(),
            }
        };
        store.save(&data).await
    }

    /// 写盘失败只记录警告，不影响当前轮次
    async fn persist(&self) {
        if let Err(e) = self.save().await {
            tracing::warn!("Failed to persist sessions: {}", e);
        }
    }
}
