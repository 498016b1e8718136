//! 聊天平台：入站消息模型与平台适配器接口
//!
//! 适配器只负责收发纯文本；会话控制全部在 Engine 中完成。
//! - **lark**：飞书事件订阅 Webhook（feature = "lark"）
//! - **whatsapp**：WhatsApp Cloud API Webhook（feature = "whatsapp"）

#[cfg(feature = "lark")]
pub mod lark;
#[cfg(feature = "whatsapp")]
pub mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::PlatformsSection;
use crate::core::PlatformError;

/// 单条消息的默认长度上限（字符数）
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4000;

/// 回复句柄：只有产生它的平台解释其内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub chat_id: String,
    /// 被回复的消息 id；为空时 reply 退化为普通发送
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: Vec<u8>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAttachment {
    pub mime_type: String,
    pub data: Vec<u8>,
    pub duration_secs: Option<u32>,
}

/// 入站消息
#[derive(Debug, Clone)]
pub struct Message {
    /// 对话键（平台 + 会话 + 用户），决定会话归属
    pub session_key: String,
    pub platform: String,
    pub user_id: String,
    pub user_name: String,
    pub content: String,
    pub images: Vec<ImageAttachment>,
    pub audio: Option<AudioAttachment>,
    pub reply_ctx: ReplyContext,
}

impl Message {
    /// 纯文本消息（调度器与测试构造消息时使用）
    pub fn text(
        platform: &str,
        session_key: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let session_key = session_key.into();
        Self {
            user_id: session_key.clone(),
            user_name: String::new(),
            session_key,
            platform: platform.to_string(),
            content: content.into(),
            images: Vec::new(),
            audio: None,
            reply_ctx: ReplyContext {
                chat_id: chat_id.into(),
                message_id: None,
            },
        }
    }
}

/// 平台适配器
#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    /// 启动接收；每条入站消息发送到 `handler`
    async fn start(&self, handler: mpsc::UnboundedSender<Message>) -> Result<(), PlatformError>;

    /// 回复触发消息
    async fn reply(&self, ctx: &ReplyContext, text: &str) -> Result<(), PlatformError>;

    /// 发送一条新消息（不引用原消息）
    async fn send(&self, ctx: &ReplyContext, text: &str) -> Result<(), PlatformError>;

    async fn stop(&self) -> Result<(), PlatformError>;

    /// 单条消息长度上限（字符数），用于回复分段
    fn max_message_len(&self) -> usize {
        DEFAULT_MAX_MESSAGE_LEN
    }
}

pub type PlatformFactory = fn(&PlatformsSection) -> Result<Arc<dyn Platform>, PlatformError>;

/// 平台注册表：名称 → 构造函数
pub struct PlatformRegistry {
    factories: HashMap<&'static str, PlatformFactory>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// 注册编译进来的平台
    pub fn with_builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "lark")]
        registry.register("lark", |cfg| {
            Ok(Arc::new(lark::LarkPlatform::new(cfg.lark.clone())))
        });
        #[cfg(feature = "whatsapp")]
        registry.register("whatsapp", |cfg| {
            Ok(Arc::new(whatsapp::WhatsAppPlatform::new(cfg.whatsapp.clone())))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: PlatformFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(
        &self,
        name: &str,
        config: &PlatformsSection,
    ) -> Result<Arc<dyn Platform>, PlatformError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PlatformError::UnknownPlatform(name.to_string()))?;
        factory(config)
    }

    /// 创建配置中启用的所有平台
    pub fn create_enabled(
        &self,
        config: &PlatformsSection,
    ) -> Result<Vec<Arc<dyn Platform>>, PlatformError> {
        let enabled = [
            ("lark", config.lark.enabled),
            ("whatsapp", config.whatsapp.enabled),
        ];
        let mut platforms = Vec::new();
        for (name, on) in enabled {
            if !on {
                continue;
            }
            if !self.factories.contains_key(name) {
                return Err(PlatformError::UnknownPlatform(format!(
                    "{} (built without the `{}` feature)",
                    name, name
                )));
            }
            platforms.push(self.create(name, config)?);
            tracing::info!(platform = name, "Platform enabled");
        }
        Ok(platforms)
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
