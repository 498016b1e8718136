//! 飞书（Lark）平台
//!
//! 通过事件订阅 Webhook 接收消息，经 tenant_access_token 调用开放平台接口回复。
//!
//! 飞书要求 Webhook 在 **3 秒内** 返回 200，否则判失败并重试。
//! 这里解析事件后立即把消息投递给 Engine 并返回。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::LarkSection;
use crate::core::PlatformError;
use crate::platform::{Message, Platform, ReplyContext, DEFAULT_MAX_MESSAGE_LEN};

const NAME: &str = "lark";
/// 去重缓存上限，超过后清空
const MAX_PROCESSED_EVENTS: usize = 10_000;
/// token 提前刷新的余量
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// 事件回调顶层（兼容 v1 与 v2.0 格式）
#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(rename = "type")]
    type_: Option<String>,
    challenge: Option<String>,
    /// v2.0 格式：header 内含 event_type、event_id
    header: Option<EventHeader>,
    event: Option<EventData>,
    /// 配置了 Encrypt Key 时为加密体
    encrypt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    event_id: Option<String>,
    event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(rename = "type")]
    type_: Option<String>,
    event_id: Option<String>,
    sender: Option<Sender>,
    message: Option<MessageData>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    sender_id: Option<SenderId>,
}

#[derive(Debug, Deserialize)]
struct SenderId {
    open_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageData {
    chat_id: Option<String>,
    content: Option<String>,
    message_id: Option<String>,
    message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentText {
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    receive_id: &'a str,
    msg_type: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ReplyMessageRequest {
    msg_type: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    code: i64,
    tenant_access_token: Option<String>,
    /// 有效期（秒）
    #[serde(default)]
    expire: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Webhook 处理器共享的状态
struct LarkState {
    handler: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    processed_events: Mutex<HashSet<String>>,
}

pub struct LarkPlatform {
    config: LarkSection,
    client: reqwest::Client,
    state: Arc<LarkState>,
    token: Mutex<Option<CachedToken>>,
    shutdown: CancellationToken,
}

impl LarkPlatform {
    pub fn new(config: LarkSection) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            state: Arc::new(LarkState {
                handler: RwLock::new(None),
                processed_events: Mutex::new(HashSet::new()),
            }),
            token: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/webhook", post(webhook_handler))
            .route("/health", axum::routing::get(|| async { "OK" }))
            .with_state(Arc::clone(&self.state))
    }

    /// 获取 tenant_access_token（带缓存，过期前刷新）
    async fn tenant_token(&self) -> Result<String, PlatformError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }
        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.config.base_url
        );
        let body = serde_json::json!({
            "app_id": self.config.app_id,
            "app_secret": self.config.app_secret,
        });
        let resp: TokenResponse = self.client.post(&url).json(&body).send().await?.json().await?;
        let value = match resp.tenant_access_token {
            Some(token) if resp.code == 0 => token,
            _ => {
                return Err(PlatformError::Api {
                    platform: NAME.to_string(),
                    body: format!("tenant_access_token request failed (code {})", resp.code),
                })
            }
        };
        let ttl = Duration::from_secs(resp.expire).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(value)
    }

    async fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<(), PlatformError> {
        let token = self.tenant_token().await?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(PlatformError::Api {
                platform: NAME.to_string(),
                body: text,
            });
        }
        Ok(())
    }
}

fn text_content(text: &str) -> String {
    serde_json::json!({ "text": text }).to_string()
}

#[async_trait]
impl Platform for LarkPlatform {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&self, handler: mpsc::UnboundedSender<Message>) -> Result<(), PlatformError> {
        *self.state.handler.write().await = Some(handler);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PlatformError::Start(format!("bind {}: {}", addr, e)))?;
        tracing::info!("Lark webhook listening on http://{}/webhook", addr);

        let app = self.router();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("Lark webhook server error: {}", e);
            }
        });
        Ok(())
    }

    async fn reply(&self, ctx: &ReplyContext, text: &str) -> Result<(), PlatformError> {
        let Some(message_id) = ctx.message_id.as_deref() else {
            return self.send(ctx, text).await;
        };
        let url = format!(
            "{}/open-apis/im/v1/messages/{}/reply",
            self.config.base_url, message_id
        );
        let req = ReplyMessageRequest {
            msg_type: "text",
            content: text_content(text),
        };
        self.post_json(&url, &req).await
    }

    async fn send(&self, ctx: &ReplyContext, text: &str) -> Result<(), PlatformError> {
        let url = format!(
            "{}/open-apis/im/v1/messages?receive_id_type=chat_id",
            self.config.base_url
        );
        let req = SendMessageRequest {
            receive_id: &ctx.chat_id,
            msg_type: "text",
            content: text_content(text),
        };
        self.post_json(&url, &req).await
    }

    async fn stop(&self) -> Result<(), PlatformError> {
        self.shutdown.cancel();
        self.state.handler.write().await.take();
        Ok(())
    }

    fn max_message_len(&self) -> usize {
        DEFAULT_MAX_MESSAGE_LEN
    }
}

/// POST /webhook：URL 校验 + 消息回调
async fn webhook_handler(
    State(state): State<Arc<LarkState>>,
    Json(payload): Json<EventPayload>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    tracing::debug!(
        "Lark webhook received: type={:?}",
        payload.type_.as_deref().unwrap_or("(none)")
    );

    if payload.type_.as_deref() == Some("url_verification") {
        if let Some(challenge) = payload.challenge {
            return Ok(Json(serde_json::json!({ "challenge": challenge })));
        }
        return Err(StatusCode::BAD_REQUEST);
    }

    if payload.encrypt.is_some() {
        tracing::warn!("Lark webhook: payload is encrypted, remove the Encrypt Key in the Lark console");
        return Ok(Json(serde_json::json!({})));
    }

    if let Some(message) = parse_message(payload, &state).await {
        tracing::info!(
            session_key = %message.session_key,
            "Lark webhook: accepted message body_len={}",
            message.content.len()
        );
        match state.handler.read().await.as_ref() {
            Some(handler) => {
                if handler.send(message).is_err() {
                    tracing::warn!("Lark webhook: engine is no longer receiving messages");
                }
            }
            None => tracing::warn!("Lark webhook: platform not started, dropping message"),
        }
    }

    Ok(Json(serde_json::json!({})))
}

async fn parse_message(payload: EventPayload, state: &LarkState) -> Option<Message> {
    let event = payload.event?;
    let event_type = payload
        .header
        .as_ref()
        .and_then(|h| h.event_type.as_deref())
        .or(event.type_.as_deref());
    if event_type != Some("im.message.receive_v1") {
        tracing::debug!("Lark webhook: ignoring event type {:?}", event_type);
        return None;
    }
    let msg = event.message?;
    let chat_id = msg.chat_id?;
    if msg.message_type.as_deref() != Some("text") {
        tracing::info!(
            "Lark webhook: message_type {:?} not text, ignoring",
            msg.message_type.as_deref()
        );
        return None;
    }
    let content: ContentText =
        serde_json::from_str(msg.content.as_deref().unwrap_or("{}")).ok()?;
    let body = strip_at_mentions(content.text?.trim());
    if body.is_empty() {
        return None;
    }

    let event_id = payload
        .header
        .as_ref()
        .and_then(|h| h.event_id.clone())
        .or(event.event_id)
        .unwrap_or_default();
    if !event_id.is_empty() {
        let mut processed = state.processed_events.lock().await;
        if !processed.insert(event_id.clone()) {
            tracing::debug!("Duplicate event ignored: {}", event_id);
            return None;
        }
        if processed.len() > MAX_PROCESSED_EVENTS {
            processed.clear();
            processed.insert(event_id);
        }
    }

    let open_id = event
        .sender
        .and_then(|s| s.sender_id)
        .and_then(|id| id.open_id)
        .unwrap_or_default();
    Some(Message {
        session_key: format!("{}:{}:{}", NAME, chat_id, open_id),
        platform: NAME.to_string(),
        user_id: open_id,
        user_name: String::new(),
        content: body,
        images: Vec::new(),
        audio: None,
        reply_ctx: ReplyContext {
            chat_id,
            message_id: msg.message_id,
        },
    })
}

static AT_MENTION_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 去掉飞书 @ 提及，如 `@_user_1` 占位符或 <at user_id="ou_xxx">@名字</at>
fn strip_at_mentions(s: &str) -> String {
    let re = AT_MENTION_RE.get_or_init(|| Regex::new(r#"(<at[^>]*>.*?</at>|@_user_\d+)\s*"#).ok());
    match re {
        Some(re) => re.replace_all(s, "").trim().to_string(),
        None => s.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> LarkState {
        LarkState {
            handler: RwLock::new(None),
            processed_events: Mutex::new(HashSet::new()),
        }
    }

    fn text_event(event_id: &str, text: &str) -> EventPayload {
        serde_json::from_value(json!({
            "schema": "2.0",
            "header": {"event_id": event_id, "event_type": "im.message.receive_v1"},
            "event": {
                "sender": {"sender_id": {"open_id": "ou_alice"}},
                "message": {
                    "chat_id": "oc_1",
                    "message_id": "om_1",
                    "message_type": "text",
                    "content": json!({"text": text}).to_string()
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_strip_at_mentions() {
        assert_eq!(strip_at_mentions("@_user_1 hello"), "hello");
        assert_eq!(
            strip_at_mentions(r#"<at user_id="ou_x">@Bee</at> run tests"#),
            "run tests"
        );
    }

    #[tokio::test]
    async fn test_parse_text_message() {
        let state = state();
        let msg = parse_message(text_event("ev-1", "@_user_1 hi"), &state)
            .await
            .unwrap();
        assert_eq!(msg.session_key, "lark:oc_1:ou_alice");
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.reply_ctx.message_id.as_deref(), Some("om_1"));
    }

    #[tokio::test]
    async fn test_duplicate_event_dropped() {
        let state = state();
        assert!(parse_message(text_event("ev-2", "hi"), &state).await.is_some());
        assert!(parse_message(text_event("ev-2", "hi"), &state).await.is_none());
    }
}
