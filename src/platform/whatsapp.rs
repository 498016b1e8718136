//! WhatsApp Cloud API 平台
//!
//! GET /webhook 完成 Meta 的订阅校验，POST /webhook 接收文本、图片与语音消息，
//! 通过 Graph API 发送回复；reply 带 context.message_id 引用原消息。

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::WhatsappSection;
use crate::core::PlatformError;
use crate::platform::{
    AudioAttachment, ImageAttachment, Message, Platform, ReplyContext, DEFAULT_MAX_MESSAGE_LEN,
};

const NAME: &str = "whatsapp";
const GRAPH_API: &str = "https://graph.facebook.com/v18.0";

#[derive(Debug, Deserialize)]
struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    entry: Option<Vec<WebhookEntry>>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    changes: Option<Vec<WebhookChange>>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    value: Option<WebhookValue>,
}

#[derive(Debug, Deserialize)]
struct WebhookValue {
    contacts: Option<Vec<WebhookContact>>,
    messages: Option<Vec<WebhookMessage>>,
}

#[derive(Debug, Deserialize)]
struct WebhookContact {
    profile: Option<WebhookProfile>,
    wa_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookProfile {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    from: String,
    id: Option<String>,
    #[serde(rename = "type")]
    msg_type: Option<String>,
    text: Option<WebhookText>,
    image: Option<WebhookMedia>,
    audio: Option<WebhookMedia>,
}

#[derive(Debug, Deserialize)]
struct WebhookText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct WebhookMedia {
    id: String,
    mime_type: Option<String>,
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    url: String,
    mime_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    messaging_product: &'static str,
    to: String,
    #[serde(rename = "type")]
    msg_type: &'static str,
    text: SendMessageText<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<SendContext<'a>>,
}

#[derive(Debug, Serialize)]
struct SendMessageText<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct SendContext<'a> {
    message_id: &'a str,
}

/// Webhook 处理器共享的状态
struct WhatsappState {
    verify_token: String,
    access_token: String,
    client: reqwest::Client,
    handler: RwLock<Option<mpsc::UnboundedSender<Message>>>,
}

pub struct WhatsAppPlatform {
    config: WhatsappSection,
    state: Arc<WhatsappState>,
    shutdown: CancellationToken,
}

impl WhatsAppPlatform {
    pub fn new(config: WhatsappSection) -> Self {
        let state = Arc::new(WhatsappState {
            verify_token: config.verify_token.clone(),
            access_token: config.access_token.clone(),
            client: reqwest::Client::new(),
            handler: RwLock::new(None),
        });
        Self {
            config,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/webhook", get(webhook_verify).post(webhook_receive))
            .route("/health", get(|| async { "OK" }))
            .with_state(Arc::clone(&self.state))
    }

    async fn post_text(
        &self,
        ctx: &ReplyContext,
        text: &str,
        quote: Option<&str>,
    ) -> Result<(), PlatformError> {
        let url = format!("{}/{}/messages", GRAPH_API, self.config.phone_number_id);
        let req = SendMessageRequest {
            messaging_product: "whatsapp",
            to: ctx.chat_id.replace('+', ""),
            msg_type: "text",
            text: SendMessageText { body: text },
            context: quote.map(|message_id| SendContext { message_id }),
        };
        let resp = self
            .state
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&req)
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

#[async_trait]
impl Platform for WhatsAppPlatform {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&self, handler: mpsc::UnboundedSender<Message>) -> Result<(), PlatformError> {
        *self.state.handler.write().await = Some(handler);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PlatformError::Start(format!("bind {}: {}", addr, e)))?;
        tracing::info!("WhatsApp webhook listening on http://{}/webhook", addr);

        let app = self.router();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("WhatsApp webhook server error: {}", e);
            }
        });
        Ok(())
    }

    async fn reply(&self, ctx: &ReplyContext, text: &str) -> Result<(), PlatformError> {
        self.post_text(ctx, text, ctx.message_id.as_deref()).await
    }

    async fn send(&self, ctx: &ReplyContext, text: &str) -> Result<(), PlatformError> {
        self.post_text(ctx, text, None).await
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

/// GET /webhook：Meta 订阅校验
async fn webhook_verify(
    State(state): State<Arc<WhatsappState>>,
    Query(query): Query<WebhookVerifyQuery>,
) -> Result<String, StatusCode> {
    if query.mode.as_deref() == Some("subscribe")
        && query.verify_token.as_deref() == Some(state.verify_token.as_str())
    {
        tracing::info!("WhatsApp webhook verified");
        return query.challenge.ok_or(StatusCode::BAD_REQUEST);
    }
    Err(StatusCode::FORBIDDEN)
}

/// POST /webhook：解析消息后立即返回 200，媒体下载在后台完成
async fn webhook_receive(
    State(state): State<Arc<WhatsappState>>,
    Json(payload): Json<WebhookPayload>,
) -> StatusCode {
    for (user_name, msg) in extract_messages(payload) {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            match build_message(&state, user_name, msg).await {
                Some(message) => {
                    tracing::info!(session_key = %message.session_key, "WhatsApp webhook: accepted message");
                    if let Some(handler) = state.handler.read().await.as_ref() {
                        if handler.send(message).is_err() {
                            tracing::warn!("WhatsApp webhook: engine is no longer receiving messages");
                        }
                    }
                }
                None => tracing::debug!("WhatsApp webhook: message ignored"),
            }
        });
    }
    StatusCode::OK
}

fn extract_messages(payload: WebhookPayload) -> Vec<(String, WebhookMessage)> {
    let mut out = Vec::new();
    for entry in payload.entry.unwrap_or_default() {
        for change in entry.changes.unwrap_or_default() {
            let Some(value) = change.value else { continue };
            let contacts = value.contacts.unwrap_or_default();
            for msg in value.messages.unwrap_or_default() {
                let name = contacts
                    .iter()
                    .find(|c| c.wa_id.as_deref() == Some(msg.from.as_str()))
                    .and_then(|c| c.profile.as_ref())
                    .and_then(|p| p.name.clone())
                    .unwrap_or_default();
                out.push((name, msg));
            }
        }
    }
    out
}

/// 下载 Graph API 媒体：先取下载地址，再带 token 取内容
async fn download_media(
    state: &WhatsappState,
    media_id: &str,
) -> Result<(String, Vec<u8>), PlatformError> {
    let info: MediaInfo = state
        .client
        .get(format!("{}/{}", GRAPH_API, media_id))
        .bearer_auth(&state.access_token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let data = state
        .client
        .get(&info.url)
        .bearer_auth(&state.access_token)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    Ok((
        info.mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
        data.to_vec(),
    ))
}

async fn build_message(
    state: &WhatsappState,
    user_name: String,
    msg: WebhookMessage,
) -> Option<Message> {
    let mut message = Message {
        session_key: format!("{}:{}", NAME, msg.from),
        platform: NAME.to_string(),
        user_id: msg.from.clone(),
        user_name,
        content: String::new(),
        images: Vec::new(),
        audio: None,
        reply_ctx: ReplyContext {
            chat_id: msg.from.clone(),
            message_id: msg.id.clone(),
        },
    };
    match msg.msg_type.as_deref() {
        Some("text") => message.content = msg.text?.body.trim().to_string(),
        Some("image") => {
            let media = msg.image?;
            match download_media(state, &media.id).await {
                Ok((mime, data)) => message.images.push(ImageAttachment {
                    mime_type: media.mime_type.unwrap_or(mime),
                    data,
                    file_name: None,
                }),
                Err(e) => {
                    tracing::warn!("WhatsApp: failed to download image {}: {}", media.id, e);
                    return None;
                }
            }
            message.content = media.caption.unwrap_or_default();
        }
        Some("audio") => {
            let media = msg.audio?;
            match download_media(state, &media.id).await {
                Ok((mime, data)) => {
                    message.audio = Some(AudioAttachment {
                        mime_type: media.mime_type.unwrap_or(mime),
                        data,
                        duration_secs: None,
                    })
                }
                Err(e) => {
                    tracing::warn!("WhatsApp: failed to download audio {}: {}", media.id, e);
                    return None;
                }
            }
        }
        other => {
            tracing::info!("WhatsApp: message type {:?} not supported, ignoring", other);
            return None;
        }
    }
    if message.content.is_empty() && message.images.is_empty() && message.audio.is_none() {
        return None;
    }
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_messages_with_contact_name() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "1", "changes": [{"field": "messages", "value": {
                "messaging_product": "whatsapp",
                "contacts": [{"profile": {"name": "Alice"}, "wa_id": "15550001"}],
                "messages": [{"from": "15550001", "id": "wamid.1", "type": "text", "text": {"body": "hi"}}]
            }}]}]
        }))
        .unwrap();
        let messages = extract_messages(payload);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "Alice");
        assert_eq!(messages[0].1.from, "15550001");
    }

    #[tokio::test]
    async fn test_build_text_message() {
        let platform = WhatsAppPlatform::new(WhatsappSection::default());
        let msg: WebhookMessage = serde_json::from_value(json!({
            "from": "15550001", "id": "wamid.2", "type": "text", "text": {"body": "  run tests  "}
        }))
        .unwrap();
        let message = build_message(&platform.state, "Alice".to_string(), msg)
            .await
            .unwrap();
        assert_eq!(message.session_key, "whatsapp:15550001");
        assert_eq!(message.content, "run tests");
        assert_eq!(message.reply_ctx.message_id.as_deref(), Some("wamid.2"));
    }

    #[tokio::test]
    async fn test_unsupported_type_ignored() {
        let platform = WhatsAppPlatform::new(WhatsappSection::default());
        let msg: WebhookMessage = serde_json::from_value(json!({
            "from": "15550001", "type": "sticker"
        }))
        .unwrap();
        assert!(build_message(&platform.state, String::new(), msg).await.is_none());
    }

    #[test]
    fn test_reply_carries_context() {
        let req = SendMessageRequest {
            messaging_product: "whatsapp",
            to: "15550001".to_string(),
            msg_type: "text",
            text: SendMessageText { body: "ok" },
            context: Some(SendContext { message_id: "wamid.3" }),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["context"]["message_id"], "wamid.3");
        assert_eq!(value["text"]["body"], "ok");
    }
}
