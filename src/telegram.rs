//! Telegram Bot API 通道
//!
//! 实现 [`ChatChannel`]（sendMessage / editMessageText），并提供 getUpdates 长轮询。
//! API 错误按描述映射：429 → 限流（取 `parameters.retry_after`），
//! "can't parse entities" → 格式错误，"message is not modified" → 未修改。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::ChatChannel;
use crate::error::{ChannelError, RelayError, RelayResult};
use crate::models::{ChatId, IncomingMessage, MessageId, MessageTarget, ParseMode};

const LONG_POLL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: MessageId,
    pub chat: TgChat,
    #[serde(default)]
    pub from: Option<TgUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TgMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: ChatId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub language_code: Option<String>,
}

impl TgMessage {
    /// 只接收有文本、有发送者的消息
    pub fn into_incoming(self) -> Option<IncomingMessage> {
        let from = self.from?;
        let text = self.text?;
        Some(IncomingMessage {
            chat_id: self.chat.id,
            message_id: self.message_id,
            user_id: from.id,
            text,
            language_code: from.language_code,
            reply_to_text: self.reply_to_message.and_then(|m| m.text),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: MessageId,
}

/// 按 Telegram 返回的错误码与描述映射通道错误
fn map_api_error(error_code: Option<u16>, description: &str, retry_after: Option<u64>) -> ChannelError {
    let lower = description.to_ascii_lowercase();
    if error_code == Some(429) || retry_after.is_some() {
        return ChannelError::TooManyRequests {
            retry_after: Duration::from_secs(retry_after.unwrap_or(1)),
        };
    }
    if lower.contains("message is not modified") {
        return ChannelError::MessageNotModified;
    }
    if lower.contains("can't parse entities") || lower.contains("can't find end of the entity") {
        return ChannelError::CantParseEntities(description.to_string());
    }
    ChannelError::Other(format!(
        "telegram error {}: {}",
        error_code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
        description
    ))
}

pub struct TelegramChannel {
    client: Client,
    base_url: String,
}

impl TelegramChannel {
    pub fn new(api_base: &str, token: &str) -> RelayResult<Self> {
        if token.trim().is_empty() {
            return Err(RelayError::Config("telegram token is empty".into()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(LONG_POLL_SECS + 15))
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token.trim()),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, ChannelError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        let parsed: ApiResponse<T> = serde_json::from_str(&text).map_err(|e| {
            ChannelError::Other(format!("{} returned {} with unreadable body: {}", method, status, e))
        })?;

        if parsed.ok {
            return parsed
                .result
                .ok_or_else(|| ChannelError::Other(format!("{} returned no result", method)));
        }
        let description = parsed.description.unwrap_or_default();
        let retry_after = parsed.parameters.and_then(|p| p.retry_after);
        let code = parsed.error_code.or(Some(status.as_u16()));
        debug!("[Telegram] {} failed: {:?} {}", method, code, description);
        Err(map_api_error(code, &description, retry_after))
    }

    pub async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> Result<Vec<Update>, ChannelError> {
        let mut body = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", body).await
    }
}

#[async_trait]
impl ChatChannel for TelegramChannel {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<MessageId, ChannelError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode.as_str());
        }
        let sent: SentMessage = self.call("sendMessage", body).await?;
        Ok(sent.message_id)
    }

    async fn edit_message_text(
        &self,
        target: MessageTarget,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({
            "chat_id": target.chat_id,
            "message_id": target.message_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode.as_str());
        }
        // 成功时 result 为消息对象（内联消息为 true），内容不需要
        let _: Value = self.call("editMessageText", body).await?;
        Ok(())
    }
}

/// 入站消息处理方
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage);
}

/// 长轮询 getUpdates，直到 `shutdown` 被触发
pub async fn run_polling(
    channel: Arc<TelegramChannel>,
    handler: Arc<dyn UpdateHandler>,
    shutdown: CancellationToken,
) {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(8);
    let mut offset: Option<i64> = None;
    info!("[Telegram] polling for updates");

    loop {
        let poll = (|| async { channel.get_updates(offset, LONG_POLL_SECS).await })
            .retry(&backoff)
            .notify(|e, wait| warn!("[Telegram] getUpdates failed ({}), retrying in {:?}", e, wait));

        let updates = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = poll => r,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                error!("[Telegram] getUpdates keeps failing: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(30)) => continue,
                }
            }
        };

        for update in updates {
            offset = Some(update.update_id + 1);
            let Some(message) = update.message.and_then(TgMessage::into_incoming) else {
                continue;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler.handle(message).await;
            });
        }
    }
    info!("[Telegram] polling stopped");
}
