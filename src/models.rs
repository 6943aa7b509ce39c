//! 跨模块共享的数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 请求者（聊天平台用户）ID
pub type RequesterId = i64;
pub type ChatId = i64;
pub type MessageId = i64;

/// 一条可被持续编辑的聊天消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageTarget {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl MessageTarget {
    pub fn new(chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

/// 消息格式标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseMode {
    Markdown,
    Html,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Markdown => "Markdown",
            ParseMode::Html => "HTML",
        }
    }
}

/// 思维链展示方式（按请求者配置）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    /// 保留推理内容，用标签包裹
    Show,
    /// 隐藏推理内容，完成后仅保留一个"思考完成"标签
    Hide,
}

impl ThinkingMode {
    pub fn from_flag(show_thinking: bool) -> Self {
        if show_thinking {
            ThinkingMode::Show
        } else {
            ThinkingMode::Hide
        }
    }
}

/// 请求者偏好（由存储协作方提供）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub custom_model: Option<String>,
    pub temperature: Option<f32>,
    pub show_thinking: bool,
    /// 0 表示使用全局硬上限
    pub max_execution_seconds: u64,
    /// 限制截止时间，在此之前拒绝该请求者的请求
    pub timeout_until: Option<DateTime<Utc>>,
    pub locale: Option<String>,
}

impl UserPreferences {
    pub fn is_restricted_at(&self, now: DateTime<Utc>) -> bool {
        self.timeout_until.map(|until| until > now).unwrap_or(false)
    }
}

/// 单次执行累积的用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub characters: u64,
    pub requests: u64,
}

impl UsageDelta {
    pub fn is_empty(&self) -> bool {
        self.characters == 0 && self.requests == 0
    }
}

/// 聊天平台推送过来的一条文本消息
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub user_id: RequesterId,
    pub text: String,
    pub language_code: Option<String>,
    /// 被回复消息的文本，用作上下文
    pub reply_to_text: Option<String>,
}
