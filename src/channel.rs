//! 出站聊天通道抽象
//!
//! 渲染器、取消控制器和命令分发只依赖这个 trait，
//! 具体平台实现见 [`crate::telegram::TelegramChannel`]。

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::models::{ChatId, MessageId, MessageTarget, ParseMode};

#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// 发送新消息，返回消息 ID
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<MessageId, ChannelError>;

    /// 编辑已有消息的文本
    async fn edit_message_text(
        &self,
        target: MessageTarget,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<(), ChannelError>;
}
