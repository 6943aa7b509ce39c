use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::channel::ChatChannel;
use crate::error::ChannelError;
use crate::models::{ChatId, MessageId, MessageTarget, ParseMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCallKind {
    Send,
    Edit,
}

/// 一次出站调用（失败的调用也会记录）
#[derive(Debug, Clone)]
pub struct ChannelCall {
    pub kind: ChannelCallKind,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
    pub parse_mode: Option<ParseMode>,
    pub at: Instant,
    pub failed: bool,
}

/// 记录所有调用的内存通道，可预设下一次调用的失败
pub struct RecordingChannel {
    calls: Mutex<Vec<ChannelCall>>,
    edit_failures: Mutex<VecDeque<ChannelError>>,
    send_failures: Mutex<VecDeque<ChannelError>>,
    next_message_id: AtomicI64,
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            edit_failures: Mutex::new(VecDeque::new()),
            send_failures: Mutex::new(VecDeque::new()),
            next_message_id: AtomicI64::new(1000),
        }
    }

    pub fn fail_next_edit(&self, err: ChannelError) {
        lock(&self.edit_failures).push_back(err);
    }

    pub fn fail_next_send(&self, err: ChannelError) {
        lock(&self.send_failures).push_back(err);
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        lock(&self.calls).clone()
    }

    pub fn edits(&self) -> Vec<ChannelCall> {
        self.calls_of(ChannelCallKind::Edit)
    }

    pub fn sends(&self) -> Vec<ChannelCall> {
        self.calls_of(ChannelCallKind::Send)
    }

    /// 某条消息上成功的编辑文本，按时间顺序
    pub fn edit_texts(&self, target: MessageTarget) -> Vec<String> {
        self.edits()
            .into_iter()
            .filter(|c| !c.failed && c.chat_id == target.chat_id && c.message_id == target.message_id)
            .map(|c| c.text)
            .collect()
    }

    fn calls_of(&self, kind: ChannelCallKind) -> Vec<ChannelCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    fn record(
        &self,
        kind: ChannelCallKind,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        parse_mode: Option<ParseMode>,
        failed: bool,
    ) {
        lock(&self.calls).push(ChannelCall {
            kind,
            chat_id,
            message_id,
            text: text.to_string(),
            parse_mode,
            at: Instant::now(),
            failed,
        });
    }
}

#[async_trait]
impl ChatChannel for RecordingChannel {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<MessageId, ChannelError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let failure = lock(&self.send_failures).pop_front();
        self.record(ChannelCallKind::Send, chat_id, message_id, text, parse_mode, failure.is_some());
        match failure {
            Some(err) => Err(err),
            None => Ok(message_id),
        }
    }

    async fn edit_message_text(
        &self,
        target: MessageTarget,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<(), ChannelError> {
        let failure = lock(&self.edit_failures).pop_front();
        self.record(
            ChannelCallKind::Edit,
            target.chat_id,
            target.message_id,
            text,
            parse_mode,
            failure.is_some(),
        );
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
