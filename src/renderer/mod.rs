//! 出站消息渲染器
//!
//! 把流式文本推送到一条持续编辑的聊天消息上，并遵守平台限流：
//! - 每条消息的 render 调用相互合并，最后写入者胜出
//! - 同一条消息两次编辑之间至少间隔 `min_interval`，未到时只保留一个延迟重试
//! - 收到 429 后设置全局截止时间，所有消息在此之前都不编辑
//! - 超过安全长度的文本逐行切块，第一块编辑原消息，之后每块各占一条溢出消息
//! - 格式解析失败时去掉格式重试一次；"内容未修改"视为成功
//!
//! `render` 从不返回错误，投递失败只记录日志。

pub mod chunking;
pub mod delayed;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::ChatChannel;
use crate::error::ChannelError;
use crate::models::{MessageId, MessageTarget, ParseMode};
use crate::utils::text::char_len;

pub use chunking::split_into_chunks;
pub use delayed::DelayedTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderOptions {
    pub parse_mode: Option<ParseMode>,
    /// 最终渲染：投递后释放该消息的渲染状态
    pub is_final: bool,
}

impl RenderOptions {
    pub fn interim() -> Self {
        Self::default()
    }

    pub fn final_render() -> Self {
        Self {
            parse_mode: None,
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RendererConfig {
    pub min_interval: Duration,
    pub safe_length: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            safe_length: 3500,
        }
    }
}

/// 单条消息的渲染状态
#[derive(Debug, Default)]
struct RenderState {
    pending_text: Option<String>,
    pending_options: RenderOptions,
    last_edit_at: Option<Instant>,
    scheduled_retry: Option<DelayedTask>,
    /// 第 i 个溢出块对应的消息
    overflow_message_ids: Vec<MessageId>,
    in_flight: bool,
}

/// 一次投递的结果
enum Delivery {
    Delivered,
    RateLimited(Duration),
    Failed(ChannelError),
}

pub struct OutboundRenderer {
    channel: Arc<dyn ChatChannel>,
    config: RendererConfig,
    states: DashMap<MessageTarget, RenderState>,
    rate_limited_until: Mutex<Option<Instant>>,
}

impl OutboundRenderer {
    pub fn new(channel: Arc<dyn ChatChannel>, config: RendererConfig) -> Arc<Self> {
        Arc::new(Self {
            channel,
            config,
            states: DashMap::new(),
            rate_limited_until: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &Arc<dyn ChatChannel> {
        &self.channel
    }

    /// 提交一次渲染，立即返回
    pub fn render(self: &Arc<Self>, target: MessageTarget, text: impl Into<String>, options: RenderOptions) {
        {
            let mut state = self.states.entry(target).or_default();
            state.pending_text = Some(text.into());
            state.pending_options = options;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.process_update(target).await;
        });
    }

    /// 丢弃该消息尚未投递的文本并取消延迟重试
    pub fn discard(&self, target: MessageTarget) {
        if let Some((_, mut state)) = self.states.remove(&target) {
            state.pending_text = None;
            if state.scheduled_retry.take().is_some() {
                debug!("[Renderer] discarded scheduled retry for {:?}", target);
            }
        }
    }

    pub fn has_pending(&self, target: MessageTarget) -> bool {
        self.states
            .get(&target)
            .map(|s| s.pending_text.is_some())
            .unwrap_or(false)
    }

    pub fn tracked_messages(&self) -> usize {
        self.states.len()
    }

    fn rate_limit_deadline(&self) -> Option<Instant> {
        *self.rate_limited_until.lock().unwrap_or_else(|p| {
            warn!("[Renderer] rate limit mutex poisoned, recovering");
            p.into_inner()
        })
    }

    fn set_rate_limit_deadline(&self, deadline: Instant) {
        let mut guard = self.rate_limited_until.lock().unwrap_or_else(|p| p.into_inner());
        // 只会向后推迟
        if guard.map(|d| d < deadline).unwrap_or(true) {
            *guard = Some(deadline);
        }
    }

    fn schedule_retry(self: &Arc<Self>, target: MessageTarget, wait: Duration) -> DelayedTask {
        let this = Arc::clone(self);
        DelayedTask::schedule(wait, move |id| async move {
            this.fire_retry(target, id).await;
        })
    }

    async fn fire_retry(self: Arc<Self>, target: MessageTarget, id: u64) {
        {
            let Some(mut state) = self.states.get_mut(&target) else {
                return;
            };
            match state.scheduled_retry.take() {
                Some(task) if task.id() == id => task.detach(),
                other => {
                    // 已被更新的重试取代
                    state.scheduled_retry = other;
                    return;
                }
            }
        }
        self.process_update(target).await;
    }

    async fn process_update(self: Arc<Self>, target: MessageTarget) {
        loop {
            if let Some(deadline) = self.rate_limit_deadline() {
                if deadline > Instant::now() {
                    debug!("[Renderer] globally rate limited, waiting until deadline");
                    tokio::time::sleep_until(deadline).await;
                }
            }

            let (text, options, overflow_ids) = {
                let Some(mut state) = self.states.get_mut(&target) else {
                    return;
                };
                if state.in_flight {
                    return;
                }
                let Some(text) = state.pending_text.clone() else {
                    return;
                };
                if let Some(last) = state.last_edit_at {
                    let elapsed = last.elapsed();
                    if elapsed < self.config.min_interval {
                        let wait = self.config.min_interval - elapsed;
                        state.scheduled_retry = Some(self.schedule_retry(target, wait));
                        return;
                    }
                }
                state.in_flight = true;
                state.scheduled_retry = None;
                (text, state.pending_options, state.overflow_message_ids.clone())
            };

            let (outcome, overflow_ids) = self.deliver(target, &text, options.parse_mode, overflow_ids).await;

            let mut remove = false;
            {
                let Some(mut state) = self.states.get_mut(&target) else {
                    return;
                };
                state.in_flight = false;
                // 已创建的溢出消息无论成败都要记住，避免重复创建
                state.overflow_message_ids = overflow_ids;
                let unchanged = state.pending_text.as_deref() == Some(text.as_str());

                match outcome {
                    Delivery::Delivered => {
                        state.last_edit_at = Some(Instant::now());
                        if !unchanged {
                            // 投递期间又有新文本，重新走一遍
                            continue;
                        }
                        state.pending_text = None;
                        remove = options.is_final;
                    }
                    Delivery::RateLimited(retry_after) => {
                        let deadline = Instant::now() + retry_after;
                        self.set_rate_limit_deadline(deadline);
                        info!(
                            "[Renderer] rate limited for {:?}, rescheduling {:?}",
                            retry_after, target
                        );
                        state.scheduled_retry = Some(self.schedule_retry(target, retry_after));
                        return;
                    }
                    Delivery::Failed(err) => {
                        warn!("[Renderer] dropping update for {:?}: {}", target, err);
                        if !unchanged {
                            continue;
                        }
                        state.pending_text = None;
                        remove = options.is_final;
                    }
                }
            }
            if remove {
                // 释放期间若又来了新文本则保留状态
                self.states
                    .remove_if(&target, |_, s| s.pending_text.is_none() && !s.in_flight);
            }
            return;
        }
    }

    /// 投递全部分块，返回结果和更新后的溢出消息列表
    async fn deliver(
        &self,
        target: MessageTarget,
        text: &str,
        parse_mode: Option<ParseMode>,
        mut overflow_ids: Vec<MessageId>,
    ) -> (Delivery, Vec<MessageId>) {
        let chunks = split_into_chunks(text, self.config.safe_length);
        let head = chunks.first().map(String::as_str).unwrap_or("");

        if let Err(e) = self.edit_with_fallback(target, head, parse_mode).await {
            return (classify(e), overflow_ids);
        }
        if chunks.len() > 1 {
            debug!(
                "[Renderer] {} chars split into {} chunks for {:?}",
                char_len(text),
                chunks.len(),
                target
            );
        }

        for (index, chunk) in chunks.iter().enumerate().skip(1) {
            let existing = overflow_ids.get(index - 1).copied();
            let result = match existing {
                Some(message_id) => {
                    self.edit_with_fallback(MessageTarget::new(target.chat_id, message_id), chunk, parse_mode)
                        .await
                }
                None => self
                    .send_with_fallback(target, chunk, parse_mode)
                    .await
                    .map(|message_id| overflow_ids.push(message_id)),
            };
            if let Err(e) = result {
                return (classify(e), overflow_ids);
            }
        }
        (Delivery::Delivered, overflow_ids)
    }

    async fn edit_with_fallback(
        &self,
        target: MessageTarget,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<(), ChannelError> {
        let result = match self.channel.edit_message_text(target, text, parse_mode).await {
            Err(ChannelError::CantParseEntities(reason)) if parse_mode.is_some() => {
                debug!("[Renderer] parse error ({}), retrying without formatting", reason);
                self.channel.edit_message_text(target, text, None).await
            }
            other => other,
        };
        match result {
            Err(ChannelError::MessageNotModified) => Ok(()),
            other => other,
        }
    }

    async fn send_with_fallback(
        &self,
        target: MessageTarget,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<MessageId, ChannelError> {
        match self.channel.send_message(target.chat_id, text, parse_mode).await {
            Err(ChannelError::CantParseEntities(_)) if parse_mode.is_some() => {
                self.channel.send_message(target.chat_id, text, None).await
            }
            other => other,
        }
    }
}

fn classify(err: ChannelError) -> Delivery {
    match err {
        ChannelError::TooManyRequests { retry_after } => Delivery::RateLimited(retry_after),
        other => Delivery::Failed(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ChannelCallKind, RecordingChannel};

    fn setup() -> (Arc<RecordingChannel>, Arc<OutboundRenderer>) {
        let channel = Arc::new(RecordingChannel::new());
        let renderer = OutboundRenderer::new(channel.clone(), RendererConfig::default());
        (channel, renderer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_render_is_immediate() {
        let (channel, renderer) = setup();
        let target = MessageTarget::new(1, 10);
        renderer.render(target, "hello", RenderOptions::interim());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let edits = channel.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].text, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_modified_counts_as_success() {
        let (channel, renderer) = setup();
        let target = MessageTarget::new(1, 10);
        channel.fail_next_edit(ChannelError::MessageNotModified);
        renderer.render(target, "same", RenderOptions::final_render());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(renderer.tracked_messages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_error_retries_without_formatting() {
        let (channel, renderer) = setup();
        let target = MessageTarget::new(1, 10);
        channel.fail_next_edit(ChannelError::CantParseEntities("bad *".into()));
        renderer.render(
            target,
            "*oops",
            RenderOptions {
                parse_mode: Some(ParseMode::Markdown),
                is_final: false,
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        let edits = channel.edits();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].parse_mode, Some(ParseMode::Markdown));
        assert_eq!(edits[1].parse_mode, None);
        assert_eq!(edits[1].text, "*oops");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_message_created_then_edited() {
        let channel = Arc::new(RecordingChannel::new());
        let renderer = OutboundRenderer::new(
            channel.clone(),
            RendererConfig {
                min_interval: Duration::from_secs(5),
                safe_length: 10,
            },
        );
        let target = MessageTarget::new(7, 1);
        renderer.render(target, "aaaaaaaa\nbbbbbbbb", RenderOptions::interim());
        tokio::time::sleep(Duration::from_millis(10)).await;
        renderer.render(target, "aaaaaaaa\nbbbbbbbbcc", RenderOptions::interim());
        tokio::time::sleep(Duration::from_secs(6)).await;

        let calls = channel.calls();
        let sends: Vec<_> = calls.iter().filter(|c| c.kind == ChannelCallKind::Send).collect();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].text, "bbbbbbbb");
        let overflow_id = sends[0].message_id;
        let last = calls.last().unwrap();
        assert_eq!(last.kind, ChannelCallKind::Edit);
        assert_eq!(last.message_id, overflow_id);
        assert_eq!(last.text, "bbbbbbbbcc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_growing_text_adds_overflow_messages_in_order() {
        let channel = Arc::new(RecordingChannel::new());
        let renderer = OutboundRenderer::new(
            channel.clone(),
            RendererConfig {
                min_interval: Duration::from_secs(5),
                safe_length: 10,
            },
        );
        let target = MessageTarget::new(7, 1);
        renderer.render(target, "aaaaaaaa\nbbbbbbbb", RenderOptions::interim());
        tokio::time::sleep(Duration::from_millis(10)).await;
        renderer.render(target, "aaaaaaaa\nbbbbbbbb\ncccc", RenderOptions::final_render());
        tokio::time::sleep(Duration::from_secs(6)).await;

        let sends = channel.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].text, "bbbbbbbb");
        assert_eq!(sends[1].text, "cccc");
        let overflow_edits = channel.edit_texts(MessageTarget::new(7, sends[0].message_id));
        assert_eq!(overflow_edits, vec!["bbbbbbbb"]);
        assert_eq!(renderer.tracked_messages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_cancels_trailing_edit() {
        let (channel, renderer) = setup();
        let target = MessageTarget::new(1, 10);
        renderer.render(target, "one", RenderOptions::interim());
        tokio::time::sleep(Duration::from_millis(10)).await;
        renderer.render(target, "two", RenderOptions::interim());
        tokio::time::sleep(Duration::from_millis(10)).await;
        renderer.discard(target);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(channel.edits().len(), 1);
        assert!(!renderer.has_pending(target));
    }
}
