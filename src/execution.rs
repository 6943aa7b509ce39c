//! 单次生成任务
//!
//! 调度器派发后执行：请求后端流式生成，交给 [`StreamConsumer`] 解析，
//! 再通过 [`OutboundRenderer`] 推送。后端错误都在任务内部转成一次最终渲染，
//! 只有用户取消会以 [`RelayError::Cancelled`] 返回给调度器。
//!
//! 终止状态：
//! - 完成：最终渲染完整回复 + 完成标记，写入回复用量
//! - 用户取消：丢弃未投递的渲染，不留痕迹
//! - 超时：最终渲染已有内容 + 超时后缀，并要求后端卸载模型
//! - 模型不存在：提示下载，调用一次 pull，最终渲染"模型就绪"或下载失败
//! - 其他错误：脱敏后最终渲染一次

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{GenerateRequest, OllamaClient};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::i18n::Localizer;
use crate::models::{MessageTarget, RequesterId, ThinkingMode, UsageDelta, UserPreferences};
use crate::renderer::{OutboundRenderer, RenderOptions};
use crate::stream_consumer::{FragmentOutcome, StreamConsumer};
use crate::usage::{UsagePhase, UsageRecorder, UserStore};
use crate::utils::text::{char_len, sanitize_error_message};

const ERROR_MESSAGE_MAX_CHARS: usize = 300;

/// 执行相关的全局设置
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub default_model: String,
    pub default_temperature: f32,
    pub hard_ceiling: Duration,
    pub unload_below_billion_params: f64,
    pub warm_keep_alive: String,
    pub push_threshold_chars: usize,
}

impl From<&RelayConfig> for ExecutionSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            default_temperature: config.default_temperature,
            hard_ceiling: config.hard_execution_ceiling(),
            unload_below_billion_params: config.unload_below_billion_params,
            warm_keep_alive: config.warm_keep_alive.clone(),
            push_threshold_chars: config.push_threshold_chars,
        }
    }
}

/// 任务共享的协作方
pub struct ExecutionContext {
    pub backend: Arc<OllamaClient>,
    pub renderer: Arc<OutboundRenderer>,
    pub store: Arc<dyn UserStore>,
    pub localizer: Arc<Localizer>,
    pub settings: ExecutionSettings,
}

/// 拼接提示词：意图前言、被回复消息、用户文本
pub fn build_prompt(preamble: Option<&str>, reply_context: Option<&str>, text: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(preamble) = preamble.map(str::trim).filter(|p| !p.is_empty()) {
        parts.push(preamble.to_string());
    }
    if let Some(context) = reply_context.map(str::trim).filter(|c| !c.is_empty()) {
        let quoted = context
            .lines()
            .map(|l| format!("> {}", l))
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(quoted);
    }
    parts.push(text.trim().to_string());
    parts.join("\n\n")
}

/// 流结束的原因
enum StreamEnd {
    Completed,
    Failed(RelayError),
}

#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub requester_id: RequesterId,
    pub target: MessageTarget,
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    /// `None` 使用全局硬上限
    pub max_duration: Option<Duration>,
    pub thinking_mode: ThinkingMode,
    pub locale: Option<String>,
}

impl ExecutionTask {
    /// 按"固定模型 → 请求者模型 → 全局默认"选择模型
    pub fn from_preferences(
        requester_id: RequesterId,
        target: MessageTarget,
        model_pin: Option<&str>,
        prompt: String,
        prefs: &UserPreferences,
        settings: &ExecutionSettings,
    ) -> Self {
        let model = model_pin
            .map(str::to_string)
            .or_else(|| prefs.custom_model.clone())
            .unwrap_or_else(|| settings.default_model.clone());
        Self {
            requester_id,
            target,
            model,
            prompt,
            temperature: prefs.temperature.unwrap_or(settings.default_temperature),
            max_duration: (prefs.max_execution_seconds > 0)
                .then(|| Duration::from_secs(prefs.max_execution_seconds)),
            thinking_mode: ThinkingMode::from_flag(prefs.show_thinking),
            locale: prefs.locale.clone(),
        }
    }

    /// 实际时限，不超过硬上限
    pub fn time_limit(&self, hard_ceiling: Duration) -> Duration {
        self.max_duration
            .map(|d| d.min(hard_ceiling))
            .unwrap_or(hard_ceiling)
    }

    pub async fn run(self, ctx: Arc<ExecutionContext>, abort: CancellationToken) -> RelayResult<()> {
        let l10n = &ctx.localizer;
        let locale = self.locale.as_deref();
        let limit = self.time_limit(ctx.settings.hard_ceiling);
        let deadline = Instant::now() + limit;
        let mut usage = UsageRecorder::new(Arc::clone(&ctx.store), self.requester_id);

        info!(
            "[Execution] start requester={} model={} limit={:?}",
            self.requester_id, self.model, limit
        );
        ctx.renderer.render(
            self.target,
            l10n.format(locale, "exec.generating", &[("model", self.model.as_str())]),
            RenderOptions::interim(),
        );

        usage
            .flush(
                UsagePhase::Submission,
                UsageDelta {
                    characters: char_len(&self.prompt) as u64,
                    requests: 1,
                },
            )
            .await;

        let mut consumer = StreamConsumer::new(
            self.thinking_mode,
            l10n.thinking_labels(locale),
            ctx.settings.push_threshold_chars,
        );

        let end = self
            .consume(&ctx, &abort, deadline, limit, &mut consumer)
            .await;

        match end {
            StreamEnd::Completed => {
                let body = consumer.finish();
                let body = if body.trim().is_empty() {
                    l10n.text(locale, "exec.empty_response")
                } else {
                    body
                };
                let footer = l10n.format(locale, "exec.complete", &[("model", self.model.as_str())]);
                ctx.renderer.render(
                    self.target,
                    format!("{}\n\n{}", body, footer),
                    RenderOptions::final_render(),
                );
                self.flush_response_usage(&mut usage, &consumer).await;
                info!(
                    "[Execution] completed requester={} chars={}",
                    self.requester_id,
                    consumer.response_chars()
                );
                Ok(())
            }
            StreamEnd::Failed(RelayError::Cancelled) => {
                ctx.renderer.discard(self.target);
                info!("[Execution] cancelled by requester {}", self.requester_id);
                Err(RelayError::Cancelled)
            }
            StreamEnd::Failed(RelayError::ExecutionTimeout(after)) => {
                let partial = consumer.finish();
                let suffix = l10n.format(
                    locale,
                    "exec.timeout_suffix",
                    &[("seconds", after.as_secs().to_string().as_str())],
                );
                let text = if partial.trim().is_empty() {
                    suffix
                } else {
                    format!("{}\n\n{}", partial, suffix)
                };
                ctx.renderer
                    .render(self.target, text, RenderOptions::final_render());
                self.flush_response_usage(&mut usage, &consumer).await;
                warn!(
                    "[Execution] timeout after {:?} (requester {}), unloading {}",
                    after, self.requester_id, self.model
                );
                if let Err(e) = ctx.backend.unload(&self.model).await {
                    warn!("[Execution] unload {} failed: {}", self.model, e);
                }
                Ok(())
            }
            StreamEnd::Failed(RelayError::ModelNotFound(detail)) => {
                debug!("[Execution] model not found: {}", detail);
                self.recover_missing_model(&ctx, &abort).await
            }
            StreamEnd::Failed(e) => {
                warn!("[Execution] backend error [{}]: {}", e.code(), e);
                let detail = sanitize_error_message(&e.to_string(), ERROR_MESSAGE_MAX_CHARS);
                ctx.renderer.render(
                    self.target,
                    l10n.format(locale, "exec.error", &[("error", detail.as_str())]),
                    RenderOptions::final_render(),
                );
                self.flush_response_usage(&mut usage, &consumer).await;
                Ok(())
            }
        }
    }

    async fn consume(
        &self,
        ctx: &ExecutionContext,
        abort: &CancellationToken,
        deadline: Instant,
        limit: Duration,
        consumer: &mut StreamConsumer,
    ) -> StreamEnd {
        // 参数量查询同样受取消和时限约束
        let keep_alive = tokio::select! {
            biased;
            _ = abort.cancelled() => return StreamEnd::Failed(RelayError::Cancelled),
            _ = sleep_until(deadline) => return StreamEnd::Failed(RelayError::ExecutionTimeout(limit)),
            k = ctx.backend.keep_alive_for(
                &self.model,
                ctx.settings.unload_below_billion_params,
                &ctx.settings.warm_keep_alive,
            ) => k,
        };

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            temperature: self.temperature,
            keep_alive,
        };

        let started = tokio::select! {
            biased;
            _ = abort.cancelled() => return StreamEnd::Failed(RelayError::Cancelled),
            _ = sleep_until(deadline) => return StreamEnd::Failed(RelayError::ExecutionTimeout(limit)),
            r = ctx.backend.generate_stream(&request) => r,
        };
        let mut lines = match started {
            Ok(lines) => lines,
            Err(e) => return StreamEnd::Failed(e),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => return StreamEnd::Failed(RelayError::Cancelled),
                _ = sleep_until(deadline) => return StreamEnd::Failed(RelayError::ExecutionTimeout(limit)),
                line = lines.next_line() => line,
            };
            match next {
                None => return StreamEnd::Completed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(line)) => match consumer.handle_line(&line) {
                    FragmentOutcome::Push(text) => {
                        ctx.renderer
                            .render(self.target, text, RenderOptions::interim());
                    }
                    FragmentOutcome::Skip => {}
                    FragmentOutcome::Done => return StreamEnd::Completed,
                    FragmentOutcome::Error(e) => return StreamEnd::Failed(e),
                },
            }
        }
    }

    async fn recover_missing_model(
        &self,
        ctx: &ExecutionContext,
        abort: &CancellationToken,
    ) -> RelayResult<()> {
        let l10n = &ctx.localizer;
        let locale = self.locale.as_deref();
        let model = [("model", self.model.as_str())];

        ctx.renderer.render(
            self.target,
            l10n.format(locale, "exec.model_pulling", &model),
            RenderOptions::interim(),
        );

        let pulled = tokio::select! {
            _ = abort.cancelled() => {
                ctx.renderer.discard(self.target);
                return Err(RelayError::Cancelled);
            }
            r = ctx.backend.pull(&self.model) => r,
        };

        let text = match pulled {
            Ok(()) => l10n.format(locale, "exec.model_ready", &model),
            Err(e) => {
                warn!("[Execution] pull {} failed: {}", self.model, e);
                let detail = sanitize_error_message(&e.to_string(), ERROR_MESSAGE_MAX_CHARS);
                l10n.format(
                    locale,
                    "exec.model_pull_failed",
                    &[("model", self.model.as_str()), ("error", detail.as_str())],
                )
            }
        };
        ctx.renderer
            .render(self.target, text, RenderOptions::final_render());
        Ok(())
    }

    async fn flush_response_usage(&self, usage: &mut UsageRecorder, consumer: &StreamConsumer) {
        usage
            .flush(
                UsagePhase::Completion,
                UsageDelta {
                    characters: consumer.response_chars() as u64,
                    requests: 0,
                },
            )
            .await;
    }
}
