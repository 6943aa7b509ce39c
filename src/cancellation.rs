//! 取消控制
//!
//! 普通请求者只能取消自己的任务；管理员可以对任意请求者执行清理：
//! 停止其运行中的任务并移除全部排队条目。确认消息按请求者语言发送。

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::OllamaClient;
use crate::channel::ChatChannel;
use crate::i18n::Localizer;
use crate::models::{ChatId, RequesterId};
use crate::scheduler::{CancelOutcome, PurgeReport, Scheduler};

pub struct CancellationController {
    scheduler: Arc<Scheduler>,
    backend: Arc<OllamaClient>,
    channel: Arc<dyn ChatChannel>,
    localizer: Arc<Localizer>,
    operators: HashSet<RequesterId>,
}

impl CancellationController {
    pub fn new(
        scheduler: Arc<Scheduler>,
        backend: Arc<OllamaClient>,
        channel: Arc<dyn ChatChannel>,
        localizer: Arc<Localizer>,
        operators: impl IntoIterator<Item = RequesterId>,
    ) -> Self {
        Self {
            scheduler,
            backend,
            channel,
            localizer,
            operators: operators.into_iter().collect(),
        }
    }

    pub fn is_operator(&self, requester: RequesterId) -> bool {
        self.operators.contains(&requester)
    }

    /// 取消请求者自己的任务并回复确认
    pub async fn cancel(
        &self,
        requester: RequesterId,
        chat_id: ChatId,
        locale: Option<&str>,
    ) -> CancelOutcome {
        let outcome = self.scheduler.cancel(requester);
        let key = match &outcome {
            CancelOutcome::StoppedRunning { model, .. } => {
                self.release_model(model).await;
                "cancel.stopped_running"
            }
            CancelOutcome::RemovedQueued { .. } => "cancel.removed_queued",
            CancelOutcome::Nothing => "cancel.nothing",
        };
        self.confirm(chat_id, self.localizer.text(locale, key)).await;
        outcome
    }

    /// 管理员清理目标请求者；非管理员调用返回 `None` 并收到拒绝消息
    pub async fn purge_requester(
        &self,
        operator: RequesterId,
        target: RequesterId,
        chat_id: ChatId,
        locale: Option<&str>,
    ) -> Option<PurgeReport> {
        if !self.is_operator(operator) {
            warn!(
                "[Cancellation] {} tried to purge {} without operator rights",
                operator, target
            );
            self.confirm(chat_id, self.localizer.text(locale, "cmd.not_operator"))
                .await;
            return None;
        }

        let report = self.stop_all(target).await;
        info!(
            "[Cancellation] operator {} purged {}: {:?}",
            operator, target, report
        );

        let running = if report.stopped_running.is_some() { "1" } else { "0" };
        let text = self.localizer.format(
            locale,
            "cancel.operator_report",
            &[
                ("user", target.to_string().as_str()),
                ("running", running),
                ("queued", report.removed_queued.to_string().as_str()),
            ],
        );
        self.confirm(chat_id, text).await;
        Some(report)
    }

    /// 停止请求者的全部工作，不发送确认；运行中的任务会释放模型
    pub async fn stop_all(&self, target: RequesterId) -> PurgeReport {
        let report = self.scheduler.purge(target);
        if let Some(model) = &report.stopped_running {
            self.release_model(model).await;
        }
        report
    }

    /// 让后端释放模型占用的资源
    async fn release_model(&self, model: &str) {
        if let Err(e) = self.backend.unload(model).await {
            warn!("[Cancellation] failed to release model {}: {}", model, e);
        }
    }

    async fn confirm(&self, chat_id: ChatId, text: String) {
        if let Err(e) = self.channel.send_message(chat_id, &text, None).await {
            warn!("[Cancellation] confirmation to {} failed: {}", chat_id, e);
        }
    }
}
