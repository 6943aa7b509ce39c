//! 请求调度器
//!
//! 单一后端同时只执行一个任务，其余按公平规则排队：
//! - 默认取队首
//! - 若队列多于一项且队首与上一个执行者是同一请求者，改取第一个其他请求者的条目（没有则仍取队首）
//!
//! 队列与"当前"槽位只由调度器持有。任务的错误和 panic 在这里兜底记录，
//! 队列总会继续排空。

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::models::RequesterId;

type TaskFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, RelayResult<()>> + Send>;
type RemovedHook = Box<dyn FnOnce() + Send>;

/// 一条排队中的请求
pub struct QueueEntry {
    id: Uuid,
    requester_id: RequesterId,
    model: String,
    enqueued_at: DateTime<Utc>,
    abort: CancellationToken,
    task: TaskFn,
    on_removed: Option<RemovedHook>,
}

impl QueueEntry {
    pub fn new<F, Fut>(requester_id: RequesterId, model: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = RelayResult<()>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            requester_id,
            model: model.into(),
            enqueued_at: Utc::now(),
            abort: CancellationToken::new(),
            task: Box::new(move |token| task(token).boxed()),
            on_removed: None,
        }
    }

    /// 条目未执行就被移出队列时调用（取消或清理）
    pub fn with_on_removed(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_removed = Some(Box::new(hook));
        self
    }

    fn notify_removed(self) {
        if let Some(hook) = self.on_removed {
            hook();
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn requester_id(&self) -> RequesterId {
        self.requester_id
    }

    /// 中止句柄，与任务收到的 token 是同一个
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    fn summary(&self, now: DateTime<Utc>) -> EntrySummary {
        EntrySummary {
            task_id: self.id,
            requester_id: self.requester_id,
            model: self.model.clone(),
            enqueued_at: self.enqueued_at,
            waited_seconds: (now - self.enqueued_at).num_seconds().max(0),
        }
    }
}

struct CurrentEntry {
    id: Uuid,
    requester_id: RequesterId,
    model: String,
    enqueued_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    abort: CancellationToken,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SchedulerCounters {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct SchedulerInner {
    queue: VecDeque<QueueEntry>,
    current: Option<CurrentEntry>,
    previous_requester: Option<RequesterId>,
    counters: SchedulerCounters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    StoppedRunning { task_id: Uuid, model: String },
    RemovedQueued { task_id: Uuid, model: String },
    Nothing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// 被停止的运行中任务所用模型
    pub stopped_running: Option<String>,
    pub removed_queued: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntrySummary {
    pub task_id: Uuid,
    pub requester_id: RequesterId,
    pub model: String,
    pub enqueued_at: DateTime<Utc>,
    /// 排队中为等待时长，运行中为已运行时长
    pub waited_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub current: Option<EntrySummary>,
    pub pending: Vec<EntrySummary>,
    pub counters: SchedulerCounters,
}

pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    max_user_queue_size: usize,
}

impl Scheduler {
    pub fn new(max_user_queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SchedulerInner::default()),
            max_user_queue_size: max_user_queue_size.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(|p| {
            error!("[Scheduler] state mutex poisoned, recovering");
            p.into_inner()
        })
    }

    /// 入队；空闲时立即派发并返回 0，否则返回 1 起的排队位置
    pub fn enqueue(self: &Arc<Self>, entry: QueueEntry) -> RelayResult<usize> {
        let mut inner = self.lock();
        let pending = inner
            .queue
            .iter()
            .filter(|e| e.requester_id == entry.requester_id)
            .count();
        if pending >= self.max_user_queue_size {
            inner.counters.rejected += 1;
            info!(
                "[Scheduler] rejected request from {}: {} already pending",
                entry.requester_id, pending
            );
            return Err(RelayError::AdmissionRejected {
                requester: entry.requester_id,
                pending,
            });
        }

        debug!(
            "[Scheduler] enqueue task {} (requester {}, model {})",
            entry.id, entry.requester_id, entry.model
        );
        inner.queue.push_back(entry);

        if inner.current.is_some() {
            return Ok(inner.queue.len());
        }
        match Self::take_next(&mut inner) {
            Some(next) => {
                drop(inner);
                self.spawn_driver(next);
                Ok(0)
            }
            None => Ok(inner.queue.len()),
        }
    }

    /// 取消请求者的任务：优先停止运行中的，其次移除第一个排队的
    pub fn cancel(&self, requester_id: RequesterId) -> CancelOutcome {
        let mut inner = self.lock();
        if let Some(current) = inner.current.as_ref().filter(|c| c.requester_id == requester_id) {
            current.abort.cancel();
            let outcome = CancelOutcome::StoppedRunning {
                task_id: current.id,
                model: current.model.clone(),
            };
            inner.counters.cancelled += 1;
            info!("[Scheduler] stopping running task of {}", requester_id);
            return outcome;
        }

        let removed = inner
            .queue
            .iter()
            .position(|e| e.requester_id == requester_id)
            .and_then(|pos| inner.queue.remove(pos));
        let Some(entry) = removed else {
            return CancelOutcome::Nothing;
        };
        entry.abort.cancel();
        inner.counters.cancelled += 1;
        drop(inner);

        info!("[Scheduler] removed queued task {} of {}", entry.id, requester_id);
        let outcome = CancelOutcome::RemovedQueued {
            task_id: entry.id,
            model: entry.model.clone(),
        };
        entry.notify_removed();
        outcome
    }

    /// 停止请求者的运行中任务并移除其全部排队条目
    pub fn purge(&self, requester_id: RequesterId) -> PurgeReport {
        let mut inner = self.lock();
        let mut report = PurgeReport::default();

        if let Some(current) = inner.current.as_ref().filter(|c| c.requester_id == requester_id) {
            current.abort.cancel();
            report.stopped_running = Some(current.model.clone());
        }

        let (removed, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut inner.queue)
            .into_iter()
            .partition(|e| e.requester_id == requester_id);
        inner.queue = kept;
        report.removed_queued = removed.len();
        inner.counters.cancelled +=
            report.removed_queued as u64 + u64::from(report.stopped_running.is_some());
        drop(inner);

        for entry in removed {
            entry.abort.cancel();
            entry.notify_removed();
        }

        info!(
            "[Scheduler] purged requester {}: running={}, queued={}",
            requester_id,
            report.stopped_running.is_some(),
            report.removed_queued
        );
        report
    }

    pub fn inspect(&self) -> QueueSnapshot {
        let inner = self.lock();
        let now = Utc::now();
        QueueSnapshot {
            current: inner.current.as_ref().map(|c| EntrySummary {
                task_id: c.id,
                requester_id: c.requester_id,
                model: c.model.clone(),
                enqueued_at: c.enqueued_at,
                waited_seconds: (now - c.started_at).num_seconds().max(0),
            }),
            pending: inner.queue.iter().map(|e| e.summary(now)).collect(),
            counters: inner.counters,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn export_prometheus_metrics(&self) -> String {
        let inner = self.lock();
        let c = inner.counters;
        let mut metrics = String::new();

        metrics.push_str("# HELP relay_queue_pending Requests waiting in the queue\n");
        metrics.push_str("# TYPE relay_queue_pending gauge\n");
        metrics.push_str(&format!("relay_queue_pending {}\n", inner.queue.len()));
        metrics.push_str("# HELP relay_queue_busy Whether a request is currently executing\n");
        metrics.push_str("# TYPE relay_queue_busy gauge\n");
        metrics.push_str(&format!("relay_queue_busy {}\n", u8::from(inner.current.is_some())));
        metrics.push_str("# HELP relay_tasks_total Scheduler task outcomes\n");
        metrics.push_str("# TYPE relay_tasks_total counter\n");
        for (outcome, value) in [
            ("dispatched", c.dispatched),
            ("completed", c.completed),
            ("failed", c.failed),
            ("panicked", c.panicked),
            ("rejected", c.rejected),
            ("cancelled", c.cancelled),
        ] {
            metrics.push_str(&format!("relay_tasks_total{{outcome=\"{}\"}} {}\n", outcome, value));
        }
        metrics
    }

    /// 按公平规则取出下一项并占用当前槽位
    fn take_next(inner: &mut SchedulerInner) -> Option<QueueEntry> {
        let first = inner.queue.front()?;
        let mut index = 0;
        if inner.queue.len() > 1 && inner.previous_requester == Some(first.requester_id) {
            if let Some(other) = inner
                .queue
                .iter()
                .position(|e| Some(e.requester_id) != inner.previous_requester)
            {
                index = other;
            }
        }

        let entry = inner.queue.remove(index)?;
        inner.current = Some(CurrentEntry {
            id: entry.id,
            requester_id: entry.requester_id,
            model: entry.model.clone(),
            enqueued_at: entry.enqueued_at,
            started_at: Utc::now(),
            abort: entry.abort.clone(),
        });
        inner.previous_requester = Some(entry.requester_id);
        inner.counters.dispatched += 1;
        Some(entry)
    }

    fn spawn_driver(self: &Arc<Self>, first: QueueEntry) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(entry) = next {
                this.run_entry(entry).await;
                next = {
                    let mut inner = this.lock();
                    inner.current = None;
                    Self::take_next(&mut inner)
                };
            }
            debug!("[Scheduler] queue drained, idle");
        });
    }

    async fn run_entry(&self, entry: QueueEntry) {
        let QueueEntry {
            id,
            requester_id,
            model,
            abort,
            task,
            ..
        } = entry;
        info!(
            "[Scheduler] dispatch task {} (requester {}, model {})",
            id, requester_id, model
        );

        let outcome = AssertUnwindSafe(task(abort)).catch_unwind().await;

        let mut inner = self.lock();
        match outcome {
            Ok(Ok(())) => {
                inner.counters.completed += 1;
                debug!("[Scheduler] task {} completed", id);
            }
            Ok(Err(RelayError::Cancelled)) => {
                debug!("[Scheduler] task {} cancelled", id);
            }
            Ok(Err(e)) => {
                inner.counters.failed += 1;
                warn!("[Scheduler] task {} failed [{}]: {}", id, e.code(), e);
            }
            Err(panic) => {
                inner.counters.panicked += 1;
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("[Scheduler] task {} panicked: {}", id, reason);
            }
        }
    }
}
