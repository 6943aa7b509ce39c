//! 用量统计
//!
//! 每次执行按阶段（提交、完成）各写入一次，存储失败只记日志不影响主流程。

pub mod sqlite;
pub mod store;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::models::{RequesterId, UsageDelta};

pub use sqlite::SqliteUserStore;
pub use store::{InMemoryUserStore, PreferenceUpdate, UserStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePhase {
    /// 提示词提交
    Submission,
    /// 生成完成
    Completion,
}

pub struct UsageRecorder {
    store: Arc<dyn UserStore>,
    requester: RequesterId,
    submission_flushed: bool,
    completion_flushed: bool,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn UserStore>, requester: RequesterId) -> Self {
        Self {
            store,
            requester,
            submission_flushed: false,
            completion_flushed: false,
        }
    }

    /// 写入一个阶段的用量；同一阶段重复调用或空增量返回 false
    pub async fn flush(&mut self, phase: UsagePhase, delta: UsageDelta) -> bool {
        let flag = match phase {
            UsagePhase::Submission => &mut self.submission_flushed,
            UsagePhase::Completion => &mut self.completion_flushed,
        };
        if *flag {
            return false;
        }
        *flag = true;
        if delta.is_empty() {
            return false;
        }

        match self.store.increment_usage(self.requester, delta).await {
            Ok(()) => {
                debug!(
                    "[Usage] {:?} flushed for {}: {} chars, {} requests",
                    phase, self.requester, delta.characters, delta.requests
                );
                true
            }
            Err(e) => {
                warn!("[Usage] failed to record {:?} for {}: {}", phase, self.requester, e);
                false
            }
        }
    }
}
