//! 可取消的延迟任务
//!
//! 每条消息最多持有一个待触发的重试。替换或丢弃句柄即中止旧任务；
//! 任务触发后需要先用 [`DelayedTask::detach`] 把自己从槽位中摘出，之后不会再被中止。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct DelayedTask {
    id: u64,
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    /// `delay` 之后执行 `make(id)` 生成的 future
    pub fn schedule<F, Fut>(delay: Duration, make: F) -> Self
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let fut = make(id);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        Self {
            id,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 放弃句柄但不中止任务
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
