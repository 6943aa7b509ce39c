//! 测试辅助工具
//!
//! 单元测试与 `tests/` 集成测试共用：记录所有出站调用的聊天通道、预置偏好的存储。

mod recording_channel;

pub use recording_channel::{ChannelCall, ChannelCallKind, RecordingChannel};

use std::sync::Arc;

use crate::models::{RequesterId, UserPreferences};
use crate::usage::InMemoryUserStore;

/// 构造带预置偏好的内存存储
pub fn seeded_store(users: &[(RequesterId, UserPreferences)]) -> Arc<InMemoryUserStore> {
    let store = users
        .iter()
        .fold(InMemoryUserStore::new(), |store, (id, prefs)| {
            store.with_preferences(*id, prefs.clone())
        });
    Arc::new(store)
}
