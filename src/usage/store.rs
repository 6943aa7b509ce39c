//! 请求者偏好与用量存储接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::RelayResult;
use crate::models::{RequesterId, UsageDelta, UserPreferences};

/// 偏好修改
#[derive(Debug, Clone, PartialEq)]
pub enum PreferenceUpdate {
    CustomModel(Option<String>),
    Temperature(Option<f32>),
    ShowThinking(bool),
    MaxExecutionSeconds(u64),
    TimeoutUntil(Option<DateTime<Utc>>),
    Locale(Option<String>),
}

impl PreferenceUpdate {
    pub fn apply(&self, prefs: &mut UserPreferences) {
        match self {
            PreferenceUpdate::CustomModel(model) => prefs.custom_model = model.clone(),
            PreferenceUpdate::Temperature(t) => prefs.temperature = *t,
            PreferenceUpdate::ShowThinking(show) => prefs.show_thinking = *show,
            PreferenceUpdate::MaxExecutionSeconds(secs) => prefs.max_execution_seconds = *secs,
            PreferenceUpdate::TimeoutUntil(until) => prefs.timeout_until = *until,
            PreferenceUpdate::Locale(locale) => prefs.locale = locale.clone(),
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// 读取偏好，未知请求者返回默认值
    async fn preferences(&self, requester: RequesterId) -> RelayResult<UserPreferences>;

    async fn update_preferences(
        &self,
        requester: RequesterId,
        update: PreferenceUpdate,
    ) -> RelayResult<UserPreferences>;

    /// 累加用量
    async fn increment_usage(&self, requester: RequesterId, delta: UsageDelta) -> RelayResult<()>;

    /// 累计用量
    async fn usage(&self, requester: RequesterId) -> RelayResult<UsageDelta>;
}

#[derive(Debug, Clone, Default)]
struct UserRecord {
    preferences: UserPreferences,
    usage: UsageDelta,
}

/// 进程内存储，未配置数据库时使用
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: DashMap<RequesterId, UserRecord>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferences(self, requester: RequesterId, preferences: UserPreferences) -> Self {
        self.users.entry(requester).or_default().preferences = preferences;
        self
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn preferences(&self, requester: RequesterId) -> RelayResult<UserPreferences> {
        Ok(self
            .users
            .get(&requester)
            .map(|r| r.preferences.clone())
            .unwrap_or_default())
    }

    async fn update_preferences(
        &self,
        requester: RequesterId,
        update: PreferenceUpdate,
    ) -> RelayResult<UserPreferences> {
        let mut record = self.users.entry(requester).or_default();
        update.apply(&mut record.preferences);
        Ok(record.preferences.clone())
    }

    async fn increment_usage(&self, requester: RequesterId, delta: UsageDelta) -> RelayResult<()> {
        let mut record = self.users.entry(requester).or_default();
        record.usage.characters += delta.characters;
        record.usage.requests += delta.requests;
        Ok(())
    }

    async fn usage(&self, requester: RequesterId) -> RelayResult<UsageDelta> {
        Ok(self.users.get(&requester).map(|r| r.usage).unwrap_or_default())
    }
}
