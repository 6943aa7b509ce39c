//! 入站命令解析与分发
//!
//! `/ask` 与意图命令会进入调度队列，其余命令直接读写偏好或查询队列。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::cancellation::CancellationController;
use crate::channel::ChatChannel;
use crate::config::IntentConfig;
use crate::error::RelayError;
use crate::execution::{build_prompt, ExecutionContext, ExecutionTask};
use crate::i18n::Localizer;
use crate::models::{ChatId, IncomingMessage, MessageTarget, RequesterId, UserPreferences};
use crate::renderer::RenderOptions;
use crate::scheduler::{QueueEntry, Scheduler};
use crate::telegram::UpdateHandler;
use crate::usage::PreferenceUpdate;

const MAX_TEMPERATURE: f32 = 2.0;

/// 解析后的命令
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ask(String),
    Intent { name: String, text: String },
    Stop,
    StopUser(RequesterId),
    Restrict { user: RequesterId, minutes: i64 },
    Queue,
    /// `None` 表示恢复默认模型
    Model(Option<String>),
    Thinking(bool),
    MaxTime(u64),
    /// `None` 表示恢复默认温度
    Temperature(Option<f32>),
    /// `None` 表示跟随聊天平台的语言
    Language(Option<String>),
    /// 参数错误，附用法
    Invalid { usage: &'static str },
}

impl Command {
    /// 解析一条消息；非命令或未知命令返回 `None`
    pub fn parse(text: &str, intents: &HashMap<String, IntentConfig>) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        // "/ask@my_bot" 形式
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

        let command = match name.as_str() {
            "ask" if args.is_empty() => Command::Invalid { usage: "/ask <question>" },
            "ask" => Command::Ask(args.to_string()),
            "stop" => Command::Stop,
            "stopuser" => match args.parse() {
                Ok(user) => Command::StopUser(user),
                Err(_) => Command::Invalid { usage: "/stopuser <user id>" },
            },
            "restrict" => {
                let mut it = args.split_whitespace();
                match (
                    it.next().and_then(|u| u.parse().ok()),
                    it.next().and_then(|m| m.parse::<i64>().ok()),
                ) {
                    (Some(user), Some(minutes)) if minutes >= 0 => Command::Restrict { user, minutes },
                    _ => Command::Invalid { usage: "/restrict <user id> <minutes>" },
                }
            }
            "queue" => Command::Queue,
            "model" if args.is_empty() => Command::Invalid { usage: "/model <name|reset>" },
            "model" if args.eq_ignore_ascii_case("reset") => Command::Model(None),
            "model" => Command::Model(Some(args.to_string())),
            "thinking" => match args.to_ascii_lowercase().as_str() {
                "on" => Command::Thinking(true),
                "off" => Command::Thinking(false),
                _ => Command::Invalid { usage: "/thinking on|off" },
            },
            "maxtime" => match args.parse() {
                Ok(secs) => Command::MaxTime(secs),
                Err(_) => Command::Invalid { usage: "/maxtime <seconds>" },
            },
            "temperature" if args.eq_ignore_ascii_case("reset") => Command::Temperature(None),
            "temperature" => match args.parse::<f32>() {
                Ok(t) if (0.0..=MAX_TEMPERATURE).contains(&t) => Command::Temperature(Some(t)),
                _ => Command::Invalid { usage: "/temperature <0-2|reset>" },
            },
            "language" if args.eq_ignore_ascii_case("reset") => Command::Language(None),
            "language" if Localizer::supports(args) => Command::Language(Some(args.to_ascii_lowercase())),
            "language" => Command::Invalid { usage: "/language <en|zh|reset>" },
            other if intents.contains_key(other) => {
                if args.is_empty() {
                    Command::Invalid { usage: "/<intent> <text>" }
                } else {
                    Command::Intent {
                        name: other.to_string(),
                        text: args.to_string(),
                    }
                }
            }
            _ => return None,
        };
        Some(command)
    }
}

pub struct CommandDispatcher {
    scheduler: Arc<Scheduler>,
    ctx: Arc<ExecutionContext>,
    cancellation: Arc<CancellationController>,
    intents: HashMap<String, IntentConfig>,
}

impl CommandDispatcher {
    pub fn new(
        scheduler: Arc<Scheduler>,
        ctx: Arc<ExecutionContext>,
        cancellation: Arc<CancellationController>,
        intents: HashMap<String, IntentConfig>,
    ) -> Self {
        Self {
            scheduler,
            ctx,
            cancellation,
            intents,
        }
    }

    fn channel(&self) -> &Arc<dyn ChatChannel> {
        self.ctx.renderer.channel()
    }

    pub async fn dispatch(&self, message: IncomingMessage) {
        let Some(command) = Command::parse(&message.text, &self.intents) else {
            return;
        };
        debug!("[Commands] {} from {}: {:?}", message.chat_id, message.user_id, command);

        let prefs = match self.ctx.store.preferences(message.user_id).await {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!("[Commands] failed to load preferences for {}: {}", message.user_id, e);
                Default::default()
            }
        };
        let locale = prefs
            .locale
            .clone()
            .or_else(|| message.language_code.clone());
        let locale = locale.as_deref();
        let l10n = &self.ctx.localizer;

        match command {
            Command::Ask(text) => self.submit(&message, &prefs, None, &text, locale).await,
            Command::Intent { name, text } => {
                let intent = self.intents.get(&name);
                self.submit(&message, &prefs, intent, &text, locale).await
            }
            Command::Stop => {
                self.cancellation
                    .cancel(message.user_id, message.chat_id, locale)
                    .await;
            }
            Command::StopUser(target) => {
                self.cancellation
                    .purge_requester(message.user_id, target, message.chat_id, locale)
                    .await;
            }
            Command::Restrict { user, minutes } => {
                if !self.cancellation.is_operator(message.user_id) {
                    self.reply(message.chat_id, l10n.text(locale, "cmd.not_operator"))
                        .await;
                    return;
                }
                let until = (minutes > 0).then(|| Utc::now() + ChronoDuration::minutes(minutes));
                let user_str = user.to_string();
                let text = if until.is_some() {
                    l10n.format(
                        locale,
                        "cmd.restricted",
                        &[("user", user_str.as_str()), ("minutes", minutes.to_string().as_str())],
                    )
                } else {
                    l10n.format(locale, "cmd.unrestricted", &[("user", user_str.as_str())])
                };
                self.update_and_reply(message.chat_id, user, PreferenceUpdate::TimeoutUntil(until), text, locale)
                    .await;
                if until.is_some() {
                    self.cancellation.stop_all(user).await;
                }
            }
            Command::Queue => {
                let text = self.render_queue(locale);
                self.reply(message.chat_id, text).await;
            }
            Command::Model(model) => {
                let text = match &model {
                    Some(name) => l10n.format(locale, "cmd.model_set", &[("model", name.as_str())]),
                    None => l10n.format(
                        locale,
                        "cmd.model_reset",
                        &[("model", self.ctx.settings.default_model.as_str())],
                    ),
                };
                self.update_and_reply(message.chat_id, message.user_id, PreferenceUpdate::CustomModel(model), text, locale)
                    .await;
            }
            Command::Thinking(show) => {
                let key = if show { "cmd.thinking_on" } else { "cmd.thinking_off" };
                self.update_and_reply(
                    message.chat_id,
                    message.user_id,
                    PreferenceUpdate::ShowThinking(show),
                    l10n.text(locale, key),
                    locale,
                )
                .await;
            }
            Command::MaxTime(secs) => {
                let text = if secs == 0 {
                    l10n.text(locale, "cmd.maxtime_reset")
                } else {
                    l10n.format(locale, "cmd.maxtime_set", &[("seconds", secs.to_string().as_str())])
                };
                self.update_and_reply(
                    message.chat_id,
                    message.user_id,
                    PreferenceUpdate::MaxExecutionSeconds(secs),
                    text,
                    locale,
                )
                .await;
            }
            Command::Temperature(value) => {
                let text = match value {
                    Some(t) => l10n.format(locale, "cmd.temperature_set", &[("value", t.to_string().as_str())]),
                    None => l10n.format(
                        locale,
                        "cmd.temperature_reset",
                        &[("value", self.ctx.settings.default_temperature.to_string().as_str())],
                    ),
                };
                self.update_and_reply(
                    message.chat_id,
                    message.user_id,
                    PreferenceUpdate::Temperature(value),
                    text,
                    locale,
                )
                .await;
            }
            Command::Language(value) => {
                // 确认消息使用新语言
                let reply_locale = value.as_deref().or(message.language_code.as_deref());
                let text = match &value {
                    Some(code) => l10n.format(reply_locale, "cmd.language_set", &[("locale", code.as_str())]),
                    None => l10n.text(reply_locale, "cmd.language_reset"),
                };
                self.update_and_reply(
                    message.chat_id,
                    message.user_id,
                    PreferenceUpdate::Locale(value.clone()),
                    text,
                    reply_locale,
                )
                .await;
            }
            Command::Invalid { usage } => {
                self.reply(message.chat_id, l10n.format(locale, "cmd.usage", &[("usage", usage)]))
                    .await;
            }
        }
    }

    /// 构造执行任务并入队
    async fn submit(
        &self,
        message: &IncomingMessage,
        prefs: &UserPreferences,
        intent: Option<&IntentConfig>,
        text: &str,
        locale: Option<&str>,
    ) {
        let l10n = &self.ctx.localizer;

        if prefs.is_restricted_at(Utc::now()) {
            let until = prefs
                .timeout_until
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_default();
            info!(
                "[Commands] {}",
                RelayError::UserRestricted(message.user_id)
            );
            self.reply(
                message.chat_id,
                l10n.format(locale, "exec.restricted", &[("until", until.as_str())]),
            )
            .await;
            return;
        }

        let placeholder = match self
            .channel()
            .send_message(message.chat_id, &l10n.text(locale, "exec.waiting"), None)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("[Commands] could not create reply message in {}: {}", message.chat_id, e);
                return;
            }
        };
        let target = MessageTarget::new(message.chat_id, placeholder);

        let prompt = build_prompt(
            intent.and_then(|i| i.preamble.as_deref()),
            message.reply_to_text.as_deref(),
            text,
        );
        let mut task = ExecutionTask::from_preferences(
            message.user_id,
            target,
            intent.map(|i| i.model.as_str()),
            prompt,
            prefs,
            &self.ctx.settings,
        );
        if task.locale.is_none() {
            task.locale = locale.map(str::to_string);
        }

        let ctx = Arc::clone(&self.ctx);
        let model = task.model.clone();
        let renderer = Arc::clone(&self.ctx.renderer);
        let removed_text = l10n.text(locale, "exec.removed");
        let entry = QueueEntry::new(message.user_id, model, move |abort| task.run(ctx, abort))
            .with_on_removed(move || {
                renderer.render(target, removed_text, RenderOptions::final_render());
            });

        match self.scheduler.enqueue(entry) {
            Ok(0) => {}
            Ok(position) => {
                self.reply(
                    message.chat_id,
                    l10n.format(locale, "exec.queued", &[("position", position.to_string().as_str())]),
                )
                .await;
            }
            Err(RelayError::AdmissionRejected { pending, .. }) => {
                self.ctx.renderer.render(
                    target,
                    l10n.format(
                        locale,
                        "exec.admission_rejected",
                        &[("pending", pending.to_string().as_str())],
                    ),
                    RenderOptions::final_render(),
                );
            }
            Err(e) => warn!("[Commands] enqueue failed: {}", e),
        }
    }

    fn render_queue(&self, locale: Option<&str>) -> String {
        let l10n = &self.ctx.localizer;
        let snapshot = self.scheduler.inspect();
        if snapshot.current.is_none() && snapshot.pending.is_empty() {
            return l10n.text(locale, "cmd.queue_empty");
        }

        let mut lines = Vec::new();
        if let Some(current) = &snapshot.current {
            lines.push(l10n.format(
                locale,
                "cmd.queue_running",
                &[
                    ("model", current.model.as_str()),
                    ("user", current.requester_id.to_string().as_str()),
                    ("seconds", current.waited_seconds.to_string().as_str()),
                ],
            ));
        }
        for (i, entry) in snapshot.pending.iter().enumerate() {
            lines.push(l10n.format(
                locale,
                "cmd.queue_waiting",
                &[
                    ("position", (i + 1).to_string().as_str()),
                    ("model", entry.model.as_str()),
                    ("user", entry.requester_id.to_string().as_str()),
                    ("seconds", entry.waited_seconds.to_string().as_str()),
                ],
            ));
        }
        lines.join("\n")
    }

    async fn update_and_reply(
        &self,
        chat_id: ChatId,
        requester: RequesterId,
        update: PreferenceUpdate,
        success_text: String,
        locale: Option<&str>,
    ) {
        let text = match self.ctx.store.update_preferences(requester, update).await {
            Ok(_) => success_text,
            Err(e) => {
                warn!("[Commands] preference update for {} failed: {}", requester, e);
                self.ctx.localizer.text(locale, "cmd.store_error")
            }
        };
        self.reply(chat_id, text).await;
    }

    async fn reply(&self, chat_id: ChatId, text: String) {
        if let Err(e) = self.channel().send_message(chat_id, &text, None).await {
            warn!("[Commands] reply to {} failed: {}", chat_id, e);
        }
    }
}

#[async_trait]
impl UpdateHandler for CommandDispatcher {
    async fn handle(&self, message: IncomingMessage) {
        self.dispatch(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intents() -> HashMap<String, IntentConfig> {
        HashMap::from([(
            "code".to_string(),
            IntentConfig {
                model: "qwen2.5-coder".into(),
                preamble: Some("You are a coding assistant.".into()),
            },
        )])
    }

    #[test]
    fn test_parse_ask_and_bot_suffix() {
        let intents = intents();
        assert_eq!(
            Command::parse("/ask@relay_bot what is rust?", &intents),
            Some(Command::Ask("what is rust?".into()))
        );
        assert_eq!(
            Command::parse("/ask", &intents),
            Some(Command::Invalid { usage: "/ask <question>" })
        );
        assert_eq!(Command::parse("hello there", &intents), None);
        assert_eq!(Command::parse("/unknown", &intents), None);
    }

    #[test]
    fn test_parse_settings_commands() {
        let intents = intents();
        assert_eq!(Command::parse("/model reset", &intents), Some(Command::Model(None)));
        assert_eq!(
            Command::parse("/model phi3:mini", &intents),
            Some(Command::Model(Some("phi3:mini".into())))
        );
        assert_eq!(Command::parse("/thinking ON", &intents), Some(Command::Thinking(true)));
        assert_eq!(Command::parse("/maxtime 45", &intents), Some(Command::MaxTime(45)));
        assert_eq!(
            Command::parse("/temperature 0.2", &intents),
            Some(Command::Temperature(Some(0.2)))
        );
        assert_eq!(Command::parse("/temperature reset", &intents), Some(Command::Temperature(None)));
        assert!(matches!(
            Command::parse("/temperature 7", &intents),
            Some(Command::Invalid { .. })
        ));
        assert_eq!(
            Command::parse("/language ZH", &intents),
            Some(Command::Language(Some("zh".into())))
        );
        assert!(matches!(
            Command::parse("/language klingon", &intents),
            Some(Command::Invalid { .. })
        ));
        assert!(matches!(
            Command::parse("/maxtime soon", &intents),
            Some(Command::Invalid { .. })
        ));
    }

    #[test]
    fn test_parse_operator_commands() {
        let intents = intents();
        assert_eq!(Command::parse("/stopuser 42", &intents), Some(Command::StopUser(42)));
        assert_eq!(
            Command::parse("/restrict 42 15", &intents),
            Some(Command::Restrict { user: 42, minutes: 15 })
        );
        assert!(matches!(
            Command::parse("/restrict 42", &intents),
            Some(Command::Invalid { .. })
        ));
    }

    #[test]
    fn test_parse_intent_command() {
        let intents = intents();
        assert_eq!(
            Command::parse("/code write fizzbuzz", &intents),
            Some(Command::Intent {
                name: "code".into(),
                text: "write fizzbuzz".into()
            })
        );
    }
}
