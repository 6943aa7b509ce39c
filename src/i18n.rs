//! 面向用户的文本模板
//!
//! 内置 `en` / `zh` 两套表，模板中的 `{name}` 由调用方替换。
//! 查找顺序：请求者语言 → 默认语言 → `en` → key 本身。

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::thinking::ThinkingLabels;

type Table = HashMap<&'static str, &'static str>;

static EN: LazyLock<Table> = LazyLock::new(|| {
    HashMap::from([
        ("thinking.in_progress", "🤔 Thinking…"),
        ("thinking.finished", "💡 Finished thinking"),
        ("exec.waiting", "⏳ Request received…"),
        ("exec.generating", "⏳ Generating with {model}…"),
        ("exec.complete", "✅ Done · {model}"),
        ("exec.empty_response", "(empty response)"),
        ("exec.removed", "🗑️ Removed from the queue."),
        ("exec.queued", "🕒 Your request is queued at position {position}."),
        ("exec.admission_rejected", "You already have {pending} requests waiting. Please wait for them to finish."),
        ("exec.restricted", "You can't use the bot until {until}."),
        ("exec.model_pulling", "📥 Model {model} is not available yet, downloading it now…"),
        ("exec.model_ready", "✅ Model {model} is ready. Please send your request again."),
        ("exec.model_pull_failed", "❌ Could not download {model}: {error}"),
        ("exec.timeout_suffix", "⏱️ Stopped after {seconds}s (time limit reached)."),
        ("exec.error", "❌ Backend error: {error}"),
        ("cancel.stopped_running", "🛑 Your request was stopped."),
        ("cancel.removed_queued", "🗑️ Your queued request was removed."),
        ("cancel.nothing", "You have nothing to cancel."),
        ("cancel.operator_report", "Requester {user}: running stopped: {running}, queued removed: {queued}."),
        ("cmd.not_operator", "This command is only available to operators."),
        ("cmd.usage", "Usage: {usage}"),
        ("cmd.queue_empty", "The queue is empty."),
        ("cmd.queue_running", "▶️ Running: {model} (requester {user}, {seconds}s)"),
        ("cmd.queue_waiting", "{position}. {model} (requester {user}, waiting {seconds}s)"),
        ("cmd.model_set", "Model set to {model}."),
        ("cmd.model_reset", "Model reset to the default ({model})."),
        ("cmd.thinking_on", "Reasoning will be shown."),
        ("cmd.thinking_off", "Reasoning will be hidden."),
        ("cmd.maxtime_set", "Maximum generation time set to {seconds}s."),
        ("cmd.maxtime_reset", "Maximum generation time reset to the default."),
        ("cmd.temperature_set", "Temperature set to {value}."),
        ("cmd.temperature_reset", "Temperature reset to the default ({value})."),
        ("cmd.language_set", "Language set to {locale}."),
        ("cmd.language_reset", "Language now follows your chat app setting."),
        ("cmd.restricted", "Requester {user} is restricted for {minutes} minutes."),
        ("cmd.unrestricted", "Requester {user} is no longer restricted."),
        ("cmd.store_error", "Settings could not be saved, please try again later."),
    ])
});

static ZH: LazyLock<Table> = LazyLock::new(|| {
    HashMap::from([
        ("thinking.in_progress", "🤔 思考中…"),
        ("thinking.finished", "💡 思考完成"),
        ("exec.waiting", "⏳ 已收到请求…"),
        ("exec.generating", "⏳ 正在使用 {model} 生成…"),
        ("exec.complete", "✅ 完成 · {model}"),
        ("exec.empty_response", "（空回复）"),
        ("exec.removed", "🗑️ 已移出队列。"),
        ("exec.queued", "🕒 已排队，当前位置 {position}。"),
        ("exec.admission_rejected", "你已有 {pending} 个请求在排队，请等待完成后再试。"),
        ("exec.restricted", "你在 {until} 之前无法使用机器人。"),
        ("exec.model_pulling", "📥 模型 {model} 尚未就绪，正在下载…"),
        ("exec.model_ready", "✅ 模型 {model} 已就绪，请重新发送请求。"),
        ("exec.model_pull_failed", "❌ 下载 {model} 失败：{error}"),
        ("exec.timeout_suffix", "⏱️ 已达到时间上限，{seconds} 秒后停止。"),
        ("exec.error", "❌ 后端错误：{error}"),
        ("cancel.stopped_running", "🛑 你的请求已停止。"),
        ("cancel.removed_queued", "🗑️ 你排队中的请求已移除。"),
        ("cancel.nothing", "没有可以取消的请求。"),
        ("cancel.operator_report", "请求者 {user}：停止运行 {running}，移除排队 {queued}。"),
        ("cmd.not_operator", "该命令仅限管理员使用。"),
        ("cmd.usage", "用法：{usage}"),
        ("cmd.queue_empty", "队列为空。"),
        ("cmd.queue_running", "▶️ 运行中：{model}（请求者 {user}，{seconds} 秒）"),
        ("cmd.queue_waiting", "{position}. {model}（请求者 {user}，已等待 {seconds} 秒）"),
        ("cmd.model_set", "模型已设置为 {model}。"),
        ("cmd.model_reset", "模型已恢复默认（{model}）。"),
        ("cmd.thinking_on", "将显示推理过程。"),
        ("cmd.thinking_off", "将隐藏推理过程。"),
        ("cmd.maxtime_set", "最长生成时间已设置为 {seconds} 秒。"),
        ("cmd.maxtime_reset", "最长生成时间已恢复默认。"),
        ("cmd.temperature_set", "温度已设置为 {value}。"),
        ("cmd.temperature_reset", "温度已恢复默认（{value}）。"),
        ("cmd.language_set", "语言已设置为 {locale}。"),
        ("cmd.language_reset", "语言将跟随聊天应用设置。"),
        ("cmd.restricted", "请求者 {user} 已被限制 {minutes} 分钟。"),
        ("cmd.unrestricted", "请求者 {user} 的限制已解除。"),
        ("cmd.store_error", "设置保存失败，请稍后再试。"),
    ])
});

#[derive(Debug, Clone)]
pub struct Localizer {
    default_locale: String,
}

impl Default for Localizer {
    fn default() -> Self {
        Self::new("en")
    }
}

impl Localizer {
    pub fn new(default_locale: impl Into<String>) -> Self {
        Self {
            default_locale: default_locale.into(),
        }
    }

    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }

    /// 取模板原文
    pub fn text(&self, locale: Option<&str>, key: &str) -> String {
        locale
            .and_then(table_for)
            .and_then(|t| t.get(key))
            .or_else(|| table_for(&self.default_locale).and_then(|t| t.get(key)))
            .or_else(|| EN.get(key))
            .map(|s| s.to_string())
            .unwrap_or_else(|| key.to_string())
    }

    /// 取模板并替换 `{name}` 占位符
    pub fn format(&self, locale: Option<&str>, key: &str, args: &[(&str, &str)]) -> String {
        let mut out = self.text(locale, key);
        for (name, value) in args {
            out = out.replace(&format!("{{{}}}", name), value);
        }
        out
    }

    /// 是否有内置的对应语言表
    pub fn supports(locale: &str) -> bool {
        !locale.is_empty() && table_for(locale).is_some()
    }

    pub fn thinking_labels(&self, locale: Option<&str>) -> ThinkingLabels {
        ThinkingLabels {
            thinking: self.text(locale, "thinking.in_progress"),
            finished: self.text(locale, "thinking.finished"),
        }
    }
}

/// `zh-hans`、`zh_CN` 之类按主语言匹配
fn table_for(locale: &str) -> Option<&'static Table> {
    let primary = locale
        .split(['-', '_'])
        .next()
        .unwrap_or(locale)
        .to_ascii_lowercase();
    match primary.as_str() {
        "en" => Some(&EN),
        "zh" => Some(&ZH),
        _ => None,
    }
}
