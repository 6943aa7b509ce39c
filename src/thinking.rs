//! 思维链（`<think>` 标签）解析
//!
//! 始终基于累积缓冲区扫描，而不是只看最新片段：开始/结束标签可能跨片段。
//!
//! 规则：
//! - 缓冲区中第一个 `<think>` 出现 → 进入 Thinking
//! - 其后最后一个 `</think>` 出现 → 进入 Done
//! - 第一个开始标签与最后一个结束标签之间为推理内容，其余为可见内容
//!
//! 多段 `<think>` 会被合并为"首个开始 ~ 最后结束"的单一窗口，不区分嵌套或重复。

pub const OPEN_MARKER: &str = "<think>";
pub const CLOSE_MARKER: &str = "</think>";

use crate::models::ThinkingMode;

/// 思维链三态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkPhase {
    #[default]
    Idle,
    Thinking,
    Done,
}

/// 单次执行内的思维链状态，只会从 false 变为 true
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThinkingState {
    has_started: bool,
    has_finished: bool,
}

impl ThinkingState {
    pub fn has_started(&self) -> bool {
        self.has_started
    }

    pub fn has_finished(&self) -> bool {
        self.has_finished
    }

    pub fn phase(&self) -> ThinkPhase {
        match (self.has_started, self.has_finished) {
            (_, true) => ThinkPhase::Done,
            (true, false) => ThinkPhase::Thinking,
            (false, false) => ThinkPhase::Idle,
        }
    }

    fn advance(&mut self, phase: ThinkPhase) {
        match phase {
            ThinkPhase::Idle => {}
            ThinkPhase::Thinking => self.has_started = true,
            ThinkPhase::Done => {
                self.has_started = true;
                self.has_finished = true;
            }
        }
    }
}

/// 缓冲区切分结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkSpans<'a> {
    pub phase: ThinkPhase,
    pub before: &'a str,
    pub reasoning: &'a str,
    pub after: &'a str,
}

/// 展示用的本地化标签
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingLabels {
    pub thinking: String,
    pub finished: String,
}

impl Default for ThinkingLabels {
    fn default() -> Self {
        Self {
            thinking: "🤔 Thinking…".to_string(),
            finished: "💡 Finished thinking".to_string(),
        }
    }
}

/// 有状态的思维链扫描器
#[derive(Debug, Default)]
pub struct ThinkingSpanParser {
    state: ThinkingState,
}

impl ThinkingSpanParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ThinkingState {
        self.state
    }

    /// 扫描完整的累积缓冲区并推进状态
    pub fn scan<'a>(&mut self, buffer: &'a str) -> ThinkSpans<'a> {
        let spans = split_spans(buffer);
        self.state.advance(spans.phase);
        spans
    }

    /// 流结束后的最终扫描，末尾不完整的标签前缀按普通文本保留
    pub fn scan_final<'a>(&mut self, buffer: &'a str) -> ThinkSpans<'a> {
        let spans = split_spans_with(buffer, false);
        self.state.advance(spans.phase);
        spans
    }
}

/// 按首个开始标签 / 最后结束标签切分缓冲区
///
/// 缓冲区末尾若是某个标签的不完整前缀（如 `"<thi"`），该前缀暂不计入任何部分。
pub fn split_spans(buffer: &str) -> ThinkSpans<'_> {
    split_spans_with(buffer, true)
}

fn split_spans_with(buffer: &str, hold_back: bool) -> ThinkSpans<'_> {
    let Some(open) = buffer.find(OPEN_MARKER) else {
        return ThinkSpans {
            phase: ThinkPhase::Idle,
            before: maybe_strip(buffer, OPEN_MARKER, hold_back),
            reasoning: "",
            after: "",
        };
    };

    let before = &buffer[..open];
    let rest = &buffer[open + OPEN_MARKER.len()..];
    match rest.rfind(CLOSE_MARKER) {
        None => ThinkSpans {
            phase: ThinkPhase::Thinking,
            before,
            reasoning: maybe_strip(rest, CLOSE_MARKER, hold_back),
            after: "",
        },
        Some(close) => ThinkSpans {
            phase: ThinkPhase::Done,
            before,
            reasoning: &rest[..close],
            after: maybe_strip(&rest[close + CLOSE_MARKER.len()..], CLOSE_MARKER, hold_back),
        },
    }
}

fn maybe_strip<'a>(text: &'a str, marker: &str, hold_back: bool) -> &'a str {
    if hold_back {
        strip_partial_suffix(text, marker)
    } else {
        text
    }
}

/// 去掉末尾的标签不完整前缀；标签为 ASCII，切分点一定落在字符边界上
fn strip_partial_suffix<'a>(text: &'a str, marker: &str) -> &'a str {
    for k in (1..marker.len()).rev() {
        if text.ends_with(&marker[..k]) {
            return &text[..text.len() - k];
        }
    }
    text
}

/// 按展示模式生成可显示文本
pub fn render_display(spans: &ThinkSpans<'_>, mode: ThinkingMode, labels: &ThinkingLabels) -> String {
    let before = spans.before.trim_end();
    let reasoning = spans.reasoning.trim();
    let after = spans.after.trim_start();

    let mut out = String::new();
    match (spans.phase, mode) {
        (ThinkPhase::Idle, _) => out.push_str(spans.before),
        (ThinkPhase::Thinking, ThinkingMode::Show) => {
            push_block(&mut out, before);
            push_block(&mut out, &labels.thinking);
            out.push('\n');
            out.push_str(reasoning);
        }
        (ThinkPhase::Thinking, ThinkingMode::Hide) => {
            push_block(&mut out, before);
            push_block(&mut out, &labels.thinking);
        }
        (ThinkPhase::Done, ThinkingMode::Show) => {
            push_block(&mut out, before);
            push_block(&mut out, &labels.thinking);
            out.push('\n');
            out.push_str(reasoning);
            out.push('\n');
            out.push_str(&labels.finished);
            push_block(&mut out, after);
        }
        (ThinkPhase::Done, ThinkingMode::Hide) => {
            out.push_str(&labels.finished);
            push_block(&mut out, before);
            push_block(&mut out, after);
        }
    }
    out
}

fn push_block(out: &mut String, block: &str) {
    if block.is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(block);
}
