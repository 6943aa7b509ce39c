//! 流式响应消费
//!
//! 逐行解析后端 NDJSON 片段，累积文本、驱动思维链解析，并决定何时推送渲染：
//! - 第一个非空片段立即推送，让用户尽快看到进展
//! - 之后可显示文本（经过思维链模式过滤）每增长 `push_threshold` 个字符推送一次
//! - 流结束后由调用方用 [`StreamConsumer::finish`] 取得最终文本

use tracing::{debug, warn};

use crate::backend::{is_model_not_found, GenerateFragment};
use crate::error::RelayError;
use crate::models::ThinkingMode;
use crate::thinking::{render_display, ThinkingLabels, ThinkingSpanParser, ThinkingState};
use crate::utils::text::{char_len, safe_truncate};

/// 单行处理结果
#[derive(Debug)]
pub enum FragmentOutcome {
    /// 需要推送一次渲染
    Push(String),
    /// 无需推送（包括解析失败被跳过的行）
    Skip,
    /// 后端声明生成结束
    Done,
    /// 片段中携带错误
    Error(RelayError),
}

pub struct StreamConsumer {
    mode: ThinkingMode,
    labels: ThinkingLabels,
    push_threshold: usize,
    parser: ThinkingSpanParser,
    buffer: String,
    last_pushed_chars: Option<usize>,
    skipped_lines: usize,
    done: bool,
}

impl StreamConsumer {
    pub fn new(mode: ThinkingMode, labels: ThinkingLabels, push_threshold: usize) -> Self {
        Self {
            mode,
            labels,
            push_threshold: push_threshold.max(1),
            parser: ThinkingSpanParser::new(),
            buffer: String::new(),
            last_pushed_chars: None,
            skipped_lines: 0,
            done: false,
        }
    }

    pub fn handle_line(&mut self, line: &str) -> FragmentOutcome {
        let fragment: GenerateFragment = match serde_json::from_str(line) {
            Ok(f) => f,
            Err(e) => {
                self.skipped_lines += 1;
                warn!(
                    "[StreamConsumer] skipping unparsable line ({}): {}",
                    e,
                    safe_truncate(line, 120)
                );
                return FragmentOutcome::Skip;
            }
        };

        if let Some(err) = fragment.error {
            return FragmentOutcome::Error(if is_model_not_found(&err) {
                RelayError::ModelNotFound(err)
            } else {
                RelayError::BackendUnavailable(err)
            });
        }

        let mut push = None;
        if let Some(text) = fragment.response.filter(|t| !t.is_empty()) {
            self.buffer.push_str(&text);
            let display = self.displayable();
            let display_chars = char_len(&display);
            // 只有标签前缀时可显示文本为空，不推送
            let due = !display.trim().is_empty()
                && match self.last_pushed_chars {
                    None => true,
                    Some(last) => display_chars >= last + self.push_threshold,
                };
            if due {
                self.last_pushed_chars = Some(display_chars);
                push = Some(display);
            }
        }

        if fragment.done {
            debug!(
                "[StreamConsumer] stream done, {} chars, {} skipped lines",
                self.response_chars(),
                self.skipped_lines
            );
            self.done = true;
            return FragmentOutcome::Done;
        }
        match push {
            Some(display) => FragmentOutcome::Push(display),
            None => FragmentOutcome::Skip,
        }
    }

    /// 当前可显示文本（末尾不完整的标签前缀暂不显示）
    pub fn displayable(&mut self) -> String {
        let spans = self.parser.scan(&self.buffer);
        render_display(&spans, self.mode, &self.labels)
    }

    /// 流结束后的最终可显示文本
    pub fn finish(&mut self) -> String {
        let spans = self.parser.scan_final(&self.buffer);
        render_display(&spans, self.mode, &self.labels)
    }

    pub fn thinking_state(&self) -> ThinkingState {
        self.parser.state()
    }

    /// 原始响应字符数（含推理内容），用于用量统计
    pub fn response_chars(&self) -> usize {
        char_len(&self.buffer)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}
