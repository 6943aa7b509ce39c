//! NDJSON 行读取
//!
//! HTTP 响应体按 chunk 到达，一行 JSON 可能被拆在多个 chunk 中，
//! 多字节字符也可能被截断。这里按字节缓冲，遇到换行才解码成完整行。

use std::collections::VecDeque;
use std::fmt::Display;

use futures_util::stream::{BoxStream, Stream, StreamExt};

use crate::error::{RelayError, RelayResult};

/// 跨 chunk 的行缓冲
#[derive(Debug, Default)]
pub struct NdjsonLineBuffer {
    buffer: Vec<u8>,
}

impl NdjsonLineBuffer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// 处理新到达的 chunk，返回其中所有完整的非空行
    pub fn process_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r').trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    pub fn has_remaining(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// 取出末尾没有换行的残留数据（流结束时调用）
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let remaining = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&remaining).trim().to_string();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

/// 基于字节流的异步行迭代器，单一消费者循环调用 [`NdjsonLines::next_line`]
pub struct NdjsonLines {
    stream: BoxStream<'static, Result<Vec<u8>, String>>,
    buffer: NdjsonLineBuffer,
    ready: VecDeque<String>,
    finished: bool,
}

impl NdjsonLines {
    pub fn from_stream<S, B, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + 'static,
        E: Display + 'static,
    {
        let stream = stream
            .map(|item| item.map(|b| b.as_ref().to_vec()).map_err(|e| e.to_string()))
            .boxed();
        Self {
            stream,
            buffer: NdjsonLineBuffer::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// 返回下一行；`None` 表示流已结束。读取错误只返回一次，之后流视为结束。
    pub async fn next_line(&mut self) -> Option<RelayResult<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(Ok(line));
            }
            if self.finished {
                return None;
            }
            match self.stream.next().await {
                Some(Ok(bytes)) => {
                    let lines = self.buffer.process_chunk(&bytes);
                    self.ready.extend(lines);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(RelayError::BackendUnavailable(format!(
                        "stream read failed: {}",
                        e
                    ))));
                }
                None => {
                    self.finished = true;
                    if let Some(rest) = self.buffer.flush() {
                        self.ready.push_back(rest);
                    }
                }
            }
        }
    }
}
