//! 文本相关的安全工具函数
//!
//! 提供 UTF-8 安全的截断与错误信息脱敏，避免字节级切片导致 panic

use regex::Regex;
use std::sync::LazyLock;

static RE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?|wss?)://[^\s)]+").expect("static regex"));

/// 按字符安全截断字符串，若超过则追加省略号
pub fn safe_truncate(input: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }

    let mut result = String::with_capacity(max_chars.min(input.len()) + 3);
    let mut iter = input.chars();

    for _ in 0..max_chars {
        match iter.next() {
            Some(ch) => result.push(ch),
            None => return result,
        }
    }

    if iter.next().is_some() {
        result.push_str("...");
    }

    result
}

/// 字符数（非字节数）
pub fn char_len(input: &str) -> usize {
    input.chars().count()
}

/// 返回 `input` 中第 `n` 个字符的字节偏移，超出长度时返回 `input.len()`
pub fn byte_offset_of_char(input: &str, n: usize) -> usize {
    input
        .char_indices()
        .nth(n)
        .map(|(idx, _)| idx)
        .unwrap_or(input.len())
}

/// 错误信息脱敏：去掉 URL（可能含内网地址或 token），压缩空白并截断
pub fn sanitize_error_message(input: &str, max_chars: usize) -> String {
    let without_urls = RE_URL.replace_all(input, "<backend>");
    let collapsed = without_urls.split_whitespace().collect::<Vec<_>>().join(" ");
    safe_truncate(&collapsed, max_chars)
}
