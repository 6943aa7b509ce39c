//! 超长消息切分
//!
//! 逐行累积，直到再加一行会超过上限时另起一块；单行本身超过上限时按字符硬切。
//! 长度均按字符计，切分点一定落在字符边界上。

use crate::utils::text::{byte_offset_of_char, char_len};

pub fn split_into_chunks(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if char_len(text) <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    let mut started = false;

    for line in text.split('\n') {
        let line_len = char_len(line);

        if line_len > limit {
            if started {
                chunks.push(std::mem::take(&mut current));
            }
            let mut rest = line;
            while char_len(rest) > limit {
                let cut = byte_offset_of_char(rest, limit);
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current = rest.to_string();
            current_len = char_len(rest);
            started = true;
            continue;
        }

        if !started {
            current.push_str(line);
            current_len = line_len;
            started = true;
        } else if current_len + 1 + line_len > limit {
            chunks.push(std::mem::take(&mut current));
            current.push_str(line);
            current_len = line_len;
        } else {
            current.push('\n');
            current.push_str(line);
            current_len += 1 + line_len;
        }
    }

    if started {
        chunks.push(current);
    }
    chunks
}
