//! 生成后端
//!
//! 与 Ollama 兼容接口交互，以及 NDJSON 流的行读取。

pub mod lines;
pub mod ollama;

pub use lines::{NdjsonLineBuffer, NdjsonLines};
pub use ollama::{
    is_model_not_found, parse_parameter_size, GenerateFragment, GenerateRequest, KeepAlive,
    OllamaClient,
};
