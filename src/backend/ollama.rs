//! Ollama 兼容生成后端客户端
//!
//! - `POST /api/generate`（流式 NDJSON）
//! - `POST /api/pull`（按需拉取缺失模型）
//! - `POST /api/show`（读取模型参数量，决定 keep_alive）
//! - `POST /api/generate {keep_alive: 0}`（卸载模型）

use std::time::Duration;

use moka::future::Cache;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::lines::NdjsonLines;
use crate::error::{RelayError, RelayResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// keep_alive 取值：数字（秒，0 表示立即卸载）或时长字符串（如 `"30m"`）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KeepAlive {
    Seconds(i64),
    Duration(String),
}

impl KeepAlive {
    pub fn unload_now() -> Self {
        KeepAlive::Seconds(0)
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub keep_alive: KeepAlive,
}

/// NDJSON 中的单个片段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateFragment {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    #[serde(default)]
    details: Option<ShowDetails>,
}

#[derive(Debug, Deserialize)]
struct ShowDetails {
    #[serde(default)]
    parameter_size: Option<String>,
}

pub struct OllamaClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
    /// model -> 参数量（十亿）
    size_cache: Cache<String, f64>,
}

impl OllamaClient {
    pub fn new(base_url: &str, request_timeout: Duration, size_ttl: Duration) -> RelayResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
            size_cache: Cache::builder()
                .max_capacity(256)
                .time_to_live(size_ttl)
                .build(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 发起流式生成，返回行迭代器。模型缺失映射为 [`RelayError::ModelNotFound`]。
    pub async fn generate_stream(&self, req: &GenerateRequest) -> RelayResult<NdjsonLines> {
        let body = json!({
            "model": req.model,
            "prompt": req.prompt,
            "stream": true,
            "keep_alive": req.keep_alive,
            "options": { "temperature": req.temperature },
        });
        debug!(
            "[Backend] generate model={} prompt_chars={} keep_alive={:?}",
            req.model,
            req.prompt.chars().count(),
            req.keep_alive
        );

        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::BackendUnavailable(format!("generate request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(&req.model, status, &text));
        }

        Ok(NdjsonLines::from_stream(response.bytes_stream()))
    }

    /// 拉取模型（非流式，一次调用）
    pub async fn pull(&self, model: &str) -> RelayResult<()> {
        info!("[Backend] pulling model {}", model);
        let response = self
            .client
            .post(self.endpoint("/api/pull"))
            .timeout(self.request_timeout)
            .json(&json!({ "model": model, "stream": false }))
            .send()
            .await
            .map_err(|e| RelayError::BackendUnavailable(format!("pull request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let reported = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.error);
        if !status.is_success() || reported.is_some() {
            let detail = reported.unwrap_or_else(|| text.trim().to_string());
            return Err(RelayError::BackendUnavailable(format!(
                "pull {} failed: {} {}",
                model, status, detail
            )));
        }
        info!("[Backend] model {} pulled", model);
        Ok(())
    }

    /// 要求后端立即卸载模型；失败只记录日志
    pub async fn unload(&self, model: &str) -> RelayResult<()> {
        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .timeout(self.request_timeout)
            .json(&json!({ "model": model, "keep_alive": 0 }))
            .send()
            .await
            .map_err(|e| RelayError::BackendUnavailable(format!("unload request failed: {}", e)))?;
        if !response.status().is_success() {
            warn!(
                "[Backend] unload {} returned {}",
                model,
                response.status()
            );
        }
        Ok(())
    }

    /// 模型声明的参数量（十亿），读取失败返回 `None`
    pub async fn parameter_size_billions(&self, model: &str) -> Option<f64> {
        if let Some(size) = self.size_cache.get(model).await {
            return Some(size);
        }
        let response = self
            .client
            .post(self.endpoint("/api/show"))
            .timeout(self.request_timeout)
            .json(&json!({ "model": model }))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!("[Backend] show {} returned {}", model, response.status());
            return None;
        }
        let show: ShowResponse = response.json().await.ok()?;
        let size = show
            .details
            .and_then(|d| d.parameter_size)
            .and_then(|s| parse_parameter_size(&s))?;
        self.size_cache.insert(model.to_string(), size).await;
        Some(size)
    }

    /// 小模型调用后立即卸载，大模型或未知参数量保持常驻
    pub async fn keep_alive_for(&self, model: &str, unload_below: f64, warm: &str) -> KeepAlive {
        match self.parameter_size_billions(model).await {
            Some(size) if size < unload_below => KeepAlive::unload_now(),
            _ => KeepAlive::Duration(warm.to_string()),
        }
    }
}

/// 后端报错文本是否表示模型不存在
pub fn is_model_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found") && (lower.contains("model") || lower.contains("pull"))
}

fn classify_http_error(model: &str, status: StatusCode, body: &str) -> RelayError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| body.trim().to_string());
    if status == StatusCode::NOT_FOUND || is_model_not_found(&detail) {
        return RelayError::ModelNotFound(model.to_string());
    }
    RelayError::BackendUnavailable(format!("{} {}", status, detail))
}

/// 解析 `"7.6B"`、`"270M"`、`"1.2T"` 为十亿单位
pub fn parse_parameter_size(raw: &str) -> Option<f64> {
    let s = raw.trim();
    let unit = s.chars().last()?;
    let value: f64 = s[..s.len() - unit.len_utf8()].trim().parse().ok()?;
    match unit.to_ascii_uppercase() {
        'K' => Some(value / 1_000_000.0),
        'M' => Some(value / 1_000.0),
        'B' => Some(value),
        'T' => Some(value * 1_000.0),
        _ => None,
    }
}
