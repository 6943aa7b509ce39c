//! 运行配置
//!
//! 加载顺序：`.env`（dotenvy）→ `config/relay.toml`（可选）→ `RELAY__*` 环境变量，
//! 最后对少数常用变量做直接回退（`TELEGRAM_BOT_TOKEN`、`OLLAMA_HOST`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RelayResult;

const CONFIG_FILE: &str = "config/relay";

/// 固定意图命令配置（如 `/code`），命令会固定使用指定模型
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntentConfig {
    pub model: String,
    #[serde(default)]
    pub preamble: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 生成后端地址（Ollama 兼容）
    pub backend_url: String,
    pub default_model: String,
    pub default_temperature: f32,
    /// 每个请求者最多排队的请求数
    pub max_user_queue_size: usize,
    /// 用户未配置最大执行时长时使用的硬上限
    pub hard_execution_ceiling_secs: u64,
    /// 参数量低于该值（单位：十亿）的模型调用后立即卸载
    pub unload_below_billion_params: f64,
    /// 大模型的 keep_alive 值，原样透传给后端
    pub warm_keep_alive: String,
    /// 非流式后端调用（pull/show/unload）的超时
    pub request_timeout_secs: u64,
    /// 可显示文本增长达到该字符数才推送一次渲染
    pub push_threshold_chars: usize,
    pub render_min_interval_ms: u64,
    /// 单条消息的安全长度（低于平台硬上限）
    pub render_safe_length: usize,
    pub telegram_token: Option<String>,
    pub telegram_api_base: String,
    pub operator_ids: Vec<i64>,
    /// 为空时使用内存存储
    pub database_path: Option<PathBuf>,
    pub default_locale: String,
    pub model_size_cache_ttl_secs: u64,
    pub intents: HashMap<String, IntentConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:11434".to_string(),
            default_model: "llama3.2".to_string(),
            default_temperature: 0.7,
            max_user_queue_size: 3,
            hard_execution_ceiling_secs: 600,
            unload_below_billion_params: 4.0,
            warm_keep_alive: "30m".to_string(),
            request_timeout_secs: 600,
            push_threshold_chars: 120,
            render_min_interval_ms: 5_000,
            render_safe_length: 3_500,
            telegram_token: None,
            telegram_api_base: "https://api.telegram.org".to_string(),
            operator_ids: Vec::new(),
            database_path: None,
            default_locale: "en".to_string(),
            model_size_cache_ttl_secs: 3_600,
            intents: HashMap::new(),
        }
    }
}

impl RelayConfig {
    pub fn from_env_and_file() -> RelayResult<Self> {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder();
        if std::path::Path::new(&format!("{}.toml", CONFIG_FILE)).exists() {
            debug!("[Config] Loading {}.toml", CONFIG_FILE);
            builder = builder.add_source(config::File::with_name(CONFIG_FILE));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("operator_ids")
                .try_parsing(true),
        );
        let mut cfg: RelayConfig = builder.build()?.try_deserialize()?;

        // direct env fallbacks
        if cfg.telegram_token.is_none() {
            cfg.telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        }
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            if std::env::var("RELAY__BACKEND_URL").is_err() {
                cfg.backend_url = normalize_host(&host);
            }
        }
        cfg.validate();
        Ok(cfg)
    }

    /// 修正明显无效的取值，避免运行期出现 0 间隔或 0 长度
    fn validate(&mut self) {
        if self.max_user_queue_size == 0 {
            warn!("[Config] max_user_queue_size=0 is invalid, using 1");
            self.max_user_queue_size = 1;
        }
        if self.render_safe_length < 64 {
            warn!(
                "[Config] render_safe_length={} too small, using 64",
                self.render_safe_length
            );
            self.render_safe_length = 64;
        }
        if self.hard_execution_ceiling_secs == 0 {
            self.hard_execution_ceiling_secs = RelayConfig::default().hard_execution_ceiling_secs;
        }
        self.push_threshold_chars = self.push_threshold_chars.max(1);
    }

    pub fn render_min_interval(&self) -> Duration {
        Duration::from_millis(self.render_min_interval_ms)
    }

    pub fn hard_execution_ceiling(&self) -> Duration {
        Duration::from_secs(self.hard_execution_ceiling_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn is_operator(&self, user_id: i64) -> bool {
        self.operator_ids.contains(&user_id)
    }
}

/// `OLLAMA_HOST` 常写成 `host:port`，补全协议头
fn normalize_host(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}
