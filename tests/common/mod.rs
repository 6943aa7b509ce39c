//! 集成测试公共设施
//!
//! mockito 无法让流式响应停在半途，超时与取消相关测试改用这里的原始 TCP 桩后端：
//! - `/api/generate` 带 prompt：先写出一段 NDJSON，然后保持连接不结束
//! - `/api/generate` 不带 prompt（卸载）：记录模型名并返回 `{}`
//! - `/api/show`：默认 404；`start_with_stalled_show` 时收下请求后不再应答
//! - 其他路径：404

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use relay_bot_lib::backend::OllamaClient;
use relay_bot_lib::execution::{ExecutionContext, ExecutionSettings};
use relay_bot_lib::i18n::Localizer;
use relay_bot_lib::renderer::{OutboundRenderer, RendererConfig};
use relay_bot_lib::test_utils::RecordingChannel;
use relay_bot_lib::usage::UserStore;

pub struct StallingBackend {
    pub url: String,
    unloads: Arc<Mutex<Vec<String>>>,
    generates: Arc<Mutex<Vec<Value>>>,
}

impl StallingBackend {
    /// `first_fragment` 为开始生成后立即写出的文本
    pub async fn start(first_fragment: &str) -> Self {
        Self::spawn(first_fragment, false).await
    }

    /// 参数量查询永远挂起的后端
    pub async fn start_with_stalled_show(first_fragment: &str) -> Self {
        Self::spawn(first_fragment, true).await
    }

    async fn spawn(first_fragment: &str, stall_show: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let unloads = Arc::new(Mutex::new(Vec::new()));
        let generates = Arc::new(Mutex::new(Vec::new()));
        let fragment = first_fragment.to_string();

        let (u, g) = (Arc::clone(&unloads), Arc::clone(&generates));
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (u, g, fragment) = (Arc::clone(&u), Arc::clone(&g), fragment.clone());
                tokio::spawn(async move {
                    let _ = serve(socket, u, g, fragment, stall_show).await;
                });
            }
        });
        Self {
            url,
            unloads,
            generates,
        }
    }

    pub fn unloads(&self) -> Vec<String> {
        self.unloads.lock().unwrap().clone()
    }

    pub fn generate_bodies(&self) -> Vec<Value> {
        self.generates.lock().unwrap().clone()
    }
}

async fn serve(
    mut socket: TcpStream,
    unloads: Arc<Mutex<Vec<String>>>,
    generates: Arc<Mutex<Vec<Value>>>,
    fragment: String,
    stall_show: bool,
) -> std::io::Result<()> {
    let (path, body) = read_request(&mut socket).await?;
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    if stall_show && path == "/api/show" {
        return drain_until_closed(&mut socket).await;
    }

    if path != "/api/generate" {
        socket
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        return Ok(());
    }

    if json.get("prompt").is_none() {
        let model = json["model"].as_str().unwrap_or_default().to_string();
        unloads.lock().unwrap().push(model);
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
            .await?;
        return Ok(());
    }

    generates.lock().unwrap().push(json);
    socket
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await?;
    let line = format!("{}\n", serde_json::json!({ "response": fragment, "done": false }));
    socket
        .write_all(format!("{:x}\r\n{}\r\n", line.len(), line).as_bytes())
        .await?;
    socket.flush().await?;
    drain_until_closed(&mut socket).await
}

/// 不再写出任何内容，直到客户端断开
async fn drain_until_closed(socket: &mut TcpStream) -> std::io::Result<()> {
    let mut sink = [0u8; 64];
    while socket.read(&mut sink).await? > 0 {}
    Ok(())
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok((String::new(), Vec::new()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = head
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or_default()
        .to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok((path, body))
}

pub fn test_settings() -> ExecutionSettings {
    ExecutionSettings {
        default_model: "llama3.2".into(),
        default_temperature: 0.7,
        hard_ceiling: Duration::from_secs(600),
        unload_below_billion_params: 4.0,
        warm_keep_alive: "30m".into(),
        push_threshold_chars: 1,
    }
}

/// 无最小编辑间隔的执行上下文，便于断言最终文本
pub fn test_context(
    backend_url: &str,
    channel: Arc<RecordingChannel>,
    store: Arc<dyn UserStore>,
) -> Arc<ExecutionContext> {
    let backend = Arc::new(
        OllamaClient::new(backend_url, Duration::from_secs(5), Duration::from_secs(60)).unwrap(),
    );
    let renderer = OutboundRenderer::new(
        channel,
        RendererConfig {
            min_interval: Duration::ZERO,
            ..RendererConfig::default()
        },
    );
    Arc::new(ExecutionContext {
        backend,
        renderer,
        store,
        localizer: Arc::new(Localizer::default()),
        settings: test_settings(),
    })
}

/// 轮询直到条件成立，超时则失败
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
