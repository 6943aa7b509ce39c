//! 端到端执行测试：命令 → 调度 → 流式生成 → 渲染

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use assert_matches::assert_matches;
use mockito::Matcher;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use relay_bot_lib::cancellation::CancellationController;
use relay_bot_lib::commands::CommandDispatcher;
use relay_bot_lib::error::RelayError;
use relay_bot_lib::execution::{ExecutionContext, ExecutionTask};
use relay_bot_lib::models::{IncomingMessage, MessageTarget, ThinkingMode};
use relay_bot_lib::scheduler::Scheduler;
use relay_bot_lib::test_utils::{seeded_store, RecordingChannel};
use relay_bot_lib::usage::{InMemoryUserStore, UserStore};

use common::{test_context, wait_until, StallingBackend};

fn message(chat_id: i64, user_id: i64, text: &str) -> IncomingMessage {
    IncomingMessage {
        chat_id,
        message_id: 1,
        user_id,
        text: text.to_string(),
        language_code: Some("en".into()),
        reply_to_text: None,
    }
}

fn dispatcher(ctx: &Arc<ExecutionContext>, scheduler: &Arc<Scheduler>) -> CommandDispatcher {
    let cancellation = Arc::new(CancellationController::new(
        Arc::clone(scheduler),
        Arc::clone(&ctx.backend),
        Arc::clone(ctx.renderer.channel()),
        Arc::clone(&ctx.localizer),
        [99],
    ));
    CommandDispatcher::new(
        Arc::clone(scheduler),
        Arc::clone(ctx),
        cancellation,
        HashMap::new(),
    )
}

fn task(target: MessageTarget, model: &str, max_duration: Option<Duration>) -> ExecutionTask {
    ExecutionTask {
        requester_id: 1,
        target,
        model: model.to_string(),
        prompt: "hi".into(),
        temperature: 0.7,
        max_duration,
        thinking_mode: ThinkingMode::Hide,
        locale: None,
    }
}

#[tokio::test]
async fn test_ask_streams_into_one_message() {
    let mut server = mockito::Server::new_async().await;
    let generate = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({
            "model": "llama3.2",
            "prompt": "hi",
            "stream": true,
            "keep_alive": "30m",
        })))
        .with_status(200)
        .with_header("content-type", "application/x-ndjson")
        .with_body(concat!(
            "{\"response\":\"Hel\",\"done\":false}\n",
            "{\"response\":\"lo\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
        ))
        .expect(1)
        .create_async()
        .await;

    let channel = Arc::new(RecordingChannel::new());
    let store = Arc::new(InMemoryUserStore::new());
    let ctx = test_context(&server.url(), channel.clone(), store.clone());
    let scheduler = Scheduler::new(3);
    let dispatcher = dispatcher(&ctx, &scheduler);

    dispatcher.dispatch(message(10, 1, "/ask hi")).await;
    wait_until("task to complete", || scheduler.inspect().counters.completed == 1).await;
    wait_until("renders to settle", || ctx.renderer.tracked_messages() == 0).await;
    generate.assert_async().await;

    let sends = channel.sends();
    assert_eq!(sends.len(), 1, "only the placeholder is sent");
    assert_eq!(sends[0].text, "⏳ Request received…");

    let target = MessageTarget::new(10, sends[0].message_id);
    let edits = channel.edit_texts(target);
    assert_eq!(edits.first().map(String::as_str), Some("⏳ Generating with llama3.2…"));
    assert_eq!(
        edits.last().map(String::as_str),
        Some("Hello\n\n✅ Done · llama3.2")
    );

    let usage = store.usage(1).await.unwrap();
    assert_eq!(usage.requests, 1);
    assert_eq!(usage.characters, 2 + 5);
}

#[tokio::test]
async fn test_second_requester_gets_queue_position() {
    let backend = StallingBackend::start("thinking about it").await;
    let channel = Arc::new(RecordingChannel::new());
    let ctx = test_context(&backend.url, channel.clone(), seeded_store(&[]));
    let scheduler = Scheduler::new(3);
    let dispatcher = dispatcher(&ctx, &scheduler);

    dispatcher.dispatch(message(10, 1, "/ask first")).await;
    dispatcher.dispatch(message(20, 2, "/ask second")).await;

    let replies: Vec<_> = channel
        .sends()
        .into_iter()
        .filter(|c| c.chat_id == 20)
        .map(|c| c.text)
        .collect();
    assert_eq!(
        replies,
        vec!["⏳ Request received…", "🕒 Your request is queued at position 1."]
    );
    assert_eq!(scheduler.pending_len(), 1);

    // 停止第一个请求后第二个开始执行
    dispatcher.dispatch(message(10, 1, "/stop")).await;
    wait_until("second request to start", || {
        backend.generate_bodies().iter().any(|b| b["prompt"] == "second")
    })
    .await;
    assert!(backend.unloads().contains(&"llama3.2".to_string()));
    assert!(channel
        .sends()
        .iter()
        .any(|c| c.chat_id == 10 && c.text == "🛑 Your request was stopped."));

    scheduler.purge(2);
}

#[tokio::test]
async fn test_missing_model_is_pulled_once() {
    let mut server = mockito::Server::new_async().await;
    let generate = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({ "model": "ghost", "stream": true })))
        .with_status(404)
        .with_body(r#"{"error":"model \"ghost\" not found, try pulling it first"}"#)
        .expect(1)
        .create_async()
        .await;
    let pull = server
        .mock("POST", "/api/pull")
        .match_body(Matcher::Json(json!({ "model": "ghost", "stream": false })))
        .with_status(200)
        .with_body(r#"{"status":"success"}"#)
        .expect(1)
        .create_async()
        .await;

    let channel = Arc::new(RecordingChannel::new());
    let ctx = test_context(&server.url(), channel.clone(), seeded_store(&[]));
    let target = MessageTarget::new(10, 500);

    task(target, "ghost", None)
        .run(Arc::clone(&ctx), CancellationToken::new())
        .await
        .unwrap();
    wait_until("renders to settle", || ctx.renderer.tracked_messages() == 0).await;

    generate.assert_async().await;
    pull.assert_async().await;
    let edits = channel.edit_texts(target);
    assert_eq!(
        edits.last().map(String::as_str),
        Some("✅ Model ghost is ready. Please send your request again.")
    );
}

#[tokio::test]
async fn test_timeout_flushes_partial_text_and_unloads() {
    let backend = StallingBackend::start("partial answer").await;
    let channel = Arc::new(RecordingChannel::new());
    let store = seeded_store(&[]);
    let ctx = test_context(&backend.url, channel.clone(), store.clone());
    let target = MessageTarget::new(10, 500);

    task(target, "llama3.2", Some(Duration::from_secs(1)))
        .run(Arc::clone(&ctx), CancellationToken::new())
        .await
        .unwrap();
    wait_until("renders to settle", || ctx.renderer.tracked_messages() == 0).await;

    assert_eq!(
        channel.edit_texts(target).last().map(String::as_str),
        Some("partial answer\n\n⏱️ Stopped after 1s (time limit reached).")
    );
    assert_eq!(backend.unloads(), vec!["llama3.2".to_string()]);

    let usage = store.usage(1).await.unwrap();
    assert_eq!(usage.characters, 2 + "partial answer".chars().count() as u64);
}

#[tokio::test]
async fn test_cancel_discards_partial_output() {
    let backend = StallingBackend::start("never shown").await;
    let channel = Arc::new(RecordingChannel::new());
    let ctx = test_context(&backend.url, channel.clone(), seeded_store(&[]));
    let target = MessageTarget::new(10, 500);
    let abort = CancellationToken::new();

    let run = tokio::spawn(task(target, "llama3.2", None).run(Arc::clone(&ctx), abort.clone()));
    wait_until("generation to start", || !backend.generate_bodies().is_empty()).await;
    abort.cancel();

    let result = run.await.unwrap();
    assert_matches!(result, Err(RelayError::Cancelled));
    assert!(!ctx.renderer.has_pending(target));
}

#[tokio::test]
async fn test_stalled_size_lookup_respects_time_limit() {
    let backend = StallingBackend::start_with_stalled_show("unused").await;
    let channel = Arc::new(RecordingChannel::new());
    let ctx = test_context(&backend.url, channel.clone(), seeded_store(&[]));
    let target = MessageTarget::new(10, 500);
    let started = Instant::now();

    task(target, "llama3.2", Some(Duration::from_secs(1)))
        .run(Arc::clone(&ctx), CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    wait_until("renders to settle", || ctx.renderer.tracked_messages() == 0).await;

    assert_eq!(
        channel.edit_texts(target).last().map(String::as_str),
        Some("⏱️ Stopped after 1s (time limit reached).")
    );
    assert!(backend.generate_bodies().is_empty());
    assert_eq!(backend.unloads(), vec!["llama3.2".to_string()]);
}

#[tokio::test]
async fn test_stalled_size_lookup_can_be_cancelled() {
    let backend = StallingBackend::start_with_stalled_show("unused").await;
    let channel = Arc::new(RecordingChannel::new());
    let ctx = test_context(&backend.url, channel.clone(), seeded_store(&[]));
    let target = MessageTarget::new(10, 500);
    let abort = CancellationToken::new();
    let started = Instant::now();

    let run = tokio::spawn(task(target, "llama3.2", None).run(Arc::clone(&ctx), abort.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    abort.cancel();

    assert_matches!(run.await.unwrap(), Err(RelayError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(backend.generate_bodies().is_empty());
}

#[tokio::test]
async fn test_backend_error_is_rendered_sanitized() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/generate")
        .with_status(500)
        .with_body(r#"{"error":"runner crashed, see http://10.0.0.5:11434/logs for details"}"#)
        .expect(1)
        .create_async()
        .await;

    let channel = Arc::new(RecordingChannel::new());
    let ctx = test_context(&server.url(), channel.clone(), seeded_store(&[]));
    let target = MessageTarget::new(10, 500);

    let result = task(target, "llama3.2", None)
        .run(Arc::clone(&ctx), CancellationToken::new())
        .await;
    assert!(result.is_ok());
    wait_until("renders to settle", || ctx.renderer.tracked_messages() == 0).await;

    let edits = channel.edit_texts(target);
    let errors: Vec<_> = edits.iter().filter(|t| t.starts_with("❌")).collect();
    assert_eq!(errors.len(), 1, "{:?}", edits);
    let last = edits.last().unwrap();
    assert!(last.starts_with("❌ Backend error:"), "{}", last);
    assert!(last.contains("runner crashed"), "{}", last);
    assert!(last.contains("<backend>"), "{}", last);
    assert!(!last.contains("10.0.0.5"), "{}", last);
}

#[tokio::test]
async fn test_failed_pull_is_reported() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/generate")
        .with_status(404)
        .with_body(r#"{"error":"model \"ghost\" not found, try pulling it first"}"#)
        .expect(1)
        .create_async()
        .await;
    let pull = server
        .mock("POST", "/api/pull")
        .with_status(500)
        .with_body(r#"{"error":"pull model manifest: file does not exist"}"#)
        .expect(1)
        .create_async()
        .await;

    let channel = Arc::new(RecordingChannel::new());
    let ctx = test_context(&server.url(), channel.clone(), seeded_store(&[]));
    let target = MessageTarget::new(10, 500);

    task(target, "ghost", None)
        .run(Arc::clone(&ctx), CancellationToken::new())
        .await
        .unwrap();
    wait_until("renders to settle", || ctx.renderer.tracked_messages() == 0).await;

    pull.assert_async().await;
    let edits = channel.edit_texts(target);
    let last = edits.last().unwrap();
    assert!(last.starts_with("❌ Could not download ghost:"), "{}", last);
    assert!(last.contains("file does not exist"), "{}", last);
}

#[tokio::test]
async fn test_keep_alive_follows_model_size() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/show")
        .match_body(Matcher::PartialJson(json!({ "model": "tiny" })))
        .with_status(200)
        .with_body(r#"{"details":{"parameter_size":"270M"}}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/api/show")
        .match_body(Matcher::PartialJson(json!({ "model": "mystery" })))
        .with_status(200)
        .with_body(r#"{"details":{}}"#)
        .create_async()
        .await;
    let tiny = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({ "model": "tiny", "keep_alive": 0 })))
        .with_status(200)
        .with_body("{\"response\":\"ok\",\"done\":true}\n")
        .expect(1)
        .create_async()
        .await;
    let mystery = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({ "model": "mystery", "keep_alive": "30m" })))
        .with_status(200)
        .with_body("{\"response\":\"ok\",\"done\":true}\n")
        .expect(1)
        .create_async()
        .await;

    let channel = Arc::new(RecordingChannel::new());
    let ctx = test_context(&server.url(), channel.clone(), seeded_store(&[]));

    task(MessageTarget::new(10, 500), "tiny", None)
        .run(Arc::clone(&ctx), CancellationToken::new())
        .await
        .unwrap();
    task(MessageTarget::new(10, 501), "mystery", None)
        .run(Arc::clone(&ctx), CancellationToken::new())
        .await
        .unwrap();

    tiny.assert_async().await;
    mystery.assert_async().await;
}
