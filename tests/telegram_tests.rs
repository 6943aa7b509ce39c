//! Telegram 通道测试（mockito 模拟 Bot API）

use std::time::Duration;

use assert_matches::assert_matches;
use mockito::Matcher;
use serde_json::json;

use relay_bot_lib::channel::ChatChannel;
use relay_bot_lib::error::ChannelError;
use relay_bot_lib::models::{MessageTarget, ParseMode};
use relay_bot_lib::telegram::TelegramChannel;

#[tokio::test]
async fn test_send_message_returns_message_id() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/botTOKEN/sendMessage")
        .match_body(Matcher::PartialJson(json!({
            "chat_id": 42,
            "text": "hello",
            "parse_mode": "Markdown",
        })))
        .with_status(200)
        .with_body(r#"{"ok":true,"result":{"message_id":77,"chat":{"id":42},"text":"hello"}}"#)
        .create_async()
        .await;

    let channel = TelegramChannel::new(&server.url(), "TOKEN").unwrap();
    let id = channel
        .send_message(42, "hello", Some(ParseMode::Markdown))
        .await
        .unwrap();
    assert_eq!(id, 77);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_edit_errors_are_classified() {
    let mut server = mockito::Server::new_async().await;
    let target = MessageTarget::new(42, 77);

    let limited = server
        .mock("POST", "/botTOKEN/editMessageText")
        .match_body(Matcher::PartialJson(json!({ "text": "rate" })))
        .with_status(429)
        .with_body(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 3","parameters":{"retry_after":3}}"#,
        )
        .create_async()
        .await;
    server
        .mock("POST", "/botTOKEN/editMessageText")
        .match_body(Matcher::PartialJson(json!({ "text": "same" })))
        .with_status(400)
        .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: message is not modified"}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/botTOKEN/editMessageText")
        .match_body(Matcher::PartialJson(json!({ "text": "*broken" })))
        .with_status(400)
        .with_body(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: can't parse entities: Can't find end of the entity starting at byte offset 0"}"#,
        )
        .create_async()
        .await;

    let channel = TelegramChannel::new(&server.url(), "TOKEN").unwrap();

    let err = channel.edit_message_text(target, "rate", None).await.unwrap_err();
    assert_eq!(
        err,
        ChannelError::TooManyRequests {
            retry_after: Duration::from_secs(3)
        }
    );
    limited.assert_async().await;

    let err = channel.edit_message_text(target, "same", None).await.unwrap_err();
    assert_eq!(err, ChannelError::MessageNotModified);

    let err = channel
        .edit_message_text(target, "*broken", Some(ParseMode::Markdown))
        .await
        .unwrap_err();
    assert_matches!(err, ChannelError::CantParseEntities(_));
}

#[tokio::test]
async fn test_get_updates_parses_messages() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/botTOKEN/getUpdates")
        .match_body(Matcher::PartialJson(json!({ "offset": 11, "timeout": 0 })))
        .with_status(200)
        .with_body(
            json!({
                "ok": true,
                "result": [
                    { "update_id": 11, "message": {
                        "message_id": 3, "chat": { "id": 5 },
                        "from": { "id": 6, "language_code": "en" }, "text": "/queue" } },
                    { "update_id": 12 }
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let channel = TelegramChannel::new(&server.url(), "TOKEN").unwrap();
    let updates = channel.get_updates(Some(11), 0).await.unwrap();
    assert_eq!(updates.len(), 2);
    let incoming = updates[0].clone().message.and_then(|m| m.into_incoming()).unwrap();
    assert_eq!(incoming.text, "/queue");
    assert_eq!(incoming.user_id, 6);
    assert!(updates[1].message.is_none());
}
