use super::*;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn auth_test_resolves_identity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth.test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "team_id": "W123",
            "user_id": "B999",
            "user": "switchboard"
        })))
        .mount(&server)
        .await;

    let client = ChatClient::with_base_url(server.uri());
    let identity = client.auth_test("xoxb-test").await.unwrap();
    assert_eq!(identity.team_id, "W123");
    assert_eq!(identity.bot_user_id, "B999");
}

#[tokio::test]
async fn post_message_returns_ts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .and(body_string_contains("channel=D1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "ts": "1700.42"
        })))
        .mount(&server)
        .await;

    let client = ChatClient::with_base_url(server.uri());
    let ts = client.post_message("xoxb-test", "D1", "hello", None).await.unwrap();
    assert_eq!(ts, "1700.42");
}

#[tokio::test]
async fn thread_reply_carries_thread_ts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .and(body_string_contains("thread_ts=1700.1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "ts": "1700.43"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::with_base_url(server.uri());
    client
        .post_message("xoxb-test", "C1", "reply", Some("1700.1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn platform_level_error_becomes_typed_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat.update"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": false,
            "error": "message_not_found"
        })))
        .mount(&server)
        .await;

    let client = ChatClient::with_base_url(server.uri());
    let err = client
        .update_message("xoxb-test", "C1", "1.2", "text")
        .await
        .unwrap_err();
    match err {
        SwitchboardError::Platform(msg) => assert!(msg.contains("message_not_found")),
        other => panic!("expected platform error, got {:?}", other),
    }
}
