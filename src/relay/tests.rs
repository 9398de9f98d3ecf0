use super::*;
use crate::store::TenantConfig;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Clone, Default)]
struct RecordingSink {
    flushes: Arc<Mutex<Vec<(String, bool)>>>,
}

#[async_trait]
impl EditSink for RecordingSink {
    async fn flush(&self, content: &str, is_final: bool) -> SwitchboardResult<()> {
        self.flushes
            .lock()
            .unwrap()
            .push((content.to_string(), is_final));
        Ok(())
    }
}

fn tenant() -> TenantConfig {
    let mut cfg = TenantConfig::new("T1", "xoxb", "secret");
    cfg.api_token = Some("api-token".into());
    cfg.model_id = Some("test-model".into());
    cfg
}

fn sse_body(deltas: &[&str], done: bool) -> String {
    let mut body = String::new();
    for d in deltas {
        let frame = serde_json::json!({
            "choices": [{"delta": {"content": d}}]
        });
        body.push_str(&format!("data: {}\n\n", frame));
    }
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

#[tokio::test]
async fn editor_throttles_intermediate_flushes() {
    let sink = RecordingSink::default();
    let flushes = sink.flushes.clone();
    // Large throttle: only the immediate first flush plus the final one.
    let mut editor = StreamingEditor::with_throttle(sink, Duration::from_secs(60));

    for i in 0..50 {
        editor.push_delta(&format!("d{} ", i)).await;
    }
    editor.finalize().await.unwrap();

    let recorded = flushes.lock().unwrap();
    // duration/interval + 1 with duration << interval: at most 2 flushes
    assert!(recorded.len() <= 2, "got {} flushes", recorded.len());
    let (last, is_final) = recorded.last().unwrap().clone();
    assert!(is_final);
    // Exact concatenation of all deltas, no cursor
    let expected: String = (0..50).map(|i| format!("d{} ", i)).collect();
    assert_eq!(last, expected);
}

#[tokio::test]
async fn intermediate_flush_carries_cursor_final_does_not() {
    let sink = RecordingSink::default();
    let flushes = sink.flushes.clone();
    // Zero throttle: every delta flushes.
    let mut editor = StreamingEditor::with_throttle(sink, Duration::from_millis(0));

    editor.push_delta("hel").await;
    editor.push_delta("lo").await;
    editor.finalize().await.unwrap();

    let recorded = flushes.lock().unwrap();
    assert_eq!(recorded.len(), 3);
    assert_eq!(recorded[0].0, format!("hel{}", CURSOR));
    assert_eq!(recorded[1].0, format!("hello{}", CURSOR));
    assert_eq!(recorded[2].0, "hello");
    assert!(recorded[2].1);
}

#[tokio::test]
async fn streaming_respond_accumulates_deltas_and_drives_editor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer api-token"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&["Hello", ", ", "world"], true)),
        )
        .mount(&server)
        .await;

    let mut cfg = tenant();
    cfg.api_base_url = Some(server.uri());
    let relay = GenerationRelay::new("http://unused.invalid", "fallback-model");

    let sink = RecordingSink::default();
    let flushes = sink.flushes.clone();
    let mut editor = StreamingEditor::with_throttle(sink, Duration::from_millis(0));

    let text = relay
        .respond(&[], &[], &cfg, Some(&mut editor))
        .await
        .unwrap();
    assert_eq!(text, "Hello, world");

    let recorded = flushes.lock().unwrap();
    let (final_text, is_final) = recorded.last().unwrap().clone();
    assert!(is_final);
    assert_eq!(final_text, "Hello, world");
}

#[tokio::test]
async fn stream_ending_without_done_returns_partial() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(sse_body(&["partial answer"], false)),
        )
        .mount(&server)
        .await;

    let mut cfg = tenant();
    cfg.api_base_url = Some(server.uri());
    let relay = GenerationRelay::new("http://unused.invalid", "m");

    let text = relay
        .respond::<RecordingSink>(&[], &[], &cfg, None)
        .await
        .unwrap();
    assert_eq!(text, "partial answer");
}

#[tokio::test]
async fn empty_stream_escalates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("data: [DONE]\n\n"))
        .mount(&server)
        .await;

    let mut cfg = tenant();
    cfg.api_base_url = Some(server.uri());
    let relay = GenerationRelay::new("http://unused.invalid", "m");

    let err = relay
        .respond::<RecordingSink>(&[], &[], &cfg, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SwitchboardError::Inference { .. }));
}

#[tokio::test]
async fn non_streaming_tenant_gets_single_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"stream\":false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "full answer"}}]
        })))
        .mount(&server)
        .await;

    let mut cfg = tenant();
    cfg.api_base_url = Some(server.uri());
    cfg.behavior.streaming = false;
    let relay = GenerationRelay::new("http://unused.invalid", "m");

    let text = relay
        .respond::<RecordingSink>(&[], &[], &cfg, None)
        .await
        .unwrap();
    assert_eq!(text, "full answer");
}

#[tokio::test]
async fn server_error_is_retryable_inference_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut cfg = tenant();
    cfg.api_base_url = Some(server.uri());
    let relay = GenerationRelay::new("http://unused.invalid", "m");

    let err = relay
        .respond::<RecordingSink>(&[], &[], &cfg, None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn missing_api_token_fails_without_network() {
    let mut cfg = tenant();
    cfg.api_token = None;
    let relay = GenerationRelay::new("http://unused.invalid", "m");
    let err = relay
        .respond::<RecordingSink>(&[], &[], &cfg, None)
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
}

#[test]
fn tenant_model_and_base_url_override_defaults() {
    let relay = GenerationRelay::new("https://default.example/v1", "default-model");
    let mut cfg = tenant();
    cfg.api_base_url = Some("https://tenant.example/v2/".into());
    assert_eq!(relay.endpoint(&cfg), "https://tenant.example/v2/chat/completions");

    let body = relay.request_body(&[], &[], &cfg, true);
    assert_eq!(body["model"], "test-model");

    cfg.model_id = None;
    cfg.api_base_url = None;
    assert_eq!(relay.endpoint(&cfg), "https://default.example/v1/chat/completions");
    let body = relay.request_body(&[], &[], &cfg, false);
    assert_eq!(body["model"], "default-model");
}

#[test]
fn attached_images_become_structured_parts() {
    let relay = GenerationRelay::new("https://default.example/v1", "m");
    let prompt = vec![
        PromptMessage {
            role: "system".into(),
            content: "sys".into(),
        },
        PromptMessage {
            role: "user".into(),
            content: "what is in this picture?".into(),
        },
    ];
    let media = vec![MediaPart {
        url: "https://files.example/shot.png".into(),
    }];

    let body = relay.request_body(&prompt, &media, &tenant(), true);
    let content = &body["messages"][1]["content"];
    assert_eq!(content[0]["type"], "text");
    assert_eq!(content[0]["text"], "what is in this picture?");
    assert_eq!(content[1]["type"], "image_url");
    assert_eq!(content[1]["image_url"]["url"], "https://files.example/shot.png");
    // The system message stays a plain string.
    assert_eq!(body["messages"][0]["content"], "sys");
}

#[test]
fn text_only_request_keeps_string_content() {
    let relay = GenerationRelay::new("https://default.example/v1", "m");
    let prompt = vec![PromptMessage {
        role: "user".into(),
        content: "hi".into(),
    }];
    let body = relay.request_body(&prompt, &[], &tenant(), false);
    assert_eq!(body["messages"][0]["content"], "hi");
}
