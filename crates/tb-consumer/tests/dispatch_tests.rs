//! Outbound dispatch tests against a mocked provider API.
//!
//! Covers payload rendering for every message shape, claim header handling,
//! media upload caching, field-length limits, and the 404 contact recovery
//! path.

use std::time::Duration;

use serde_json::{json, Value};
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tb_claims::ClaimRegistry;
use tb_common::{Message, SessionEvent, TransportType};
use tb_consumer::{OutboundDispatcher, SubmitOutcome, TurnApiClient, TurnApiConfig};

fn test_client(mock_uri: &str) -> TurnApiClient {
    let config = TurnApiConfig {
        base_url: Url::parse(mock_uri).unwrap(),
        api_token: Some("test-token".to_string()),
        timeout: Duration::from_secs(5),
        concurrency: 4,
    };
    TurnApiClient::new(config).unwrap()
}

fn test_dispatcher(mock_uri: &str) -> OutboundDispatcher {
    OutboundDispatcher::new(test_client(mock_uri), None)
}

async fn connect_redis() -> Option<redis::aio::ConnectionManager> {
    let client = redis::Client::open(
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
    )
    .ok()?;
    tokio::time::timeout(
        Duration::from_secs(2),
        redis::aio::ConnectionManager::new(client),
    )
    .await
    .ok()?
    .ok()
}

async fn claims_entries(conn: &redis::aio::ConnectionManager, key: &str) -> Vec<String> {
    let mut conn = conn.clone();
    redis::cmd("ZRANGE")
        .arg(key)
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap()
}

fn outbound_message(to_addr: &str) -> Message {
    Message::new(to_addr, "27820000000", "whatsapp", TransportType::HttpApi)
}

async fn last_request_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.unwrap();
    serde_json::from_slice(&requests.last().unwrap().body).unwrap()
}

#[tokio::test]
async fn text_message_extends_the_claim() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("X-Turn-Claim-Extend", "test-claim"))
        .and(header("Authorization", "Bearer test-token"))
        .and(body_json(json!({
            "to": "27820001001",
            "text": {"body": "test message"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test message".to_string());
    message
        .transport_metadata
        .insert("claim".to_string(), json!("test-claim"));

    let outcome = test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Sent);
}

#[tokio::test]
async fn close_releases_the_claim() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("X-Turn-Claim-Release", "test-claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test message".to_string());
    message.session_event = SessionEvent::Close;
    message
        .transport_metadata
        .insert("claim".to_string(), json!("test-claim"));

    let outcome = test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Sent);
}

#[tokio::test]
async fn close_with_automation_handle_reevaluates_the_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages/message-id/automation"))
        .and(header("X-Turn-Claim-Release", "test-claim"))
        .and(header("Accept", "application/vnd.v1+json"))
        .and(body_json(json!({
            "to": "27820001001",
            "text": {"body": "test message"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test message".to_string());
    message.session_event = SessionEvent::Close;
    message.in_reply_to = Some("message-id".to_string());
    message
        .transport_metadata
        .insert("claim".to_string(), json!("test-claim"));
    message
        .helper_metadata
        .insert("automation_handle".to_string(), json!(true));

    let outcome = test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Sent);
}

#[tokio::test]
async fn extending_a_claim_stores_the_recipient() {
    let Some(conn) = connect_redis().await else {
        eprintln!("skipping: redis not available");
        return;
    };
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let claims_key = format!("test:claims:{}", uuid::Uuid::new_v4().simple());
    let dispatcher = OutboundDispatcher::new(
        test_client(&server.uri()),
        Some(ClaimRegistry::with_key(conn.clone(), &claims_key)),
    );

    let mut message = outbound_message("27820001001");
    message.content = Some("hi".to_string());
    message
        .transport_metadata
        .insert("claim".to_string(), json!("C"));

    dispatcher.submit_message(&message).await.unwrap();
    assert_eq!(
        claims_entries(&conn, &claims_key).await,
        vec!["27820001001".to_string()]
    );
}

#[tokio::test]
async fn closing_a_session_releases_the_claim() {
    let Some(conn) = connect_redis().await else {
        eprintln!("skipping: redis not available");
        return;
    };
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let claims_key = format!("test:claims:{}", uuid::Uuid::new_v4().simple());
    let registry = ClaimRegistry::with_key(conn.clone(), &claims_key);
    registry.store(Some("C"), "27820001001").await.unwrap();

    let dispatcher =
        OutboundDispatcher::new(test_client(&server.uri()), Some(registry));

    let mut message = outbound_message("27820001001");
    message.content = Some("bye".to_string());
    message.session_event = SessionEvent::Close;
    message
        .transport_metadata
        .insert("claim".to_string(), json!("C"));

    dispatcher.submit_message(&message).await.unwrap();
    assert!(claims_entries(&conn, &claims_key).await.is_empty());
}

#[tokio::test]
async fn missing_content_renders_an_empty_text_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({"to": "27820001001", "text": {"body": ""}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = test_dispatcher(&server.uri())
        .submit_message(&outbound_message("27820001001"))
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Sent);
}

#[tokio::test]
async fn client_errors_are_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001003");
    message.content = Some("test message 2".to_string());

    let err = test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let err = test_dispatcher(&server.uri())
        .submit_message(&outbound_message("27820001001"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn document_is_uploaded_once_and_cached() {
    let provider = MockServer::start().await;
    let media_source = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test_document.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("test_document", "application/pdf"),
        )
        .expect(1)
        .mount(&media_source)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/media"))
        .and(header("Content-Type", "application/pdf"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"media": [{"id": "test-media-id"}]})),
        )
        .expect(1)
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({
            "to": "27820001001",
            "type": "document",
            "document": {"id": "test-media-id", "filename": "test_document.pdf"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&provider)
        .await;

    let dispatcher = test_dispatcher(&provider.uri());
    let mut message = outbound_message("27820001001");
    message.helper_metadata.insert(
        "document".to_string(),
        json!(format!("{}/test_document.pdf", media_source.uri())),
    );

    // First delivery uploads, the second is served from the cache.
    dispatcher.submit_message(&message).await.unwrap();
    dispatcher.submit_message(&message).await.unwrap();
}

#[tokio::test]
async fn image_caption_comes_from_the_content() {
    let provider = MockServer::start().await;
    let media_source = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test_image.jpeg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("test_image", "image/jpeg"),
        )
        .mount(&media_source)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/media"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"media": [{"id": "test-media-id"}]})),
        )
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({
            "to": "27820001001",
            "type": "image",
            "image": {"id": "test-media-id", "caption": "test caption"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&provider)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test caption".to_string());
    message.helper_metadata.insert(
        "image".to_string(),
        json!(format!("{}/test_image.jpeg", media_source.uri())),
    );

    test_dispatcher(&provider.uri())
        .submit_message(&message)
        .await
        .unwrap();
}

#[tokio::test]
async fn image_without_content_has_no_caption() {
    let provider = MockServer::start().await;
    let media_source = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test_image.jpeg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("test_image", "image/jpeg"),
        )
        .mount(&media_source)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/media"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"media": [{"id": "test-media-id"}]})),
        )
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({
            "to": "27820001001",
            "type": "image",
            "image": {"id": "test-media-id"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&provider)
        .await;

    let mut message = outbound_message("27820001001");
    message.helper_metadata.insert(
        "image".to_string(),
        json!(format!("{}/test_image.jpeg", media_source.uri())),
    );

    test_dispatcher(&provider.uri())
        .submit_message(&message)
        .await
        .unwrap();
}

#[tokio::test]
async fn buttons_with_text_header_and_footer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({
            "to": "27820001001",
            "type": "interactive",
            "interactive": {
                "type": "button",
                "body": {"text": "test body"},
                "action": {
                    "buttons": [
                        {"type": "reply", "reply": {"id": "button1", "title": "button1"}},
                        {"type": "reply", "reply": {"id": "button2", "title": "button2"}},
                        {"type": "reply", "reply": {"id": "button3", "title": "button3"}},
                    ],
                },
                "header": {"type": "text", "text": "test header"},
                "footer": {"text": "test footer"},
            },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test body".to_string());
    message
        .helper_metadata
        .insert("buttons".to_string(), json!(["button1", "button2", "button3"]));
    message
        .helper_metadata
        .insert("header".to_string(), json!("test header"));
    message
        .helper_metadata
        .insert("footer".to_string(), json!("test footer"));

    test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();
}

#[tokio::test]
async fn buttons_media_header_is_typed_by_content_type() {
    let provider = MockServer::start().await;
    let media_source = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/image.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("png-bytes", "image/png"),
        )
        .mount(&media_source)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/media"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"media": [{"id": "test-media-id"}]})),
        )
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({
            "to": "27820001001",
            "type": "interactive",
            "interactive": {
                "type": "button",
                "body": {"text": "test body"},
                "action": {
                    "buttons": [
                        {"type": "reply", "reply": {"id": "button1", "title": "button1"}},
                    ],
                },
                "header": {"type": "image", "image": {"id": "test-media-id"}},
            },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&provider)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test body".to_string());
    message
        .helper_metadata
        .insert("buttons".to_string(), json!(["button1"]));
    message.helper_metadata.insert(
        "header".to_string(),
        json!(format!("{}/image.png", media_source.uri())),
    );

    test_dispatcher(&provider.uri())
        .submit_message(&message)
        .await
        .unwrap();
}

#[tokio::test]
async fn buttons_document_header_includes_a_filename() {
    let provider = MockServer::start().await;
    let media_source = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/document.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("pdf-bytes", "application/pdf"),
        )
        .mount(&media_source)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/media"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"media": [{"id": "test-media-id"}]})),
        )
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({
            "to": "27820001001",
            "type": "interactive",
            "interactive": {
                "type": "button",
                "body": {"text": "test body"},
                "action": {
                    "buttons": [
                        {"type": "reply", "reply": {"id": "button1", "title": "button1"}},
                    ],
                },
                "header": {
                    "type": "document",
                    "document": {"id": "test-media-id", "filename": "document.pdf"},
                },
            },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&provider)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test body".to_string());
    message
        .helper_metadata
        .insert("buttons".to_string(), json!(["button1"]));
    message.helper_metadata.insert(
        "header".to_string(),
        json!(format!("{}/document.pdf", media_source.uri())),
    );

    test_dispatcher(&provider.uri())
        .submit_message(&message)
        .await
        .unwrap();
}

#[tokio::test]
async fn list_message_with_header_and_footer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({
            "to": "27820001001",
            "type": "interactive",
            "interactive": {
                "type": "list",
                "body": {"text": "test body"},
                "action": {
                    "button": "test button",
                    "sections": [{
                        "title": "s1",
                        "rows": [{"id": "r1", "title": "row1", "description": "row 1"}],
                    }],
                },
                "header": {"type": "text", "text": "test header"},
                "footer": {"text": "test footer"},
            },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test body".to_string());
    message
        .helper_metadata
        .insert("button".to_string(), json!("test button"));
    message.helper_metadata.insert(
        "sections".to_string(),
        json!([{
            "title": "s1",
            "rows": [{"id": "r1", "title": "row1", "description": "row 1"}],
        }]),
    );
    message
        .helper_metadata
        .insert("header".to_string(), json!("test header"));
    message
        .helper_metadata
        .insert("footer".to_string(), json!("test footer"));

    test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();
}

#[tokio::test]
async fn list_fields_are_truncated_to_provider_limits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test body ".repeat(150));
    message
        .helper_metadata
        .insert("button".to_string(), json!("test button ".repeat(10)));
    message.helper_metadata.insert(
        "sections".to_string(),
        json!([{
            "title": "s1",
            "rows": [{
                "id": "id ".repeat(200),
                "title": "title ".repeat(6),
                "description": "row 1",
            }],
        }]),
    );
    message
        .helper_metadata
        .insert("header".to_string(), json!("test header".repeat(7)));
    message
        .helper_metadata
        .insert("footer".to_string(), json!("test footer".repeat(7)));

    test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();

    let body = last_request_body(&server).await;
    let interactive = &body["interactive"];
    let action = &interactive["action"];
    assert_eq!(action["button"].as_str().unwrap().chars().count(), 20);
    let row = &action["sections"][0]["rows"][0];
    assert_eq!(row["id"].as_str().unwrap().chars().count(), 200);
    assert_eq!(row["title"].as_str().unwrap().chars().count(), 24);
    assert_eq!(interactive["body"]["text"].as_str().unwrap().chars().count(), 1024);
    assert_eq!(interactive["header"]["text"].as_str().unwrap().chars().count(), 60);
    assert_eq!(interactive["footer"]["text"].as_str().unwrap().chars().count(), 60);
}

#[tokio::test]
async fn at_most_three_buttons_are_rendered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test body".to_string());
    message.helper_metadata.insert(
        "buttons".to_string(),
        json!(["button1", "button2", "button3", "button4"]),
    );

    test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();

    let body = last_request_body(&server).await;
    let buttons = body["interactive"]["action"]["buttons"].as_array().unwrap();
    assert_eq!(buttons.len(), 3);
}

#[tokio::test]
async fn missing_contact_retries_once_after_a_valid_probe() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/contacts"))
        .and(body_json(json!({
            "blocking": "wait",
            "contacts": ["+27820001001"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contacts": [{"wa_id": "27820001001", "input": "+27820001001", "status": "valid"}],
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_json(json!({
            "to": "27820001001",
            "text": {"body": "test message"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001001");
    message.content = Some("test message".to_string());

    let outcome = test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Sent);
}

#[tokio::test]
async fn missing_contact_with_invalid_probe_drops_the_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/contacts"))
        .and(body_json(json!({
            "blocking": "wait",
            "contacts": ["+27820001111"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contacts": [{"wa_id": "27820001111", "input": "+27820001111", "status": "invalid"}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut message = outbound_message("27820001111");
    message.content = Some("test message".to_string());

    let outcome = test_dispatcher(&server.uri())
        .submit_message(&message)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Discarded);
}
