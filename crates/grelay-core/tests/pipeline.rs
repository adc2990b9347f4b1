use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::{json, Value as JsonValue};

use grelay_accounts::{
    Account, AccountPool, AccountRecord, RefreshError, RefreshedToken, TokenRefresher,
};
use grelay_core::pipeline::{Pipeline, PipelineOutput};
use grelay_core::translate;
use grelay_core::upstream::{
    TransportError, TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamRequest,
    UpstreamResponse,
};
use grelay_core::{RelayError, RequestEnvelope};

const BASE_URL: &str = "https://codeassist.test";

struct NeverRefresher;

#[async_trait::async_trait]
impl TokenRefresher for NeverRefresher {
    async fn refresh(&self, _record: &AccountRecord) -> Result<RefreshedToken, RefreshError> {
        Err(RefreshError::Transport(
            "refresh not expected in this test".to_string(),
        ))
    }
}

#[derive(Debug)]
enum Scripted {
    Json(u16, JsonValue),
    Stream(Vec<&'static str>),
    Transport,
}

#[derive(Debug, Clone)]
struct RecordedCall {
    method: String,
    bearer: String,
    body: JsonValue,
}

#[derive(Default)]
struct StubClient {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubClient {
    fn new() -> Arc<Self> {
        Arc::new(StubClient::default())
    }

    fn script(&self, method: &str, response: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }

    fn calls_for(&self, method: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }
}

fn method_of(url: &str) -> String {
    let tail = url.split("v1internal:").nth(1).unwrap_or(url);
    tail.split('?').next().unwrap_or(tail).to_string()
}

impl UpstreamClient for StubClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let method = method_of(&req.url);
            self.calls.lock().unwrap().push(RecordedCall {
                method: method.clone(),
                bearer: req.bearer.clone(),
                body: serde_json::from_slice(&req.body).unwrap_or(JsonValue::Null),
            });

            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&method)
                .and_then(VecDeque::pop_front);

            match scripted {
                Some(Scripted::Json(status, body)) => Ok(UpstreamResponse {
                    status,
                    body: UpstreamBody::Bytes(Bytes::from(serde_json::to_vec(&body).unwrap())),
                }),
                Some(Scripted::Stream(frames)) => {
                    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(8);
                    tokio::spawn(async move {
                        for frame in frames {
                            if tx.send(Bytes::from_static(frame.as_bytes())).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(UpstreamResponse {
                        status: 200,
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Some(Scripted::Transport) => Err(TransportError {
                    kind: TransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                }),
                None => Ok(UpstreamResponse {
                    status: 500,
                    body: UpstreamBody::Bytes(Bytes::from_static(
                        b"{\"error\": {\"message\": \"unscripted call\"}}",
                    )),
                }),
            }
        })
    }
}

fn account(token: &str, project: Option<&str>) -> Account {
    let mut value = json!({
        "client_id": "cid",
        "client_secret": "secret",
        "token": token,
        "refresh_token": format!("1//{token}"),
        "expiry": "2099-01-01T00:00:00Z",
    });
    if let Some(project) = project {
        value["project_id"] = JsonValue::from(project);
    }
    Account::new(None, AccountRecord::from_json_value(value).unwrap())
}

fn onboarded_load_response() -> JsonValue {
    json!({
        "currentTier": {"id": "standard"},
        "cloudaicompanionProject": "proj-test",
    })
}

fn generate_response(text: &str) -> JsonValue {
    json!({
        "response": {
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }]
        }
    })
}

fn pipeline(client: Arc<StubClient>, accounts: Vec<Account>) -> Pipeline {
    let pool = Arc::new(AccountPool::with_accounts(Arc::new(NeverRefresher), accounts));
    Pipeline::with_base_url(pool, client, None, BASE_URL)
}

#[tokio::test]
async fn unary_happy_path_returns_assistant_message() {
    let client = StubClient::new();
    client.script("loadCodeAssist", Scripted::Json(200, onboarded_load_response()));
    client.script("generateContent", Scripted::Json(200, generate_response("pong")));

    let pipeline = pipeline(client.clone(), vec![account("tok-1", Some("proj-test"))]);
    let envelope = RequestEnvelope::new("gemini-2.5-flash", false);
    let output = pipeline
        .execute(&envelope, "gemini-2.5-flash", json!({"contents": []}))
        .await
        .unwrap();

    let PipelineOutput::Unary(value) = output else {
        panic!("expected unary output");
    };
    let upstream: grelay_protocol::gemini::GenerateContentResponse =
        serde_json::from_value(value).unwrap();
    let completion = translate::gemini_to_openai(&upstream, "gemini-2.5-flash");
    assert_eq!(completion.choices[0].message.role, "assistant");
    assert_eq!(completion.choices[0].message.content, "pong");
    assert_eq!(
        completion.choices[0].finish_reason,
        Some(grelay_protocol::openai::response::FinishReason::Stop)
    );

    // Envelope injection: model, project and the caller's request body.
    let call = &client.calls_for("generateContent")[0];
    assert_eq!(call.body["model"], "gemini-2.5-flash");
    assert_eq!(call.body["project"], "proj-test");
    assert!(call.body["request"].get("contents").is_some());
}

#[tokio::test]
async fn failover_tries_second_account_on_403() {
    let client = StubClient::new();
    client.script("loadCodeAssist", Scripted::Json(200, onboarded_load_response()));
    client.script("loadCodeAssist", Scripted::Json(200, onboarded_load_response()));
    client.script(
        "generateContent",
        Scripted::Json(403, json!({"error": {"message": "permission denied", "code": 403}})),
    );
    client.script("generateContent", Scripted::Json(200, generate_response("ok")));

    let pipeline = pipeline(
        client.clone(),
        vec![account("tok-1", Some("p1")), account("tok-2", Some("p2"))],
    );
    let envelope = RequestEnvelope::new("gemini-2.5-flash", false);
    let output = pipeline
        .execute(&envelope, "gemini-2.5-flash", json!({}))
        .await
        .unwrap();
    assert!(matches!(output, PipelineOutput::Unary(_)));

    let calls = client.calls_for("generateContent");
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].bearer, calls[1].bearer);
}

#[tokio::test]
async fn exhaustion_surfaces_as_502_with_last_error() {
    let client = StubClient::new();
    for _ in 0..2 {
        client.script("loadCodeAssist", Scripted::Json(200, onboarded_load_response()));
        client.script(
            "generateContent",
            Scripted::Json(403, json!({"error": {"message": "blocked", "code": 403}})),
        );
    }

    let pipeline = pipeline(
        client.clone(),
        vec![account("tok-1", Some("p1")), account("tok-2", Some("p2"))],
    );
    let envelope = RequestEnvelope::new("gemini-2.5-flash", false);
    let err = pipeline
        .execute(&envelope, "gemini-2.5-flash", json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.status(), 502);
    let body = err.to_body();
    assert_eq!(body.error.kind, "upstream_rejected");
    assert!(body.error.message.contains("all configured accounts rejected"));
    assert!(body.error.message.contains("blocked"));
    assert_eq!(client.calls_for("generateContent").len(), 2);
}

#[tokio::test]
async fn rate_limit_does_not_rotate_accounts() {
    let client = StubClient::new();
    client.script("loadCodeAssist", Scripted::Json(200, onboarded_load_response()));
    client.script(
        "generateContent",
        Scripted::Json(429, json!({"error": {"message": "quota exceeded", "code": 429}})),
    );

    let pipeline = pipeline(
        client.clone(),
        vec![account("tok-1", Some("p1")), account("tok-2", Some("p2"))],
    );
    let envelope = RequestEnvelope::new("gemini-2.5-flash", false);
    let err = pipeline
        .execute(&envelope, "gemini-2.5-flash", json!({}))
        .await
        .unwrap_err();

    match err {
        RelayError::UpstreamRejected { status, message } => {
            assert_eq!(status, 429);
            assert_eq!(message, "quota exceeded");
        }
        other => panic!("expected upstream rejection, got {other:?}"),
    }
    assert_eq!(client.calls_for("generateContent").len(), 1);
}

#[tokio::test]
async fn transport_failure_surfaces_without_rotation() {
    let client = StubClient::new();
    client.script("loadCodeAssist", Scripted::Json(200, onboarded_load_response()));
    client.script("generateContent", Scripted::Transport);

    let pipeline = pipeline(
        client.clone(),
        vec![account("tok-1", Some("p1")), account("tok-2", Some("p2"))],
    );
    let envelope = RequestEnvelope::new("gemini-2.5-flash", false);
    let err = pipeline
        .execute(&envelope, "gemini-2.5-flash", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::UpstreamUnavailable(_)));
    assert_eq!(client.calls_for("generateContent").len(), 1);
}

#[tokio::test]
async fn empty_pool_fails_fast() {
    let client = StubClient::new();
    let pipeline = pipeline(client, Vec::new());
    let envelope = RequestEnvelope::new("gemini-2.5-flash", false);
    let err = pipeline
        .execute(&envelope, "gemini-2.5-flash", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NoAccounts));
    let body = err.to_body();
    assert_eq!(body.error.message, "no accounts configured");
    assert_eq!(body.error.kind, "no_accounts_configured");
}

#[tokio::test]
async fn onboarding_runs_at_most_once_per_account() {
    let client = StubClient::new();
    // Discovery returns nothing, the onboarding load reports no tier, so
    // the account goes through one onboardUser poll that completes.
    client.script("loadCodeAssist", Scripted::Json(200, json!({})));
    client.script(
        "loadCodeAssist",
        Scripted::Json(200, json!({"allowedTiers": [{"id": "free", "isDefault": true}]})),
    );
    client.script(
        "onboardUser",
        Scripted::Json(
            200,
            json!({"done": true, "response": {"cloudaicompanionProject": {"id": "proj-new"}}}),
        ),
    );
    client.script("generateContent", Scripted::Json(200, generate_response("a")));
    client.script("generateContent", Scripted::Json(200, generate_response("b")));

    let pipeline = pipeline(client.clone(), vec![account("tok-1", None)]);
    for _ in 0..2 {
        let envelope = RequestEnvelope::new("gemini-2.5-flash", false);
        pipeline
            .execute(&envelope, "gemini-2.5-flash", json!({}))
            .await
            .unwrap();
    }

    assert_eq!(client.calls_for("onboardUser").len(), 1);
    assert_eq!(client.calls_for("loadCodeAssist").len(), 2);
    // The discovered project id sticks to the account.
    assert_eq!(
        client.calls_for("generateContent")[1].body["project"],
        "proj-new"
    );
}

#[tokio::test]
async fn stream_bridge_forwards_frames_in_order() {
    let client = StubClient::new();
    client.script("loadCodeAssist", Scripted::Json(200, onboarded_load_response()));
    client.script(
        "streamGenerateContent",
        Scripted::Stream(vec![
            "data: {\"response\": {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"Hel\"}]}}]}}\n",
            "data: {\"response\": {\"candidates\": [{\"content\": ",
            "{\"parts\": [{\"text\": \"lo\"}]}, \"finishReason\": \"STOP\"}]}}\n",
        ]),
    );

    let pipeline = pipeline(client, vec![account("tok-1", Some("p1"))]);
    let envelope = RequestEnvelope::new("gemini-2.5-flash", true);
    let output = pipeline
        .execute(&envelope, "gemini-2.5-flash", json!({}))
        .await
        .unwrap();

    let PipelineOutput::Stream(mut rx) = output else {
        panic!("expected stream output");
    };
    let mut texts = Vec::new();
    while let Some(item) = rx.recv().await {
        let value = item.unwrap();
        texts.push(
            value["candidates"][0]["content"]["parts"][0]["text"]
                .as_str()
                .unwrap()
                .to_string(),
        );
    }
    assert_eq!(texts, vec!["Hel", "lo"]);
}

#[tokio::test]
async fn in_band_stream_error_terminates_with_error_item() {
    let client = StubClient::new();
    client.script("loadCodeAssist", Scripted::Json(200, onboarded_load_response()));
    client.script(
        "streamGenerateContent",
        Scripted::Stream(vec![
            "data: {\"error\": {\"message\": \"internal\", \"code\": 500}}\n",
            "data: {\"response\": {\"candidates\": []}}\n",
        ]),
    );

    let pipeline = pipeline(client, vec![account("tok-1", Some("p1"))]);
    let envelope = RequestEnvelope::new("gemini-2.5-flash", true);
    let PipelineOutput::Stream(mut rx) = pipeline
        .execute(&envelope, "gemini-2.5-flash", json!({}))
        .await
        .unwrap()
    else {
        panic!("expected stream output");
    };

    let first = rx.recv().await.unwrap();
    assert!(matches!(
        first,
        Err(RelayError::UpstreamRejected { status: 500, .. })
    ));
    assert!(rx.recv().await.is_none());
}
