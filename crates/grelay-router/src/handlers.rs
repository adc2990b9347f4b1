use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use grelay_core::catalog;
use grelay_core::pipeline::{PipelineOutput, StreamItem};
use grelay_core::translate::{self, StreamTranslator};
use grelay_core::upstream::STREAM_CHANNEL_CAPACITY;
use grelay_core::{RelayError, RequestEnvelope};
use grelay_protocol::gemini::{GenerateContentResponse, ModelListResponse};
use grelay_protocol::openai::request::ChatCompletionRequest;
use grelay_protocol::openai::response::ModelList;

use crate::AppState;

pub const SERVICE_NAME: &str = "grelay";

pub async fn root(State(state): State<AppState>) -> Response {
    let accounts = state.pipeline.pool().count().await;
    Json(json!({
        "name": SERVICE_NAME,
        "description": "Gemini CodeAssist proxy with OpenAI-compatible and native endpoints",
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": accounts,
        "endpoints": {
            "openai_compatible": {
                "chat_completions": "/v1/chat/completions",
                "models": "/v1/models",
            },
            "native_gemini": {
                "models": "/v1beta/models",
                "generate": "/v1beta/models/{model}:generateContent",
                "stream": "/v1beta/models/{model}:streamGenerateContent",
            },
            "health": "/health",
        },
        "authentication":
            "Required. Use Bearer token, Basic Auth, 'key' query param, or 'x-goog-api-key' header.",
    }))
    .into_response()
}

pub async fn health(State(state): State<AppState>) -> Response {
    let accounts = state.pipeline.pool().count().await;
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "accounts": accounts,
    }))
    .into_response()
}

pub async fn openai_list_models() -> Response {
    let data = catalog::list_models()
        .iter()
        .map(catalog::CatalogEntry::to_openai)
        .collect();
    Json(ModelList {
        object: "list".to_string(),
        data,
    })
    .into_response()
}

pub async fn gemini_list_models() -> Response {
    let models = catalog::list_models()
        .iter()
        .map(catalog::CatalogEntry::to_gemini)
        .collect();
    Json(ModelListResponse { models }).into_response()
}

pub async fn openai_chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&RelayError::InvalidRequest(format!(
                "malformed request body: {err}"
            )))
        }
    };

    let Some(resolved) = catalog::resolve(&request.model) else {
        return error_response(&RelayError::InvalidRequest(format!(
            "unknown model: {}",
            request.model
        )));
    };

    let upstream_request = match translate::openai_to_gemini(&request, &resolved) {
        Ok(upstream) => upstream,
        Err(err) => return error_response(&err),
    };
    let request_value = match serde_json::to_value(&upstream_request) {
        Ok(value) => value,
        Err(err) => return error_response(&RelayError::Internal(err.to_string())),
    };

    let envelope = RequestEnvelope::new(request.model.clone(), request.is_stream());
    match state
        .pipeline
        .execute(&envelope, resolved.base.name, request_value)
        .await
    {
        Ok(PipelineOutput::Unary(value)) => {
            match serde_json::from_value::<GenerateContentResponse>(value) {
                Ok(upstream) => {
                    Json(translate::gemini_to_openai(&upstream, &request.model)).into_response()
                }
                Err(err) => error_response(&RelayError::Internal(format!(
                    "unexpected upstream response shape: {err}"
                ))),
            }
        }
        Ok(PipelineOutput::Stream(items)) => openai_stream_response(items, &request.model),
        Err(err) => error_response(&err),
    }
}

pub async fn gemini_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Response {
    let model_action = model_action.trim_start_matches('/');
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(&RelayError::InvalidRequest(
            "expected path of the form {model}:{action}".to_string(),
        ));
    };

    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => return error_response(&RelayError::UnknownAction(other.to_string())),
    };

    let Some(resolved) = catalog::resolve(model) else {
        return error_response(&RelayError::InvalidRequest(format!("unknown model: {model}")));
    };

    let value: JsonValue = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                return error_response(&RelayError::InvalidRequest(format!(
                    "invalid JSON in request body: {err}"
                )))
            }
        }
    };

    let prepared = translate::prepare_native_request(value, &resolved, model);
    let envelope = RequestEnvelope::new(model, stream);
    match state
        .pipeline
        .execute(&envelope, resolved.base.name, prepared)
        .await
    {
        Ok(PipelineOutput::Unary(value)) => Json(value).into_response(),
        Ok(PipelineOutput::Stream(items)) => native_stream_response(items),
        Err(err) => error_response(&err),
    }
}

pub fn error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_body())).into_response()
}

/// Re-emit translated chunks as SSE; the stream always terminates with
/// `data: [DONE]`, error frames included.
fn openai_stream_response(mut items: mpsc::Receiver<StreamItem>, model: &str) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
    let mut translator = StreamTranslator::new(model);

    tokio::spawn(async move {
        while let Some(item) = items.recv().await {
            match item {
                Ok(value) => {
                    let Ok(upstream) = serde_json::from_value::<GenerateContentResponse>(value)
                    else {
                        continue;
                    };
                    for chunk in translator.translate(&upstream) {
                        if send_json_frame(&tx, &chunk).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = send_json_frame(&tx, &err.to_body()).await;
                    break;
                }
            }
        }
        let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
    });

    sse_response(rx)
}

/// Native streaming passes the unwrapped upstream chunks through as-is.
fn native_stream_response(mut items: mpsc::Receiver<StreamItem>) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Some(item) = items.recv().await {
            let frame = match item {
                Ok(value) => send_json_frame(&tx, &value).await,
                Err(err) => {
                    let _ = send_json_frame(&tx, &err.to_body()).await;
                    break;
                }
            };
            if frame.is_err() {
                return;
            }
        }
    });

    sse_response(rx)
}

async fn send_json_frame<T: serde::Serialize>(
    tx: &mpsc::Sender<Bytes>,
    value: &T,
) -> Result<(), ()> {
    let Some(frame) = sse_json_bytes(value) else {
        return Ok(());
    };
    tx.send(frame).await.map_err(|_| ())
}

fn sse_json_bytes<T: serde::Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}

fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        // Hint reverse proxies not to buffer the event stream.
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
