//! The upstream pipeline: lease an identity, deliver the wrapped request
//! to CodeAssist, fail over across accounts on authorisation errors, and
//! bridge streaming bodies through a bounded channel.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use tracing::{info, warn};

use grelay_accounts::{AccountPool, Lease, LeaseOutcome, PoolError};
use grelay_protocol::sse::DataFrameDecoder;

use crate::envelope::RequestEnvelope;
use crate::error::RelayError;
use crate::onboard::CodeAssist;
use crate::upstream::{
    UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse, CODE_ASSIST_ENDPOINT,
    STREAM_CHANNEL_CAPACITY,
};

/// Never try more than this many identities for one request, no matter
/// how large the pool is.
const MAX_ATTEMPTS: usize = 3;

pub type StreamItem = Result<JsonValue, RelayError>;

#[derive(Debug)]
pub enum PipelineOutput {
    Unary(JsonValue),
    Stream(mpsc::Receiver<StreamItem>),
}

pub struct Pipeline {
    pool: Arc<AccountPool>,
    client: Arc<dyn UpstreamClient>,
    code_assist: CodeAssist,
    google_cloud_project: Option<String>,
    base_url: String,
}

impl Pipeline {
    pub fn new(
        pool: Arc<AccountPool>,
        client: Arc<dyn UpstreamClient>,
        google_cloud_project: Option<String>,
    ) -> Self {
        Self::with_base_url(pool, client, google_cloud_project, CODE_ASSIST_ENDPOINT)
    }

    pub fn with_base_url(
        pool: Arc<AccountPool>,
        client: Arc<dyn UpstreamClient>,
        google_cloud_project: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Pipeline {
            pool,
            client: client.clone(),
            code_assist: CodeAssist::new(client, base_url.clone()),
            google_cloud_project,
            base_url,
        }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    /// Deliver one generation request. `request` is the inner Gemini
    /// request body; the CodeAssist envelope (`model`/`project`) is
    /// injected here, per leased account.
    pub async fn execute(
        &self,
        envelope: &RequestEnvelope,
        base_model: &str,
        request: JsonValue,
    ) -> Result<PipelineOutput, RelayError> {
        let pool_size = self.pool.count().await;
        info!(
            request_id = %envelope.id,
            model = %envelope.model,
            stream = envelope.stream,
            pool_size,
            "new request"
        );

        let attempts = pool_size.min(MAX_ATTEMPTS).max(1);
        let mut last_rejection: Option<String> = None;

        for attempt in 1..=attempts {
            let lease = match self.pool.lease().await {
                Ok(lease) => lease,
                Err(PoolError::Empty) => return Err(RelayError::NoAccounts),
                Err(PoolError::Exhausted(message)) => {
                    last_rejection = Some(message);
                    break;
                }
            };

            let project = match self
                .code_assist
                .ensure_account_ready(&self.pool, &lease, self.google_cloud_project.as_deref())
                .await
            {
                Ok(project) => project,
                Err(err) => {
                    warn!(
                        request_id = %envelope.id,
                        phase = "onboard",
                        account_index = lease.index,
                        error = %err,
                        "account not ready, trying next"
                    );
                    self.pool.release(&lease, LeaseOutcome::Failed).await;
                    last_rejection = Some(err.to_string());
                    continue;
                }
            };

            let wrapped = json!({
                "model": base_model,
                "project": project,
                "request": &request,
            });
            let action = if envelope.stream {
                "streamGenerateContent?alt=sse"
            } else {
                "generateContent"
            };
            let url = format!(
                "{}/v1internal:{action}",
                self.base_url.trim_end_matches('/')
            );
            let body = serde_json::to_vec(&wrapped)
                .map_err(|err| RelayError::Internal(err.to_string()))?;

            info!(
                request_id = %envelope.id,
                phase = "upstream_call",
                account_index = lease.index,
                attempt,
                "calling upstream"
            );
            let response = match self
                .client
                .send(UpstreamRequest {
                    url,
                    bearer: lease.access_token.clone(),
                    body: Bytes::from(body),
                    stream: envelope.stream,
                })
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        request_id = %envelope.id,
                        phase = "upstream_call",
                        account_index = lease.index,
                        error = %err,
                        "transport failure"
                    );
                    self.pool.release(&lease, LeaseOutcome::Failed).await;
                    return Err(RelayError::UpstreamUnavailable(err.to_string()));
                }
            };

            match response.status {
                200..=299 => {
                    self.pool.release(&lease, LeaseOutcome::Success).await;
                    return self.finish(envelope, &lease, response);
                }
                401 | 403 => {
                    let message = error_message(&response);
                    warn!(
                        request_id = %envelope.id,
                        phase = "upstream_call",
                        account_index = lease.index,
                        status = response.status,
                        "account rejected, rotating"
                    );
                    self.pool.release(&lease, LeaseOutcome::AuthRejected).await;
                    last_rejection = Some(message);
                    continue;
                }
                status => {
                    // 429 and 5xx hit every identity alike; rotating
                    // would only burn more quota.
                    let message = error_message(&response);
                    self.pool.release(&lease, LeaseOutcome::Failed).await;
                    return Err(RelayError::UpstreamRejected { status, message });
                }
            }
        }

        Err(RelayError::AccountsExhausted {
            last: last_rejection.unwrap_or_else(|| "no attempt succeeded".to_string()),
        })
    }

    fn finish(
        &self,
        envelope: &RequestEnvelope,
        lease: &Lease,
        response: UpstreamResponse,
    ) -> Result<PipelineOutput, RelayError> {
        match response.body {
            UpstreamBody::Bytes(bytes) => {
                let value = parse_unary_body(&bytes)?;
                info!(
                    request_id = %envelope.id,
                    phase = "complete",
                    account_index = lease.index,
                    latency_ms = envelope.latency_ms() as u64,
                    "request complete"
                );
                Ok(PipelineOutput::Unary(value))
            }
            UpstreamBody::Stream(byte_rx) => {
                let rx = spawn_stream_bridge(envelope.clone(), lease.index, byte_rx);
                Ok(PipelineOutput::Stream(rx))
            }
        }
    }
}

/// A unary CodeAssist body is JSON, occasionally wearing a stray
/// `data: ` prefix, wrapped in a `{"response": ...}` envelope.
fn parse_unary_body(bytes: &Bytes) -> Result<JsonValue, RelayError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| RelayError::Internal(format!("upstream body not utf-8: {err}")))?;
    let text = text.trim();
    let text = text.strip_prefix("data:").map(str::trim_start).unwrap_or(text);
    let value: JsonValue = serde_json::from_str(text)
        .map_err(|err| RelayError::Internal(format!("upstream body not json: {err}")))?;
    Ok(unwrap_response(value))
}

fn unwrap_response(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(mut obj) if obj.contains_key("response") => {
            obj.remove("response").unwrap_or(JsonValue::Null)
        }
        other => other,
    }
}

/// Decouple the upstream reader from the client writer through a bounded
/// channel. The sentinel is channel closure; a client that goes away
/// drops the receiver, the forward fails, and dropping `byte_rx` aborts
/// the upstream read within one chunk interval.
fn spawn_stream_bridge(
    envelope: RequestEnvelope,
    account_index: usize,
    mut byte_rx: mpsc::Receiver<Bytes>,
) -> mpsc::Receiver<StreamItem> {
    let (tx, rx) = mpsc::channel::<StreamItem>(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut decoder = DataFrameDecoder::new();
        let mut open = true;
        while open {
            let Some(chunk) = byte_rx.recv().await else { break };
            for frame in decoder.push(&chunk) {
                if !forward_frame(&tx, &frame).await {
                    open = false;
                    break;
                }
            }
        }
        if open {
            if let Some(frame) = decoder.finish() {
                forward_frame(&tx, &frame).await;
            }
        }
        info!(
            request_id = %envelope.id,
            phase = "stream_complete",
            account_index,
            latency_ms = envelope.latency_ms() as u64,
            "stream finished"
        );
    });

    rx
}

/// Returns false when the stream should stop: the consumer went away or
/// the upstream reported an in-band error.
async fn forward_frame(tx: &mpsc::Sender<StreamItem>, frame: &str) -> bool {
    let Ok(value) = serde_json::from_str::<JsonValue>(frame) else {
        // Partial or malformed frame; skip it like the upstream CLI does.
        return true;
    };
    if let Some(error) = value.get("error") {
        let status = error
            .get("code")
            .and_then(JsonValue::as_u64)
            .map(|code| code as u16)
            .unwrap_or(502);
        let message = error
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("upstream error")
            .to_string();
        let _ = tx
            .send(Err(RelayError::UpstreamRejected { status, message }))
            .await;
        return false;
    }
    tx.send(Ok(unwrap_response(value))).await.is_ok()
}

fn error_message(response: &UpstreamResponse) -> String {
    let UpstreamBody::Bytes(bytes) = &response.body else {
        return format!("upstream returned {}", response.status);
    };
    if let Ok(value) = serde_json::from_slice::<JsonValue>(bytes) {
        if let Some(message) = value
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(JsonValue::as_str)
        {
            return message.to_string();
        }
    }
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.is_empty() {
        format!("upstream returned {}", response.status)
    } else {
        text.chars().take(500).collect()
    }
}
