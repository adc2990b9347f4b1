//! Authenticated HTTP transport to the CodeAssist endpoint, behind a
//! trait so the pipeline can be exercised with a stub transport.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;

pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
pub const CLI_VERSION: &str = "0.1.5";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const UNARY_TIMEOUT: Duration = Duration::from_secs(300);
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// SSE bridge capacity. Bigger wastes memory, smaller risks head-of-line
/// blocking when the client reads slower than the upstream produces.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct UpstreamRequest {
    pub url: String,
    pub bearer: String,
    pub body: Bytes,
    pub stream: bool,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Other,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>;
}

/// Production transport. Two clients because the builder owns the
/// timeouts: unary calls get a hard deadline, streaming calls get an
/// idle read timeout instead.
pub struct WreqUpstreamClient {
    unary: wreq::Client,
    streaming: wreq::Client,
    user_agent: String,
}

impl WreqUpstreamClient {
    pub fn new() -> Result<Self, wreq::Error> {
        let unary = wreq::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(UNARY_TIMEOUT)
            .build()?;
        let streaming = wreq::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(STREAM_READ_TIMEOUT)
            .build()?;
        Ok(WreqUpstreamClient {
            unary,
            streaming,
            user_agent: user_agent(),
        })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let client = if req.stream { &self.streaming } else { &self.unary };
            let response = client
                .post(&req.url)
                .header("Authorization", format!("Bearer {}", req.bearer))
                .header("Content-Type", "application/json")
                .header("User-Agent", self.user_agent.as_str())
                .header("Accept-Encoding", "gzip")
                .body(req.body)
                .send()
                .await
                .map_err(map_wreq_error)?;

            let status = response.status().as_u16();
            if !(200..300).contains(&status) || !req.stream {
                let body = response.bytes().await.map_err(map_wreq_error)?;
                return Ok(UpstreamResponse {
                    status,
                    body: UpstreamBody::Bytes(body),
                });
            }

            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                while let Some(item) = stream.next().await {
                    let Ok(chunk) = item else { break };
                    if tx.send(chunk).await.is_err() {
                        // Receiver dropped: the client went away, stop
                        // reading from the upstream.
                        break;
                    }
                }
            });

            Ok(UpstreamResponse {
                status,
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

fn map_wreq_error(err: wreq::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    };
    TransportError {
        kind,
        message: err.to_string(),
    }
}

/// User-Agent matching the gemini-cli format, e.g.
/// `GeminiCLI/0.1.5 (Linux; x86_64)`.
pub fn user_agent() -> String {
    let system = match std::env::consts::OS {
        "macos" => "Darwin",
        "windows" => "Windows",
        "linux" => "Linux",
        other => other,
    };
    format!(
        "GeminiCLI/{CLI_VERSION} ({system}; {arch})",
        arch = std::env::consts::ARCH
    )
}

fn platform_string() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => "DARWIN_ARM64",
        ("macos", _) => "DARWIN_AMD64",
        ("linux", "aarch64") => "LINUX_ARM64",
        ("linux", _) => "LINUX_AMD64",
        ("windows", _) => "WINDOWS_AMD64",
        _ => "PLATFORM_UNSPECIFIED",
    }
}

/// Client metadata block attached to every CodeAssist control call.
pub fn client_metadata(project_id: Option<&str>) -> JsonValue {
    serde_json::json!({
        "ideType": "IDE_UNSPECIFIED",
        "platform": platform_string(),
        "pluginType": "GEMINI",
        "duetProject": project_id,
    })
}
