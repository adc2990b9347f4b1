use serde::{Deserialize, Serialize};

/// OpenAI-style error envelope used for every client-visible failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, kind: impl Into<String>, code: u16) -> Self {
        ErrorBody {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.into(),
                code,
            },
        }
    }
}

pub const TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const TYPE_API_ERROR: &str = "api_error";
pub const TYPE_AUTHENTICATION: &str = "authentication_error";
pub const TYPE_NO_ACCOUNTS: &str = "no_accounts_configured";
pub const TYPE_UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
pub const TYPE_UPSTREAM_REJECTED: &str = "upstream_rejected";
pub const TYPE_UNKNOWN_ACTION: &str = "unknown_gemini_action";
pub const TYPE_INTERNAL: &str = "internal_error";
