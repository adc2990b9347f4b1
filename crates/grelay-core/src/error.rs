use grelay_protocol::error::{
    ErrorBody, TYPE_INTERNAL, TYPE_INVALID_REQUEST, TYPE_NO_ACCOUNTS, TYPE_UNKNOWN_ACTION,
    TYPE_UPSTREAM_REJECTED, TYPE_UPSTREAM_UNAVAILABLE,
};

/// Failure taxonomy of the request engine. Everything here serialises to
/// the OpenAI error envelope; the HTTP status matches `status()` and the
/// envelope `type` matches `kind()`.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("no accounts configured")]
    NoAccounts,
    /// Transport failure or timeout talking to the upstream; never
    /// triggers account rotation.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Non-auth upstream rejection (429/5xx and friends), message proxied.
    #[error("{message}")]
    UpstreamRejected { status: u16, message: String },
    /// Every attempted account was refused by the upstream.
    #[error("all configured accounts rejected this request: {last}")]
    AccountsExhausted { last: String },
    /// The native surface was asked for an action it does not proxy.
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> u16 {
        match self {
            RelayError::InvalidRequest(_) => 400,
            RelayError::NoAccounts => 503,
            RelayError::UpstreamUnavailable(_) => 502,
            RelayError::UpstreamRejected { status, .. } => *status,
            RelayError::AccountsExhausted { .. } => 502,
            RelayError::UnknownAction(_) => 404,
            RelayError::Internal(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => TYPE_INVALID_REQUEST,
            RelayError::NoAccounts => TYPE_NO_ACCOUNTS,
            RelayError::UpstreamUnavailable(_) => TYPE_UPSTREAM_UNAVAILABLE,
            RelayError::UpstreamRejected { .. } | RelayError::AccountsExhausted { .. } => {
                TYPE_UPSTREAM_REJECTED
            }
            RelayError::UnknownAction(_) => TYPE_UNKNOWN_ACTION,
            RelayError::Internal(_) => TYPE_INTERNAL,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.to_string(), self.kind(), self.status())
    }
}
