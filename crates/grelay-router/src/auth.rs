//! Inbound authentication: a single shared secret accepted through any
//! of the client conventions the proxied SDKs use.

use axum::http::{header, HeaderMap};
use base64::Engine;

/// Why a request was rejected; carries the masked credential for logs.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthFailure {
    pub attempted: Option<String>,
}

/// Check the request against the shared secret, trying in order:
/// `Authorization: Bearer`, `Authorization: Basic` (password part),
/// `?key=` query parameter, `x-goog-api-key` header.
pub fn verify_request(
    headers: &HeaderMap,
    query: Option<&str>,
    password: &str,
) -> Result<(), AuthFailure> {
    let mut attempted = None;

    if let Some(auth) = header_str(headers, header::AUTHORIZATION.as_str()) {
        let auth = auth.trim();
        if let Some(token) = strip_prefix_ignore_case(auth, "Bearer ") {
            let token = token.trim();
            if token == password {
                return Ok(());
            }
            attempted = attempted.or_else(|| Some(mask_secret(token)));
        }
        if let Some(encoded) = strip_prefix_ignore_case(auth, "Basic ") {
            if let Some(basic_password) = decode_basic_password(encoded.trim()) {
                if basic_password == password {
                    return Ok(());
                }
                attempted = attempted.or_else(|| Some(mask_secret(&basic_password)));
            }
        }
    }

    if let Some(key) = query_key(query) {
        if key == password {
            return Ok(());
        }
        attempted = attempted.or_else(|| Some(mask_secret(&key)));
    }

    if let Some(key) = header_str(headers, "x-goog-api-key") {
        let key = key.trim();
        if key == password {
            return Ok(());
        }
        attempted = attempted.or_else(|| Some(mask_secret(key)));
    }

    Err(AuthFailure { attempted })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

fn decode_basic_password(encoded: &str) -> Option<String> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    decoded
        .split_once(':')
        .map(|(_, password)| password.to_string())
}

fn query_key(query: Option<&str>) -> Option<String> {
    let query = query?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    pairs
        .into_iter()
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Never log the inbound secret verbatim.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", &secret[secret.len() - 4..])
    }
}
