use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

pub fn default_scopes() -> Vec<String> {
    [
        "https://www.googleapis.com/auth/cloud-platform",
        "https://www.googleapis.com/auth/userinfo.email",
        "https://www.googleapis.com/auth/userinfo.profile",
        "openid",
    ]
    .iter()
    .map(|scope| scope.to_string())
    .collect()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// One OAuth identity as stored in `accounts/*.json`.
///
/// `token` may be absent in a freshly enrolled file; the pool refreshes
/// before the first lease in that case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub refresh_token: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl AccountRecord {
    /// Decode a credential file, normalising the field spellings other
    /// tools write (`access_token` for `token`, space-joined `scope`).
    pub fn from_json_value(mut value: JsonValue) -> Result<Self, serde_json::Error> {
        if let Some(obj) = value.as_object_mut() {
            if !obj.contains_key("token") {
                if let Some(token) = obj.remove("access_token") {
                    obj.insert("token".to_string(), token);
                }
            }
            if !obj.contains_key("scopes") {
                if let Some(JsonValue::String(scope)) = obj.remove("scope") {
                    let scopes: Vec<JsonValue> = scope
                        .split_whitespace()
                        .map(|item| JsonValue::String(item.to_string()))
                        .collect();
                    obj.insert("scopes".to_string(), JsonValue::Array(scopes));
                }
            }
        }
        serde_json::from_value(value)
    }

    pub fn expiry_instant(&self) -> Option<OffsetDateTime> {
        let raw = self.expiry.as_deref()?;
        OffsetDateTime::parse(raw, &Rfc3339).ok()
    }

    /// True when the access token is missing, unparsable, or inside the
    /// given leeway window before expiry.
    pub fn needs_refresh(&self, leeway: Duration) -> bool {
        if self.token.is_none() {
            return true;
        }
        match self.expiry_instant() {
            Some(expiry) => expiry <= OffsetDateTime::now_utc() + leeway,
            None => true,
        }
    }

    pub fn apply_refresh(&mut self, access_token: &str, expires_in: i64) {
        self.token = Some(access_token.to_string());
        let expiry = OffsetDateTime::now_utc() + Duration::seconds(expires_in);
        self.expiry = expiry.format(&Rfc3339).ok();
    }
}
