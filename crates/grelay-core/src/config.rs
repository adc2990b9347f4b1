use std::env;
use std::path::PathBuf;

pub const DEFAULT_AUTH_PASSWORD: &str = "123456";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub auth_password: String,
    /// Used only by the out-of-process enrolment flow; carried here so
    /// the startup banner can point at it.
    pub oauth_callback_port: u16,
    pub accounts_dir: PathBuf,
    /// Legacy single-credential file, consulted when the accounts
    /// directory yields nothing.
    pub legacy_credential_file: PathBuf,
    /// Inline JSON credential record (`GEMINI_CREDENTIALS`).
    pub inline_credentials: Option<String>,
    pub google_cloud_project: Option<String>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(RelayConfig {
            host: env_or("HOST", "127.0.0.1"),
            port: parse_port("PORT", "8888")?,
            auth_password: env_or("GEMINI_AUTH_PASSWORD", DEFAULT_AUTH_PASSWORD),
            oauth_callback_port: parse_port("OAUTH_CALLBACK_PORT", "8080")?,
            accounts_dir: PathBuf::from(env_or("ACCOUNTS_DIR", "accounts")),
            legacy_credential_file: PathBuf::from(env_or(
                "GOOGLE_APPLICATION_CREDENTIALS",
                "oauth_creds.json",
            )),
            inline_credentials: env::var("GEMINI_CREDENTIALS").ok().filter(|v| !v.is_empty()),
            google_cloud_project: env::var("GOOGLE_CLOUD_PROJECT")
                .ok()
                .filter(|v| !v.is_empty()),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uses_default_password(&self) -> bool {
        self.auth_password == DEFAULT_AUTH_PASSWORD
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_port(name: &'static str, default: &str) -> Result<u16, ConfigError> {
    let raw = env_or(name, default);
    raw.parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: raw,
    })
}
