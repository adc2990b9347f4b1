//! Bidirectional OpenAI ⇄ Gemini format translation, plus the native
//! request preparation used by the passthrough route.

pub mod native;
pub mod request;
pub mod response;
pub mod stream;

use std::time::{SystemTime, UNIX_EPOCH};

use grelay_protocol::gemini::SafetySetting;
use rand::RngCore;

pub use native::prepare_native_request;
pub use request::openai_to_gemini;
pub use response::gemini_to_openai;
pub use stream::StreamTranslator;

pub(crate) fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

/// `chatcmpl-` plus random hex, freshly generated per response.
pub fn completion_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("chatcmpl-{hex}")
}

const HARM_CATEGORIES: [&str; 11] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
    "HARM_CATEGORY_IMAGE_DANGEROUS_CONTENT",
    "HARM_CATEGORY_IMAGE_HARASSMENT",
    "HARM_CATEGORY_IMAGE_HATE",
    "HARM_CATEGORY_IMAGE_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_UNSPECIFIED",
    "HARM_CATEGORY_JAILBREAK",
];

/// All eleven harm categories disabled; callers can override.
pub fn default_safety_settings() -> Vec<SafetySetting> {
    HARM_CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category: category.to_string(),
            threshold: "BLOCK_NONE".to_string(),
        })
        .collect()
}

/// Split a `data:<mime>;base64,<payload>` URL.
pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" || mime.is_empty() {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}
