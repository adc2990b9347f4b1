use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::gemini::SafetySetting;

/// Inbound body of `POST /v1/chat/completions`.
///
/// Unknown fields are collected into `extra` so the handler can log them
/// at debug level instead of echoing them upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Gemini-style safety override, accepted as a passthrough extension.
    #[serde(default)]
    pub safety_settings: Option<Vec<SafetySetting>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

/// Message content is either a bare string or a heterogeneous part list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    Single(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::Single(value) => vec![value],
            StopSequences::Many(values) => values,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonSchemaFormat {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub schema: Option<JsonValue>,
    #[serde(default)]
    pub strict: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_and_part_content_both_decode() {
        let body = serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]}
            ],
            "stream": true
        });
        let req: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert!(req.is_stream());
        assert_eq!(req.messages.len(), 2);
        assert!(matches!(
            req.messages[0].content,
            Some(MessageContent::Text(_))
        ));
        match &req.messages[1].content {
            Some(MessageContent::Parts(parts)) => assert_eq!(parts.len(), 2),
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_land_in_extra() {
        let body = serde_json::json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"50256": -100}
        });
        let req: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert!(req.extra.contains_key("logit_bias"));
    }

    #[test]
    fn unsupported_part_type_is_rejected() {
        let body = serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": [{"type": "input_audio", "input_audio": {}}]}]
        });
        assert!(serde_json::from_value::<ChatCompletionRequest>(body).is_err());
    }
}
