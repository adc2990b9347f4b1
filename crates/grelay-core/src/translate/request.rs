use base64::Engine;
use grelay_protocol::gemini::{
    Content, ContentRole, GenerateContentRequest, GenerationConfig, Part, Tool,
};
use grelay_protocol::openai::request::{
    ChatCompletionRequest, ChatMessage, ChatRole, ContentPart, MessageContent, ResponseFormat,
};
use tracing::debug;

use crate::catalog::{self, ResolvedModel};
use crate::error::RelayError;

use super::{default_safety_settings, parse_data_url};

/// Convert an inbound chat-completions request into the upstream
/// generate-content shape for the resolved model.
pub fn openai_to_gemini(
    req: &ChatCompletionRequest,
    resolved: &ResolvedModel,
) -> Result<GenerateContentRequest, RelayError> {
    if !req.extra.is_empty() {
        let ignored: Vec<&str> = req.extra.keys().map(String::as_str).collect();
        debug!(fields = ?ignored, "ignoring unknown request fields");
    }

    let mut system_texts = Vec::new();
    let mut contents = Vec::new();

    for message in &req.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                if let Some(text) = message_text(message) {
                    system_texts.push(text);
                }
            }
            ChatRole::User | ChatRole::Tool => {
                push_content(&mut contents, message, ContentRole::User)?;
            }
            ChatRole::Assistant => {
                push_content(&mut contents, message, ContentRole::Model)?;
            }
        }
    }

    // The upstream wants the system instruction as a user-role content.
    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content {
            role: Some(ContentRole::User),
            parts: vec![Part::text(system_texts.join("\n\n"))],
        })
    };

    let generation_config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_output_tokens: Some(
            req.max_tokens
                .unwrap_or(resolved.base.output_token_limit as i64),
        ),
        stop_sequences: req.stop.clone().map(|stop| stop.into_vec()),
        frequency_penalty: req.frequency_penalty,
        presence_penalty: req.presence_penalty,
        seed: req.seed,
        candidate_count: Some(1),
        response_mime_type: response_mime_type(req.response_format.as_ref()),
        response_schema: response_schema(req.response_format.as_ref()),
        thinking_config: catalog::thinking_for(resolved, req.reasoning_effort),
    };

    let tools = resolved
        .is_search()
        .then(|| vec![Tool::google_search()]);

    Ok(GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        safety_settings: Some(
            req.safety_settings
                .clone()
                .unwrap_or_else(default_safety_settings),
        ),
        generation_config: Some(generation_config),
    })
}

fn push_content(
    contents: &mut Vec<Content>,
    message: &ChatMessage,
    role: ContentRole,
) -> Result<(), RelayError> {
    let parts = message_parts(message)?;
    if !parts.is_empty() {
        contents.push(Content {
            role: Some(role),
            parts,
        });
    }
    Ok(())
}

fn message_text(message: &ChatMessage) -> Option<String> {
    match message.content.as_ref()? {
        MessageContent::Text(text) => (!text.is_empty()).then(|| text.clone()),
        MessageContent::Parts(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } if !text.is_empty() => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
    }
}

fn message_parts(message: &ChatMessage) -> Result<Vec<Part>, RelayError> {
    let Some(content) = message.content.as_ref() else {
        return Ok(Vec::new());
    };
    match content {
        MessageContent::Text(text) => Ok(split_markdown_images(text)),
        MessageContent::Parts(items) => {
            let mut parts = Vec::new();
            for item in items {
                match item {
                    ContentPart::Text { text } => parts.extend(split_markdown_images(text)),
                    ContentPart::ImageUrl { image_url } => {
                        parts.push(image_part(&image_url.url)?);
                    }
                }
            }
            Ok(parts)
        }
    }
}

fn image_part(url: &str) -> Result<Part, RelayError> {
    let Some((mime, data)) = parse_data_url(url) else {
        return Err(RelayError::InvalidRequest(
            "image_url must be a data:<mime>;base64,<data> URL".to_string(),
        ));
    };
    if base64::engine::general_purpose::STANDARD.decode(&data).is_err() {
        return Err(RelayError::InvalidRequest(
            "image_url carries invalid base64 data".to_string(),
        ));
    }
    Ok(Part::inline_data(mime, data))
}

struct InlineImage {
    start: usize,
    end: usize,
    mime: String,
    data: String,
}

fn find_inline_image(text: &str) -> Option<InlineImage> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find("![") {
        let start = search_from + rel;
        if let Some(mid_rel) = text[start..].find("](") {
            let url_start = start + mid_rel + 2;
            if let Some(end_rel) = text[url_start..].find(')') {
                let url = &text[url_start..url_start + end_rel];
                if let Some((mime, data)) = parse_data_url(url) {
                    if base64::engine::general_purpose::STANDARD.decode(&data).is_ok() {
                        return Some(InlineImage {
                            start,
                            end: url_start + end_rel + 1,
                            mime,
                            data,
                        });
                    }
                }
            }
        }
        search_from = start + 2;
    }
    None
}

/// Pull markdown inline images (`![...](data:...)`) out of a text block,
/// keeping the surrounding text with the image markers removed.
fn split_markdown_images(text: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut plain = String::new();
    let mut rest = text;

    while let Some(image) = find_inline_image(rest) {
        plain.push_str(&rest[..image.start]);
        flush_text(&mut parts, &mut plain);
        parts.push(Part::inline_data(image.mime, image.data));
        rest = &rest[image.end..];
    }
    plain.push_str(rest);
    flush_text(&mut parts, &mut plain);
    parts
}

fn flush_text(parts: &mut Vec<Part>, plain: &mut String) {
    if plain.trim().is_empty() {
        plain.clear();
        return;
    }
    parts.push(Part::text(std::mem::take(plain)));
}

fn response_mime_type(format: Option<&ResponseFormat>) -> Option<String> {
    match format {
        Some(ResponseFormat::JsonObject) | Some(ResponseFormat::JsonSchema { .. }) => {
            Some("application/json".to_string())
        }
        _ => None,
    }
}

fn response_schema(format: Option<&ResponseFormat>) -> Option<serde_json::Value> {
    match format {
        Some(ResponseFormat::JsonSchema { json_schema }) => json_schema.schema.clone(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    fn resolved(name: &str) -> ResolvedModel {
        catalog::resolve(name).unwrap()
    }

    #[test]
    fn system_messages_join_into_system_instruction() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "system", "content": "first"},
                {"role": "user", "content": "hello"},
                {"role": "system", "content": "second"},
                {"role": "assistant", "content": "hi"},
                {"role": "tool", "content": "tool output"}
            ]
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-flash")).unwrap();

        let system = out.system_instruction.unwrap();
        assert_eq!(system.role, Some(ContentRole::User));
        assert_eq!(system.parts[0].text.as_deref(), Some("first\n\nsecond"));

        let roles: Vec<_> = out.contents.iter().map(|c| c.role).collect();
        assert_eq!(
            roles,
            vec![
                Some(ContentRole::User),
                Some(ContentRole::Model),
                Some(ContentRole::User)
            ]
        );
    }

    #[test]
    fn data_url_image_becomes_inline_data() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this?"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGVsbG8="}}
            ]}]
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-flash")).unwrap();
        let parts = &out.contents[0].parts;
        assert_eq!(parts.len(), 2);
        let blob = parts[1].inline_data.as_ref().unwrap();
        assert_eq!(blob.mime_type, "image/png");
        assert_eq!(blob.data, "aGVsbG8=");
    }

    #[test]
    fn https_image_url_is_rejected() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
            ]}]
        }));
        let err = openai_to_gemini(&req, &resolved("gemini-2.5-flash")).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[test]
    fn markdown_inline_image_is_extracted() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content":
                "look at ![diagram](data:image/jpeg;base64,aGVsbG8=) carefully"}]
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-flash")).unwrap();
        let parts = &out.contents[0].parts;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].text.as_deref(), Some("look at "));
        assert_eq!(
            parts[1].inline_data.as_ref().unwrap().mime_type,
            "image/jpeg"
        );
        assert_eq!(parts[2].text.as_deref(), Some(" carefully"));
    }

    #[test]
    fn plain_markdown_link_is_left_alone() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "see ![img](https://x.test/a.png) here"}]
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-flash")).unwrap();
        let parts = &out.contents[0].parts;
        assert_eq!(parts.len(), 1);
        assert!(parts[0].text.as_deref().unwrap().contains("![img]"));
    }

    #[test]
    fn generation_config_carries_enumerated_options() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "top_p": 0.9,
            "top_k": 40,
            "stop": ["END"],
            "frequency_penalty": 0.5,
            "presence_penalty": -0.5,
            "seed": 7,
            "response_format": {"type": "json_object"}
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-pro")).unwrap();
        let config = out.generation_config.unwrap();
        assert_eq!(config.temperature, Some(0.2));
        assert_eq!(config.top_k, Some(40));
        assert_eq!(config.max_output_tokens, Some(65_535));
        assert_eq!(config.stop_sequences, Some(vec!["END".to_string()]));
        assert_eq!(config.candidate_count, Some(1));
        assert_eq!(config.response_mime_type.as_deref(), Some("application/json"));
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn thinking_config_skipped_for_non_thinking_models() {
        let req = request(serde_json::json!({
            "model": "gemini-2.0-flash",
            "messages": [{"role": "user", "content": "hi"}],
            "reasoning_effort": "high"
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.0-flash")).unwrap();
        assert!(out.generation_config.unwrap().thinking_config.is_none());
    }

    #[test]
    fn maxthinking_variant_sets_budget_and_no_tools() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-pro-maxthinking",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-pro-maxthinking")).unwrap();
        let config = out.generation_config.unwrap().thinking_config.unwrap();
        assert_eq!(config.thinking_budget, 32_768);
        assert!(config.include_thoughts);
        assert!(out.tools.is_none());
    }

    #[test]
    fn search_variant_attaches_google_search_tool() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-flash-search",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-flash-search")).unwrap();
        let tools = out.tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].google_search.is_some());
    }

    #[test]
    fn default_safety_attached_and_caller_override_wins() {
        let req = request(serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-flash")).unwrap();
        assert_eq!(out.safety_settings.unwrap().len(), 11);

        let req = request(serde_json::json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "hi"}],
            "safety_settings": [
                {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_ONLY_HIGH"}
            ]
        }));
        let out = openai_to_gemini(&req, &resolved("gemini-2.5-flash")).unwrap();
        let safety = out.safety_settings.unwrap();
        assert_eq!(safety.len(), 1);
        assert_eq!(safety[0].threshold, "BLOCK_ONLY_HIGH");
    }
}
