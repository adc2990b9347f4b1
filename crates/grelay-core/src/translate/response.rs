use grelay_protocol::gemini::{
    Candidate, FinishReason as GeminiFinishReason, GenerateContentResponse, UsageMetadata,
};
use grelay_protocol::openai::response::{
    AssistantMessage, ChatChoice, ChatCompletion, CompletionTokensDetails, FinishReason, Usage,
    CHAT_COMPLETION_OBJECT,
};

use super::{completion_id, now_epoch_seconds};

/// Convert a unary generate-content response into a chat completion.
pub fn gemini_to_openai(response: &GenerateContentResponse, model: &str) -> ChatCompletion {
    let (content, reasoning_content) = flatten_parts(response.candidates.first());
    let finish_reason = response
        .candidates
        .first()
        .and_then(|candidate| candidate.finish_reason)
        .map(map_finish_reason)
        .unwrap_or(FinishReason::Stop);

    ChatCompletion {
        id: completion_id(),
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content,
                reasoning_content,
            },
            finish_reason: Some(finish_reason),
        }],
        usage: response.usage_metadata.as_ref().map(map_usage),
    }
}

/// Concatenate the first candidate's parts: plain text into `content`,
/// `thought` parts into `reasoning_content`, returned images re-encoded
/// as markdown inline images.
pub(super) fn flatten_parts(candidate: Option<&Candidate>) -> (String, Option<String>) {
    let mut content = String::new();
    let mut reasoning = String::new();

    let parts = candidate
        .and_then(|candidate| candidate.content.as_ref())
        .map(|c| c.parts.as_slice())
        .unwrap_or_default();

    for part in parts {
        if let Some(text) = &part.text {
            if part.is_thought() {
                reasoning.push_str(text);
            } else {
                content.push_str(text);
            }
            continue;
        }
        if let Some(blob) = &part.inline_data {
            content.push_str(&format!(
                "![image](data:{};base64,{})",
                blob.mime_type, blob.data
            ));
        }
    }

    let reasoning = (!reasoning.is_empty()).then_some(reasoning);
    (content, reasoning)
}

pub(super) fn map_finish_reason(reason: GeminiFinishReason) -> FinishReason {
    match reason {
        GeminiFinishReason::Stop => FinishReason::Stop,
        GeminiFinishReason::MaxTokens => FinishReason::Length,
        GeminiFinishReason::Safety | GeminiFinishReason::Recitation => FinishReason::ContentFilter,
        GeminiFinishReason::Other => FinishReason::Stop,
    }
}

pub(super) fn map_usage(usage: &UsageMetadata) -> Usage {
    let prompt_tokens = usage.prompt_token_count.unwrap_or(0);
    let completion_tokens = usage.candidates_token_count.unwrap_or(0);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: usage
            .total_token_count
            .unwrap_or(prompt_tokens + completion_tokens),
        completion_tokens_details: usage.thoughts_token_count.map(|reasoning| {
            CompletionTokensDetails {
                reasoning_tokens: Some(reasoning),
            }
        }),
    }
}
