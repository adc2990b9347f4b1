use grelay_protocol::gemini::GenerateContentResponse;
use grelay_protocol::openai::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, CHAT_COMPLETION_CHUNK_OBJECT,
};

use super::response::{flatten_parts, map_finish_reason, map_usage};
use super::{completion_id, now_epoch_seconds};

/// Converts upstream streaming chunks into chat-completion chunks.
///
/// One state per response: the first emitted delta carries the assistant
/// role, the terminal chunk carries an empty delta plus the finish
/// reason. The `data: [DONE]` line is the HTTP surface's job.
#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        StreamTranslator {
            id: completion_id(),
            model: model.into(),
            created: now_epoch_seconds(),
            role_sent: false,
        }
    }

    pub fn translate(&mut self, response: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        let mut chunks = Vec::new();
        let Some(candidate) = response.candidates.first() else {
            return chunks;
        };

        let (content, reasoning_content) = flatten_parts(Some(candidate));
        if !content.is_empty() || reasoning_content.is_some() {
            let delta = ChunkDelta {
                role: self.take_role(),
                content: (!content.is_empty()).then_some(content),
                reasoning_content,
            };
            chunks.push(self.chunk(delta, None));
        }

        if let Some(reason) = candidate.finish_reason {
            let role = self.take_role();
            let mut terminal = self.chunk(
                ChunkDelta {
                    role,
                    ..ChunkDelta::default()
                },
                Some(map_finish_reason(reason)),
            );
            terminal.usage = response.usage_metadata.as_ref().map(map_usage);
            chunks.push(terminal);
        }

        chunks
    }

    fn take_role(&mut self) -> Option<String> {
        if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant".to_string())
        }
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<grelay_protocol::openai::response::FinishReason>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use grelay_protocol::openai::response::FinishReason;

    use super::*;

    fn upstream(body: serde_json::Value) -> GenerateContentResponse {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn role_on_first_chunk_then_deltas_then_terminal() {
        let mut translator = StreamTranslator::new("gemini-2.5-flash");

        let first = translator.translate(&upstream(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "Hel"}]}}]
        })));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].object, "chat.completion.chunk");
        assert_eq!(first[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(first[0].choices[0].delta.content.as_deref(), Some("Hel"));
        assert!(first[0].choices[0].finish_reason.is_none());

        let second = translator.translate(&upstream(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "lo"}]}}]
        })));
        assert!(second[0].choices[0].delta.role.is_none());
        assert_eq!(second[0].choices[0].delta.content.as_deref(), Some("lo"));

        let last = translator.translate(&upstream(serde_json::json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 2}
        })));
        assert_eq!(last.len(), 1);
        assert!(last[0].choices[0].delta.is_empty());
        assert_eq!(last[0].choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(last[0].usage.as_ref().unwrap().total_tokens, 3);

        // The id is stable across all chunks of one response.
        assert_eq!(first[0].id, last[0].id);
    }

    #[test]
    fn reasoning_deltas_are_kept_separate() {
        let mut translator = StreamTranslator::new("gemini-2.5-pro");
        let chunks = translator.translate(&upstream(serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"text": "thinking...", "thought": true}
            ]}}]
        })));
        assert_eq!(
            chunks[0].choices[0].delta.reasoning_content.as_deref(),
            Some("thinking...")
        );
        assert!(chunks[0].choices[0].delta.content.is_none());
    }

    #[test]
    fn content_and_finish_in_one_upstream_chunk_yield_two_chunks() {
        let mut translator = StreamTranslator::new("gemini-2.5-flash");
        let chunks = translator.translate(&upstream(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "done"}]},
                            "finishReason": "MAX_TOKENS"}]
        })));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("done"));
        assert_eq!(chunks[1].choices[0].finish_reason, Some(FinishReason::Length));
        assert!(chunks[1].choices[0].delta.is_empty());
    }
}
