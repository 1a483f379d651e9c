//! API request and response types
//!
//! Shapes follow the OpenAI chat completion contract, plus
//! `conversation_id`/`session_id` for continuity.

use crate::assembler::TokenUsage;
use crate::db::{UsageRecord, UsageStats};
use crate::runner::{ChatMessage, Role, TurnResult};
use serde::{Deserialize, Serialize};

/// Request body for `/chat/completions`
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model alias; the configured default when absent
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Continue this conversation; a new one is started when absent
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
    /// Per-request timeout override in seconds
    pub timeout: Option<u64>,
    /// Label usage is recorded under
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

/// OpenAI-style usage block
#[allow(clippy::struct_field_names)]
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<TokenUsage> for Usage {
    fn from(usage: TokenUsage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

/// Response body for a non-streaming completion
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub conversation_id: String,
    pub session_id: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    pub fn new(id: String, created: i64, model: String, result: TurnResult) -> Self {
        Self {
            id,
            object: "chat.completion",
            created,
            model,
            conversation_id: result.conversation_id,
            session_id: result.session_id,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    content: result.text,
                },
                finish_reason: "stop",
            }],
            usage: result.usage.into(),
        }
    }
}

/// Partial message in a streamed chunk
#[derive(Debug, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

/// One `chat.completion.chunk` SSE payload
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionChunk {
    fn with_delta(id: &str, created: i64, model: &str, delta: Delta) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            conversation_id: None,
            session_id: None,
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// Opening chunk announcing the assistant role
    pub fn role(id: &str, created: i64, model: &str) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            Delta {
                role: Some(Role::Assistant),
                content: None,
            },
        )
    }

    pub fn content(id: &str, created: i64, model: &str, text: String) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            Delta {
                role: None,
                content: Some(text),
            },
        )
    }

    /// Closing chunk carrying continuity ids and usage
    pub fn finish(id: &str, created: i64, model: &str, result: &TurnResult) -> Self {
        let mut chunk = Self::with_delta(id, created, model, Delta::default());
        chunk.choices[0].finish_reason = Some("stop");
        chunk.conversation_id = Some(result.conversation_id.clone());
        chunk.session_id = Some(result.session_id.clone());
        chunk.usage = Some(result.usage.into());
        chunk
    }
}

/// Query parameters shared by the usage endpoints
#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    pub source: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct UsageRecordsResponse {
    pub records: Vec<UsageRecord>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Serialize)]
pub struct UsageStatsResponse {
    pub stats: Vec<UsageStats>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// `chatcmpl-` followed by 12 hex characters
pub fn completion_id() -> String {
    // Top 48 bits are random in a v4 uuid
    format!("chatcmpl-{:012x}", uuid::Uuid::new_v4().as_u128() >> 80)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn_result() -> TurnResult {
        TurnResult {
            conversation_id: "conv".to_string(),
            session_id: "S1".to_string(),
            text: "Hello".to_string(),
            usage: TokenUsage {
                input_tokens: 12,
                output_tokens: 3,
                total_tokens: 15,
            },
            cost_usd: None,
            resumed: false,
        }
    }

    #[test]
    fn test_completion_id_shape() {
        let id = completion_id();
        let hex = id.strip_prefix("chatcmpl-").unwrap();
        assert_eq!(hex.len(), 12);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_defaults() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .unwrap();
        assert!(req.model.is_none());
        assert!(!req.stream);
        assert!(req.conversation_id.is_none());
        assert_eq!(req.messages[0].role, Role::User);
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let req = serde_json::from_value::<ChatCompletionRequest>(json!({
            "messages": [{"role": "tool", "content": "Hi"}]
        }));
        assert!(req.is_err());
    }

    #[test]
    fn test_response_shape() {
        let resp = ChatCompletionResponse::new(
            "chatcmpl-abc".to_string(),
            1_700_000_000,
            "sonnet".to_string(),
            turn_result(),
        );
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["conversation_id"], "conv");
        assert_eq!(value["session_id"], "S1");
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert_eq!(value["choices"][0]["message"]["content"], "Hello");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["usage"]["prompt_tokens"], 12);
        assert_eq!(value["usage"]["total_tokens"], 15);
    }

    #[test]
    fn test_chunk_shapes() {
        let role = serde_json::to_value(ChatCompletionChunk::role("id", 1, "haiku")).unwrap();
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"], json!({"role": "assistant"}));
        assert!(role["choices"][0]["finish_reason"].is_null());
        assert!(role.get("usage").is_none());

        let content =
            serde_json::to_value(ChatCompletionChunk::content("id", 1, "haiku", "Hi".into()))
                .unwrap();
        assert_eq!(content["choices"][0]["delta"], json!({"content": "Hi"}));

        let last =
            serde_json::to_value(ChatCompletionChunk::finish("id", 1, "haiku", &turn_result()))
                .unwrap();
        assert_eq!(last["choices"][0]["delta"], json!({}));
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["conversation_id"], "conv");
        assert_eq!(last["usage"]["completion_tokens"], 3);
    }
}
