//! Stream-JSON output protocol of `claude -p --output-format stream-json`
//!
//! One JSON object per line. Only the terminal `result` record is load
//! bearing; everything else is informational and a bad line is skipped.

use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Structured event produced by one invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Session bootstrap record
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// Incremental assistant text
    TextDelta(String),
    /// Complete assistant text block from a finished message
    AssistantText(String),
    /// The tool invoked one of its own capabilities
    ToolUse { id: String, name: String },
    /// Terminal record
    Result(ResultRecord),
    /// Process exited; always the last event of a real invocation
    Exited { code: Option<i32>, stderr: String },
}

/// Terminal `result` record
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultRecord {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub usage: ResultUsage,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Token usage as reported in the result record
#[allow(clippy::struct_field_names)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ResultUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    /// Rarely present; authoritative when it is
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed result record: {0}")]
    MalformedResult(String),
    #[error("failed to read tool output: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct SystemRecord {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartialRecord {
    event: Value,
}

#[derive(Debug, Deserialize)]
struct AssistantRecord {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<AssistantBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssistantBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

/// Parse one output line.
///
/// `Ok(vec![])` means the line carried nothing of interest or was an
/// anomaly that has already been logged. Only a broken `result` record is an
/// error.
pub fn parse_line(line: &str) -> Result<Vec<StreamEvent>, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            if looks_like_result(trimmed) {
                return Err(ProtocolError::MalformedResult(e.to_string()));
            }
            tracing::warn!(error = %e, line = %preview(trimmed), "Skipping unparseable output line");
            return Ok(Vec::new());
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
        tracing::warn!(line = %preview(trimmed), "Skipping output line without a type");
        return Ok(Vec::new());
    };

    match kind.as_str() {
        "result" => serde_json::from_value::<ResultRecord>(value)
            .map(|record| vec![StreamEvent::Result(record)])
            .map_err(|e| ProtocolError::MalformedResult(e.to_string())),
        "system" => Ok(decode::<SystemRecord>(value, &kind)
            .map(|r| {
                vec![StreamEvent::Init {
                    session_id: r.session_id,
                    model: r.model,
                }]
            })
            .unwrap_or_default()),
        "stream_event" => Ok(decode::<PartialRecord>(value, &kind)
            .and_then(|r| text_delta(&r.event))
            .map(|text| vec![StreamEvent::TextDelta(text)])
            .unwrap_or_default()),
        "assistant" => Ok(decode::<AssistantRecord>(value, &kind)
            .map(|r| {
                r.message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        AssistantBlock::Text { text } => Some(StreamEvent::AssistantText(text)),
                        AssistantBlock::ToolUse { id, name } => {
                            Some(StreamEvent::ToolUse { id, name })
                        }
                        AssistantBlock::Other => None,
                    })
                    .collect()
            })
            .unwrap_or_default()),
        // Tool results fed back to the model, rate-limit notices, etc.
        _ => Ok(Vec::new()),
    }
}

/// Lazily parse a whole output stream into events, skipping anomalies.
///
/// Lines are decoded lossily; a stray invalid byte must not cost the turn
/// its result record.
pub fn parse_events<R>(reader: R) -> impl Stream<Item = Result<StreamEvent, ProtocolError>>
where
    R: AsyncBufRead + Unpin,
{
    stream::unfold(
        (reader, Vec::new(), VecDeque::new(), false),
        |(mut reader, mut buf, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (reader, buf, pending, done)));
                }
                if done {
                    return None;
                }
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => done = true,
                    Ok(_) => match parse_line(&String::from_utf8_lossy(&buf)) {
                        Ok(events) => pending = VecDeque::from(events),
                        Err(e) => return Some((Err(e), (reader, buf, pending, done))),
                    },
                    Err(e) => {
                        done = true;
                        return Some((Err(ProtocolError::Io(e)), (reader, buf, pending, done)));
                    }
                }
            }
        },
    )
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, kind: &str) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(kind, error = %e, "Skipping output record with unexpected shape");
            None
        }
    }
}

fn text_delta(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
        return None;
    }
    delta.get("text").and_then(Value::as_str).map(String::from)
}

fn looks_like_result(line: &str) -> bool {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.contains(r#""type":"result""#)
}

fn preview(line: &str) -> String {
    const MAX_CHARS: usize = 200;
    if line.chars().count() <= MAX_CHARS {
        return line.to_string();
    }
    let head: String = line.chars().take(MAX_CHARS).collect();
    format!("{head}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const RESULT_LINE: &str = r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":1200,"num_turns":1,"result":"Hello there","session_id":"sess-1","total_cost_usd":0.0031,"usage":{"input_tokens":12,"cache_creation_input_tokens":100,"cache_read_input_tokens":0,"output_tokens":5}}"#;

    #[test]
    fn test_parse_result_record() {
        let events = parse_line(RESULT_LINE).unwrap();
        let [StreamEvent::Result(record)] = events.as_slice() else {
            panic!("expected a single result event, got {events:?}");
        };
        assert_eq!(record.session_id, "sess-1");
        assert_eq!(record.result.as_deref(), Some("Hello there"));
        assert!(!record.is_error);
        assert_eq!(record.usage.input_tokens, 12);
        assert_eq!(record.usage.cache_creation_input_tokens, 100);
        assert_eq!(record.usage.output_tokens, 5);
        assert_eq!(record.usage.total_tokens, None);
    }

    #[test]
    fn test_parse_text_delta() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}},"session_id":"sess-1"}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            vec![StreamEvent::TextDelta("Hel".to_string())]
        );

        let start = r#"{"type":"stream_event","event":{"type":"message_start","message":{}}}"#;
        assert!(parse_line(start).unwrap().is_empty());
    }

    #[test]
    fn test_parse_assistant_message_blocks() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Let me look"},{"type":"tool_use","id":"toolu_1","name":"WebSearch","input":{"query":"rust"}},{"type":"thinking","thinking":"..."}]}}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            vec![
                StreamEvent::AssistantText("Let me look".to_string()),
                StreamEvent::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "WebSearch".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_system_init() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-9","model":"claude-sonnet","tools":["Read"]}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            vec![StreamEvent::Init {
                session_id: Some("sess-9".to_string()),
                model: Some("claude-sonnet".to_string()),
            }]
        );
    }

    #[test]
    fn test_garbage_lines_are_not_fatal() {
        assert!(parse_line("not json at all").unwrap().is_empty());
        assert!(parse_line(r#"{"no_type": true}"#).unwrap().is_empty());
        assert!(parse_line(r#"{"type":"assistant","message":"oops"}"#)
            .unwrap()
            .is_empty());
        assert!(parse_line(r#"{"type":"user","message":{"content":[]}}"#)
            .unwrap()
            .is_empty());
        assert!(parse_line("   ").unwrap().is_empty());
    }

    #[test]
    fn test_broken_result_is_fatal() {
        // Truncated JSON that is clearly the terminal record
        let truncated = r#"{"type": "result", "session_id": "sess-1", "usage": {"#;
        assert!(matches!(
            parse_line(truncated),
            Err(ProtocolError::MalformedResult(_))
        ));

        // Valid JSON, wrong shape
        let missing_session = r#"{"type":"result","result":"hi"}"#;
        assert!(matches!(
            parse_line(missing_session),
            Err(ProtocolError::MalformedResult(_))
        ));

        let negative_tokens =
            r#"{"type":"result","session_id":"s","usage":{"input_tokens":-3}}"#;
        assert!(matches!(
            parse_line(negative_tokens),
            Err(ProtocolError::MalformedResult(_))
        ));
    }

    #[tokio::test]
    async fn test_parse_events_from_byte_stream() {
        let output = format!(
            "{}\n{}\nnot json\n{}\n{}\n",
            r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":" there"}}}"#,
            RESULT_LINE,
        );

        let events: Vec<_> = parse_events(output.as_bytes()).collect().await;
        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();

        assert_eq!(events.len(), 4);
        assert_eq!(events[1], StreamEvent::TextDelta("Hello".to_string()));
        assert_eq!(events[2], StreamEvent::TextDelta(" there".to_string()));
        assert!(matches!(events[3], StreamEvent::Result(_)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_lose_result() {
        let mut output = Vec::new();
        output.extend_from_slice(br#"{"type":"system","subtype":"init","session_id":"sess-1"}"#);
        output.push(b'\n');
        output.extend_from_slice(&[0xff, 0xfe, b'x', b'\n']);
        output.extend_from_slice(RESULT_LINE.as_bytes());
        output.push(b'\n');

        let events: Vec<_> = parse_events(output.as_slice()).collect().await;
        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();

        assert_eq!(events.len(), 2);
        let StreamEvent::Result(record) = &events[1] else {
            panic!("expected result record last, got {events:?}");
        };
        assert_eq!(record.session_id, "sess-1");
    }

    #[tokio::test]
    async fn test_last_line_without_newline_is_parsed() {
        let events: Vec<_> = parse_events(RESULT_LINE.as_bytes()).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Result(_))));
    }

    #[tokio::test]
    async fn test_parse_events_surfaces_malformed_result() {
        let output = "{\"type\":\"result\",\"is_error\":false}\n";
        let events: Vec<_> = parse_events(output.as_bytes()).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(ProtocolError::MalformedResult(_))));
    }
}
