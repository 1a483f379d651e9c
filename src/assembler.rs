//! Folding an invocation's event stream into a turn result

#[cfg(test)]
mod proptests;

use crate::cli::{ResultRecord, ResultUsage, StreamEvent};
use crate::db::TokenCounts;
use crate::runner::TurnError;
use serde::Serialize;

/// How the tool's result record reports usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UsageAccounting {
    /// Usage covers this invocation only (the CLI's documented behavior)
    #[default]
    PerInvocation,
    /// Usage is a running total for the session; subtract the stored total
    Cumulative,
}

impl std::str::FromStr for UsageAccounting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_invocation" | "per-invocation" | "delta" => Ok(Self::PerInvocation),
            "cumulative" => Ok(Self::Cumulative),
            other => Err(format!("unknown usage accounting mode: {other}")),
        }
    }
}

/// Token usage for one turn
#[allow(clippy::struct_field_names)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Successful outcome of one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub text: String,
    pub session_id: String,
    pub usage: TokenUsage,
    /// Running totals to store for the session
    pub cumulative: TokenCounts,
    pub cost_usd: Option<f64>,
    pub tool_uses: usize,
}

/// Accumulates events in arrival order
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    deltas: String,
    saw_delta: bool,
    assistant_text: String,
    tool_uses: usize,
    result: Option<ResultRecord>,
    exit: Option<(Option<i32>, String)>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Returns the text delta, if any, for live forwarding.
    pub fn push(&mut self, event: StreamEvent) -> Option<String> {
        match event {
            StreamEvent::TextDelta(text) => {
                self.saw_delta = true;
                self.deltas.push_str(&text);
                return Some(text);
            }
            StreamEvent::AssistantText(text) => self.assistant_text.push_str(&text),
            StreamEvent::ToolUse { id, name } => {
                self.tool_uses += 1;
                tracing::debug!(tool = %name, tool_use_id = %id, "claude used a tool");
            }
            StreamEvent::Result(record) => {
                if self.result.is_some() {
                    tracing::warn!("Ignoring extra result record");
                } else {
                    self.result = Some(record);
                }
            }
            StreamEvent::Exited { code, stderr } => self.exit = Some((code, stderr)),
            StreamEvent::Init { session_id, model } => {
                tracing::debug!(session_id = ?session_id, model = ?model, "claude session started");
            }
        }
        None
    }

    /// Produce the turn outcome.
    ///
    /// `previous` is the stored running total for the conversation (zero for
    /// a fresh session).
    pub fn finish(
        self,
        accounting: UsageAccounting,
        previous: TokenCounts,
    ) -> Result<Assembled, TurnError> {
        let Some(record) = self.result else {
            return Err(match self.exit {
                Some((code, stderr)) if code != Some(0) => {
                    TurnError::ProcessFailed { code, stderr }
                }
                _ => TurnError::MalformedTerminalOutput(
                    "claude finished without a result record".to_string(),
                ),
            });
        };

        if let Some((code, _)) = &self.exit {
            if *code != Some(0) {
                tracing::warn!(code = ?code, is_error = record.is_error, "claude exited non-zero after a result record");
            }
        }

        tracing::debug!(
            session_id = %record.session_id,
            num_turns = ?record.num_turns,
            tool_duration_ms = ?record.duration_ms,
            "Result record received"
        );

        if record.is_error {
            let message = record
                .result
                .filter(|r| !r.trim().is_empty())
                .or(record.subtype)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(TurnError::ToolReportedFailure(message));
        }

        let text = match record.result {
            Some(text) => text,
            None if self.saw_delta => self.deltas,
            None => self.assistant_text,
        };

        let (usage, cumulative) = account(&record.usage, accounting, previous);

        Ok(Assembled {
            text,
            session_id: record.session_id,
            usage,
            cumulative,
            cost_usd: record.total_cost_usd,
            tool_uses: self.tool_uses,
        })
    }
}

/// Turn usage plus the running total to store
pub fn account(
    reported: &ResultUsage,
    accounting: UsageAccounting,
    previous: TokenCounts,
) -> (TokenUsage, TokenCounts) {
    let reported_counts = TokenCounts {
        input_tokens: reported
            .input_tokens
            .saturating_add(reported.cache_creation_input_tokens)
            .saturating_add(reported.cache_read_input_tokens),
        output_tokens: reported.output_tokens,
    };

    let (turn, cumulative, explicit_total) = match accounting {
        UsageAccounting::PerInvocation => (
            reported_counts,
            TokenCounts {
                input_tokens: previous.input_tokens.saturating_add(reported_counts.input_tokens),
                output_tokens: previous
                    .output_tokens
                    .saturating_add(reported_counts.output_tokens),
            },
            reported.total_tokens,
        ),
        UsageAccounting::Cumulative => {
            // A running total below the stored one means the tool started over
            let restarted = reported_counts.input_tokens < previous.input_tokens
                || reported_counts.output_tokens < previous.output_tokens;
            let base = if restarted { TokenCounts::default() } else { previous };
            let turn = TokenCounts {
                input_tokens: reported_counts.input_tokens - base.input_tokens,
                output_tokens: reported_counts.output_tokens - base.output_tokens,
            };
            let base_total = base.input_tokens.saturating_add(base.output_tokens);
            let explicit = reported.total_tokens.map(|t| t.saturating_sub(base_total));
            (turn, reported_counts, explicit)
        }
    };

    let usage = TokenUsage {
        input_tokens: turn.input_tokens,
        output_tokens: turn.output_tokens,
        total_tokens: explicit_total
            .unwrap_or_else(|| turn.input_tokens.saturating_add(turn.output_tokens)),
    };
    (usage, cumulative)
}
