//! Database schema and types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    conversation_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    cumulative_input_tokens INTEGER NOT NULL DEFAULT 0,
    cumulative_output_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_activity ON sessions(last_activity_at);

CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'unknown',
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    conversation_id TEXT,
    request_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_source ON usage_records(source);
CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_records(timestamp);
CREATE INDEX IF NOT EXISTS idx_usage_source_timestamp ON usage_records(source, timestamp);
";

/// Stored mapping from a conversation to the tool session that continues it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub conversation_id: String,
    pub session_id: String,
    /// Usage counters as last reported by the tool for this session
    pub cumulative: TokenCounts,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Plain input/output token pair
#[allow(clippy::struct_field_names)] // tokens suffix is meaningful
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Usage row to insert after a successful turn
#[derive(Debug, Clone)]
pub struct NewUsageRecord<'a> {
    pub source: &'a str,
    pub model: &'a str,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub conversation_id: Option<&'a str>,
    pub request_id: &'a str,
}

/// One usage row as returned by queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub timestamp: String,
    pub source: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub conversation_id: Option<String>,
    pub request_id: String,
}

/// Aggregated usage for one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub source: String,
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
}

/// Filters shared by the usage queries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageFilter {
    pub source: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}
