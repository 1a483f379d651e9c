//! Session store abstraction
//!
//! The runner only sees this trait, so tests can swap the SQLite-backed
//! store for an in-memory database or a fake.

use crate::db::{Database, DbError, SessionRecord, TokenCounts};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Idle-eviction policy for stored sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Sessions untouched for longer than this are dropped
    pub idle_ttl: Duration,
    /// Hard cap on stored sessions; least recently active go first
    pub max_conversations: usize,
}

/// Conversation → tool session mapping
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current session for a conversation, if any
    async fn get(&self, conversation_id: &str) -> Result<Option<SessionRecord>, DbError>;

    /// Store the session to resume next time, with the tool's cumulative usage
    async fn put(
        &self,
        conversation_id: &str,
        session_id: &str,
        cumulative: TokenCounts,
    ) -> Result<(), DbError>;

    /// Apply the eviction policy relative to `now`; returns entries removed
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, DbError>;
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn get(&self, conversation_id: &str) -> Result<Option<SessionRecord>, DbError> {
        (**self).get(conversation_id).await
    }

    async fn put(
        &self,
        conversation_id: &str,
        session_id: &str,
        cumulative: TokenCounts,
    ) -> Result<(), DbError> {
        (**self).put(conversation_id, session_id, cumulative).await
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        (**self).evict_expired(now).await
    }
}

/// Adapter to use `Database` as a `SessionStore`
#[derive(Clone)]
pub struct DatabaseSessionStore {
    db: Database,
    policy: EvictionPolicy,
}

impl DatabaseSessionStore {
    pub fn new(db: Database, policy: EvictionPolicy) -> Self {
        Self { db, policy }
    }
}

#[async_trait]
impl SessionStore for DatabaseSessionStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<SessionRecord>, DbError> {
        self.db.get_session(conversation_id)
    }

    async fn put(
        &self,
        conversation_id: &str,
        session_id: &str,
        cumulative: TokenCounts,
    ) -> Result<(), DbError> {
        self.db
            .upsert_session(conversation_id, session_id, cumulative, Utc::now())
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        self.db
            .evict_sessions(now, self.policy.idle_ttl, self.policy.max_conversations)
    }
}
