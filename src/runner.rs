//! Turn orchestration
//!
//! `run_turn` is the one entry point the HTTP layer uses: serialize on the
//! conversation, look up the session to resume, run the tool, and store the
//! continuation only when the turn succeeded.

mod error;
mod prompt;

#[cfg(test)]
pub mod testing;

pub use error::TurnError;
pub use prompt::{render_prompt, ChatMessage, Role};

use crate::assembler::{ResponseAssembler, TokenUsage, UsageAccounting};
use crate::cli::{Invocation, Invoker, ProtocolError};
use crate::db::{Database, NewUsageRecord, TokenCounts};
use crate::serializer::TurnLocks;
use crate::store::{DatabaseSessionStore, SessionStore};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runner as the server holds it. The invoker is boxed so tests can drive the
/// HTTP layer with a mock.
pub type ProductionRunner = TurnRunner<DatabaseSessionStore, Arc<dyn Invoker>>;

/// One turn to run
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// `None` starts a new conversation; its id is minted on success
    pub conversation_id: Option<String>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Overrides the runner's default budget
    pub timeout: Option<Duration>,
    /// Label usage is recorded under
    pub source: String,
    pub request_id: String,
}

/// Outcome of a successful turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    /// Conversation the session is stored under
    pub conversation_id: String,
    pub session_id: String,
    pub text: String,
    pub usage: TokenUsage,
    pub cost_usd: Option<f64>,
    /// Whether an existing session was continued
    pub resumed: bool,
}

/// Runner knobs
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    pub default_timeout: Duration,
    pub lock_timeout: Option<Duration>,
    pub accounting: UsageAccounting,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            lock_timeout: None,
            accounting: UsageAccounting::PerInvocation,
        }
    }
}

/// Serializes turns per conversation and drives the invoker
pub struct TurnRunner<S, I>
where
    S: SessionStore + 'static,
    I: Invoker + 'static,
{
    store: S,
    invoker: I,
    locks: TurnLocks,
    config: RunnerConfig,
    usage_log: Option<Database>,
}

impl<S, I> TurnRunner<S, I>
where
    S: SessionStore + 'static,
    I: Invoker + 'static,
{
    pub fn new(store: S, invoker: I, config: RunnerConfig) -> Self {
        Self {
            store,
            invoker,
            locks: TurnLocks::new(),
            config,
            usage_log: None,
        }
    }

    /// Record usage of every successful turn in `db`
    pub fn with_usage_log(mut self, db: Database) -> Self {
        self.usage_log = Some(db);
        self
    }

    /// Run one turn to completion
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnResult, TurnError> {
        self.run(request, cancel, None).await
    }

    /// Run one turn, forwarding assistant text deltas as they arrive
    pub async fn run_turn_streaming(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
        deltas: mpsc::UnboundedSender<String>,
    ) -> Result<TurnResult, TurnError> {
        self.run(request, cancel, Some(&deltas)).await
    }

    async fn run(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
        deltas: Option<&mpsc::UnboundedSender<String>>,
    ) -> Result<TurnResult, TurnError> {
        let started = Instant::now();
        let key = request.conversation_id.as_deref();

        // Cancel also covers the lock wait; dropping `locked` kills any process
        let locked = self
            .locks
            .with_lock(key, self.config.lock_timeout, self.execute(&request, deltas));
        let outcome = tokio::select! {
            biased;

            () = cancel.cancelled() => Err(TurnError::Cancelled),

            result = locked => result
                .map_err(|e| TurnError::LockTimeout(e.waited))
                .and_then(|inner| inner),
        };

        let duration_ms = started.elapsed().as_millis();
        match &outcome {
            Ok(result) => {
                tracing::info!(
                    conv_id = %result.conversation_id,
                    request_id = %request.request_id,
                    model = %request.model,
                    resumed = result.resumed,
                    duration_ms = %duration_ms,
                    input_tokens = result.usage.input_tokens,
                    output_tokens = result.usage.output_tokens,
                    cost_usd = ?result.cost_usd,
                    "Turn completed"
                );
                self.record_usage(&request, result);
            }
            Err(e) => {
                tracing::error!(
                    conv_id = ?request.conversation_id,
                    request_id = %request.request_id,
                    model = %request.model,
                    duration_ms = %duration_ms,
                    kind = e.kind(),
                    error = %e,
                    "Turn failed"
                );
            }
        }

        outcome
    }

    /// Everything that happens under the conversation lock
    async fn execute(
        &self,
        request: &TurnRequest,
        deltas: Option<&mpsc::UnboundedSender<String>>,
    ) -> Result<TurnResult, TurnError> {
        let previous = match &request.conversation_id {
            Some(id) => self.store.get(id).await?,
            None => None,
        };
        let resume = previous.as_ref().map(|p| p.session_id.clone());
        let resumed = resume.is_some();

        let invocation = Invocation {
            model: request.model.clone(),
            prompt: render_prompt(&request.messages, resumed),
            resume,
        };

        let mut events = self
            .invoker
            .start(&invocation)
            .map_err(TurnError::LaunchFailure)?;

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let mut assembler = ResponseAssembler::new();

        let drain = async {
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| match e {
                    ProtocolError::MalformedResult(msg) => TurnError::MalformedTerminalOutput(msg),
                    ProtocolError::Io(err) => {
                        TurnError::MalformedTerminalOutput(format!("output stream failed: {err}"))
                    }
                })?;
                if let Some(delta) = assembler.push(event) {
                    if let Some(tx) = deltas {
                        // Receiver gone means the caller stopped listening; the
                        // cancel token handles that case.
                        let _ = tx.send(delta);
                    }
                }
            }
            Ok::<(), TurnError>(())
        };

        // Returning early drops `events`, which kills the process group
        tokio::select! {
            () = tokio::time::sleep(timeout) => return Err(TurnError::Timeout(timeout)),

            drained = drain => drained?,
        }
        drop(events);

        let assembled = assembler.finish(
            self.config.accounting,
            previous.as_ref().map_or(TokenCounts::default(), |p| p.cumulative),
        )?;

        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.store
            .put(&conversation_id, &assembled.session_id, assembled.cumulative)
            .await?;

        if assembled.tool_uses > 0 {
            tracing::debug!(conv_id = %conversation_id, tool_uses = assembled.tool_uses, "Turn used tools");
        }

        Ok(TurnResult {
            conversation_id,
            session_id: assembled.session_id,
            text: assembled.text,
            usage: assembled.usage,
            cost_usd: assembled.cost_usd,
            resumed,
        })
    }

    fn record_usage(&self, request: &TurnRequest, result: &TurnResult) {
        let Some(db) = &self.usage_log else {
            return;
        };
        let record = NewUsageRecord {
            source: &request.source,
            model: &request.model,
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            total_tokens: result.usage.total_tokens,
            conversation_id: Some(&result.conversation_id),
            request_id: &request.request_id,
        };
        if let Err(e) = db.record_usage(&record, Utc::now()) {
            tracing::warn!(error = %e, request_id = %request.request_id, "Failed to record usage");
        }
    }

    /// Apply the store's eviction policy and prune unused locks
    pub async fn evict_idle(&self) -> Result<usize, TurnError> {
        let evicted = self.store.evict_expired(Utc::now()).await?;
        let pruned = self.locks.prune_idle();
        if evicted > 0 || pruned > 0 {
            tracing::info!(
                evicted,
                pruned_locks = pruned,
                busy = self.locks.len(),
                "Evicted idle conversations"
            );
        }
        Ok(evicted)
    }

    /// Periodically evict idle conversations until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = runner.evict_idle().await {
                            tracing::warn!(error = %e, "Eviction sweep failed");
                        }
                    }
                }
            }
            tracing::info!("Session sweeper stopped");
        })
    }
}
