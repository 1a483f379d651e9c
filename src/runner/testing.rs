//! Mock invoker for testing the runner without spawning processes

use crate::cli::{
    EventStream, Invocation, Invoker, ProtocolError, ResultRecord, ResultUsage, StreamEvent,
};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Scripted behavior for one invocation
#[derive(Debug, Clone)]
pub struct Script {
    delay: Duration,
    events: Vec<Result<StreamEvent, String>>,
    launch_error: bool,
}

impl Script {
    /// Stream a couple of deltas then a successful result
    pub fn success(session_id: &str, text: &str) -> Self {
        Self::success_with_usage(session_id, text, 10, 5)
    }

    pub fn success_with_usage(session_id: &str, text: &str, input: u64, output: u64) -> Self {
        Self {
            delay: Duration::ZERO,
            events: vec![
                Ok(StreamEvent::Init {
                    session_id: Some(session_id.to_string()),
                    model: None,
                }),
                Ok(StreamEvent::TextDelta(text.to_string())),
                Ok(StreamEvent::Result(ResultRecord {
                    subtype: Some("success".to_string()),
                    is_error: false,
                    result: Some(text.to_string()),
                    session_id: session_id.to_string(),
                    usage: ResultUsage {
                        input_tokens: input,
                        output_tokens: output,
                        ..Default::default()
                    },
                    total_cost_usd: Some(0.001),
                    num_turns: Some(1),
                    duration_ms: Some(5),
                })),
                Ok(StreamEvent::Exited {
                    code: Some(0),
                    stderr: String::new(),
                }),
            ],
            launch_error: false,
        }
    }

    /// Terminal record flags failure
    pub fn tool_error(session_id: &str, message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            events: vec![
                Ok(StreamEvent::Result(ResultRecord {
                    subtype: Some("success".to_string()),
                    is_error: true,
                    result: Some(message.to_string()),
                    session_id: session_id.to_string(),
                    usage: ResultUsage::default(),
                    total_cost_usd: None,
                    num_turns: None,
                    duration_ms: None,
                })),
                Ok(StreamEvent::Exited {
                    code: Some(1),
                    stderr: String::new(),
                }),
            ],
            launch_error: false,
        }
    }

    /// Terminal record cannot be decoded
    pub fn malformed() -> Self {
        Self {
            delay: Duration::ZERO,
            events: vec![
                Ok(StreamEvent::TextDelta("partial".to_string())),
                Err("missing field `session_id`".to_string()),
            ],
            launch_error: false,
        }
    }

    /// Never produces anything
    pub fn hang() -> Self {
        Self {
            delay: Duration::from_secs(3600),
            events: Vec::new(),
            launch_error: false,
        }
    }

    /// The process cannot be started
    pub fn launch_failure() -> Self {
        Self {
            delay: Duration::ZERO,
            events: Vec::new(),
            launch_error: true,
        }
    }

    /// Wait before emitting the first event
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Start/end bookkeeping across all invocations
#[derive(Debug, Default)]
pub struct InvocationStats {
    active: AtomicUsize,
    max_active: AtomicUsize,
    intervals: Mutex<Vec<(Instant, Instant)>>,
}

impl InvocationStats {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Completed (or dropped) invocations, in completion order
    pub fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.intervals.lock().unwrap().clone()
    }
}

/// Marks one invocation active until the stream is finished or dropped
struct ActiveGuard {
    stats: Arc<InvocationStats>,
    started: Instant,
}

impl ActiveGuard {
    fn new(stats: Arc<InvocationStats>) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(now, Ordering::SeqCst);
        Self {
            stats,
            started: Instant::now(),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.stats
            .intervals
            .lock()
            .unwrap()
            .push((self.started, Instant::now()));
    }
}

/// Invoker that replays queued scripts
#[derive(Default)]
pub struct MockInvoker {
    scripts: Mutex<VecDeque<Script>>,
    invocations: Mutex<Vec<Invocation>>,
    stats: Arc<InvocationStats>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Every invocation started so far, in order
    pub fn recorded_invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn stats(&self) -> &InvocationStats {
        &self.stats
    }
}

impl Invoker for MockInvoker {
    fn start(&self, invocation: &Invocation) -> std::io::Result<EventStream> {
        self.invocations.lock().unwrap().push(invocation.clone());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| std::io::Error::other("no mock script queued"))?;
        if script.launch_error {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "claude: command not found",
            ));
        }

        let guard = ActiveGuard::new(Arc::clone(&self.stats));
        let queue: VecDeque<Result<StreamEvent, ProtocolError>> = script
            .events
            .into_iter()
            .map(|e| e.map_err(ProtocolError::MalformedResult))
            .collect();

        Ok(stream::unfold(
            (Some(script.delay), queue, guard),
            |(delay, mut queue, guard)| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let item = queue.pop_front()?;
                Some((item, (None, queue, guard)))
            },
        )
        .boxed())
    }
}
