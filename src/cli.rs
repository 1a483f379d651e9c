//! Headless `claude` CLI integration
//!
//! Split into argument construction, the stream-json protocol parser, and
//! process supervision so each can be tested without the others.

mod args;
mod process;
mod protocol;

pub use args::{Invocation, ToolPolicy};
pub use process::{prepare_scratch_dir, ClaudeInvoker};
pub use protocol::{ProtocolError, ResultRecord, ResultUsage, StreamEvent};

use futures::stream::BoxStream;
use std::sync::Arc;

/// Events of one invocation, ending with `StreamEvent::Exited` for real
/// processes. Dropping the stream terminates the process.
pub type EventStream = BoxStream<'static, Result<StreamEvent, ProtocolError>>;

/// Something that can run one turn against the tool
pub trait Invoker: Send + Sync {
    /// Launch the invocation. Errors here mean nothing was started.
    fn start(&self, invocation: &Invocation) -> std::io::Result<EventStream>;
}

impl<T: Invoker + ?Sized> Invoker for Arc<T> {
    fn start(&self, invocation: &Invocation) -> std::io::Result<EventStream> {
        (**self).start(invocation)
    }
}
