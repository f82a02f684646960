//! Execution events for observing sandbox and invocation lifecycles
//!
//! The pool and scheduler report what they do through an [`EventSink`]. Each
//! [`ExecutionEvent`] can be rendered as a flat map of named fields
//! ([`ExecutionEvent::fields`]) for structured logs, or serialized as JSON.
//!
//! ## Sinks
//!
//! - [`LoggingEventSink`]: writes every event through `tracing`
//! - [`ChannelEventSink`]: forwards events to an unbounded channel, handy in tests
//! - [`NoOpEventSink`]: discards everything
//!
//! ```rust,no_run
//! use fnexec::events::{EventSink, ExecutionEvent, channel_sink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (sink, mut events) = channel_sink();
//!     sink.send_event(ExecutionEvent::SandboxDestroyed {
//!         function_id: "hello".into(),
//!         sandbox_id: "sbx-0".into(),
//!         reason: "idle_ttl".into(),
//!     })
//!     .await
//!     .unwrap();
//!     assert!(events.recv().await.is_some());
//! }
//! ```

use crate::types::{OutcomeKind, StartKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::mpsc;

/// Something observable the engine did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    /// A cold start finished and the sandbox is ready
    SandboxCreated {
        function_id: String,
        sandbox_id: String,
        generation: u64,
        backend: String,
        duration_ms: u64,
    },
    /// An invocation got a sandbox and its body is about to run
    InvocationStarted {
        request_id: String,
        function_id: String,
        sandbox_id: String,
        start: StartKind,
    },
    /// An invocation produced its result, whatever the outcome
    InvocationFinished {
        request_id: String,
        function_id: String,
        sandbox_id: Option<String>,
        /// `None` when no sandbox was placed
        start: Option<StartKind>,
        outcome: OutcomeKind,
        duration_ms: u64,
    },
    /// A sandbox was torn down
    SandboxDestroyed {
        function_id: String,
        sandbox_id: String,
        reason: String,
    },
}

impl ExecutionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::SandboxCreated { .. } => "sandbox_created",
            ExecutionEvent::InvocationStarted { .. } => "invocation_started",
            ExecutionEvent::InvocationFinished { .. } => "invocation_finished",
            ExecutionEvent::SandboxDestroyed { .. } => "sandbox_destroyed",
        }
    }

    /// Render the event as named fields, including its `event` name.
    pub fn fields(&self) -> BTreeMap<&'static str, String> {
        let mut fields = BTreeMap::new();
        fields.insert("event", self.name().to_string());
        match self {
            ExecutionEvent::SandboxCreated {
                function_id,
                sandbox_id,
                generation,
                backend,
                duration_ms,
            } => {
                fields.insert("function_id", function_id.clone());
                fields.insert("sandbox_id", sandbox_id.clone());
                fields.insert("generation", generation.to_string());
                fields.insert("backend", backend.clone());
                fields.insert("duration_ms", duration_ms.to_string());
            }
            ExecutionEvent::InvocationStarted {
                request_id,
                function_id,
                sandbox_id,
                start,
            } => {
                fields.insert("request_id", request_id.clone());
                fields.insert("function_id", function_id.clone());
                fields.insert("sandbox_id", sandbox_id.clone());
                fields.insert("start", start_label(*start).to_string());
            }
            ExecutionEvent::InvocationFinished {
                request_id,
                function_id,
                sandbox_id,
                start,
                outcome,
                duration_ms,
            } => {
                fields.insert("request_id", request_id.clone());
                fields.insert("function_id", function_id.clone());
                if let Some(sandbox_id) = sandbox_id {
                    fields.insert("sandbox_id", sandbox_id.clone());
                }
                if let Some(start) = start {
                    fields.insert("start", start_label(*start).to_string());
                }
                fields.insert("outcome", outcome.as_str().to_string());
                fields.insert("duration_ms", duration_ms.to_string());
            }
            ExecutionEvent::SandboxDestroyed {
                function_id,
                sandbox_id,
                reason,
            } => {
                fields.insert("function_id", function_id.clone());
                fields.insert("sandbox_id", sandbox_id.clone());
                fields.insert("reason", reason.clone());
            }
        }
        fields
    }
}

fn start_label(start: StartKind) -> &'static str {
    match start {
        StartKind::Cold => "cold",
        StartKind::Warm => "warm",
    }
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields();
        let mut first = true;
        for (key, value) in &fields {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Destination for execution events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_event(&self, event: ExecutionEvent) -> Result<(), EventError>;
}

/// Errors that can occur when delivering events
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event receiver disconnected")]
    Disconnected,
    #[error("Failed to deliver event: {0}")]
    SendFailed(String),
}

/// Channel-based sink for async consumers
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn send_event(&self, event: ExecutionEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::Disconnected)?;
        Ok(())
    }
}

/// Sink that drops every event
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn send_event(&self, _event: ExecutionEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Sink that writes events to the log
pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn send_event(&self, event: ExecutionEvent) -> Result<(), EventError> {
        match &event {
            ExecutionEvent::InvocationFinished { .. } => tracing::info!("{event}"),
            _ => tracing::debug!("{event}"),
        }
        Ok(())
    }
}

pub fn no_events() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}

pub fn logging_sink() -> Arc<dyn EventSink> {
    Arc::new(LoggingEventSink)
}

/// Create a channel sink together with its receiving end
pub fn channel_sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Arc::new(ChannelEventSink::new(sender)), receiver)
}

/// Deliver an event, logging rather than propagating delivery failures.
pub(crate) async fn emit(sink: &dyn EventSink, event: ExecutionEvent) {
    if let Err(e) = sink.send_event(event).await {
        tracing::trace!("dropped execution event: {}", e);
    }
}
