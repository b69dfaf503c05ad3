//! Interception events and the sinks that receive them.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::ErrorKind;

/// Something that happened while calling an intercepted stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InterceptEvent {
    Started {
        stage: String,
        line: u64,
    },
    Succeeded {
        stage: String,
        line: u64,
        attempts: u32,
        outputs: usize,
        elapsed_us: u64,
    },
    Failed {
        stage: String,
        line: u64,
        attempts: u32,
        kind: ErrorKind,
        message: String,
    },
    Retrying {
        stage: String,
        line: u64,
        attempt: u32,
        delay_ms: u64,
    },
    ShortCircuited {
        stage: String,
        line: u64,
    },
    HookFailed {
        stage: String,
        hook: String,
        message: String,
    },
}

impl InterceptEvent {
    pub fn stage(&self) -> &str {
        match self {
            InterceptEvent::Started { stage, .. }
            | InterceptEvent::Succeeded { stage, .. }
            | InterceptEvent::Failed { stage, .. }
            | InterceptEvent::Retrying { stage, .. }
            | InterceptEvent::ShortCircuited { stage, .. }
            | InterceptEvent::HookFailed { stage, .. } => stage,
        }
    }
}

/// Receiver for interception events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: InterceptEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: InterceptEvent) {
        match event {
            InterceptEvent::Started { stage, line } => trace!(%stage, line, "invocation started"),
            InterceptEvent::Succeeded {
                stage,
                line,
                attempts,
                outputs,
                elapsed_us,
            } => trace!(%stage, line, attempts, outputs, elapsed_us, "invocation succeeded"),
            InterceptEvent::Failed {
                stage,
                line,
                attempts,
                kind,
                message,
            } => debug!(%stage, line, attempts, %kind, %message, "invocation failed"),
            InterceptEvent::Retrying {
                stage,
                line,
                attempt,
                delay_ms,
            } => warn!(%stage, line, attempt, delay_ms, "retrying after transient failure"),
            InterceptEvent::ShortCircuited { stage, line } => {
                warn!(%stage, line, "circuit open, stage not called")
            }
            InterceptEvent::HookFailed {
                stage,
                hook,
                message,
            } => warn!(%stage, %hook, %message, "hook failed"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<InterceptEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InterceptEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: InterceptEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: InterceptEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.emit(InterceptEvent::Started {
            stage: "A".to_string(),
            line: 1,
        });
        sink.emit(InterceptEvent::ShortCircuited {
            stage: "B".to_string(),
            line: 2,
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stage(), "A");
        assert_eq!(events[1].stage(), "B");
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = InterceptEvent::Failed {
            stage: "NUMBER".to_string(),
            line: 2,
            attempts: 1,
            kind: ErrorKind::Validation,
            message: "bad".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["kind"], "validation");
    }
}
