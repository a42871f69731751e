//! Append-only audit event stream.
//!
//! Events are emitted at every configuration mutation site and at gateway
//! policy denials. The default sink writes structured `tracing` records on
//! the dedicated `doorman::audit` target; the memory sink backs tests and
//! the readiness diagnostics.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::info;

use doorman_core::AuditEvent;

/// Where audit events go. Implementations must be cheap: the pipeline
/// emits events inline (fire-and-forget from the caller's perspective).
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Sink that emits one structured log line per event.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "doorman::audit",
            actor = %event.actor,
            action = %event.action,
            audit_target = %event.target,
            status = %event.status,
            details = event.details.as_deref().unwrap_or(""),
            request_id = %event.request_id,
            "audit"
        );
    }
}

/// Bounded in-memory ring of recent events.
#[derive(Debug)]
pub struct MemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of retained events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_retains_in_order() {
        let sink = MemoryAuditSink::new(10);
        sink.record(AuditEvent::new("alice", "api.create", "echo/v1", "success", "r1"));
        sink.record(AuditEvent::new("bob", "api.delete", "echo/v1", "failure", "r2"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].actor, "alice");
        assert_eq!(events[1].status, "failure");
    }

    #[test]
    fn memory_sink_is_bounded() {
        let sink = MemoryAuditSink::new(3);
        for i in 0..10 {
            sink.record(AuditEvent::new("a", "act", format!("t{i}"), "success", "r"));
        }
        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].target, "t7");
    }
}
