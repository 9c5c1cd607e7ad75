//! Dispatch event sinks.

use parking_lot::Mutex;
use tracing::{info, warn};

use relay_types::DispatchEvent;

/// Receives one [`DispatchEvent`] per dispatch attempt.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DispatchEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DispatchEvent) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DispatchEvent) {
        let request_id = event.request_id.as_ref().map(|r| r.short().to_string());
        let step_id = event.step_id.as_ref().map(|s| s.to_string());
        if event.success {
            info!(
                request_id = ?request_id,
                step_id = ?step_id,
                backend = %event.target,
                latency_ms = event.latency.as_millis() as u64,
                cost = event.cost,
                attempt = event.attempt,
                cache_hit = event.cache_hit,
                "Dispatch succeeded"
            );
        } else {
            warn!(
                request_id = ?request_id,
                step_id = ?step_id,
                backend = %event.target,
                latency_ms = event.latency.as_millis() as u64,
                attempt = event.attempt,
                error = event.error.as_deref().unwrap_or("unknown"),
                "Dispatch failed"
            );
        }
    }
}

/// Keeps events in memory, mostly for tests and offline inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Remove and return everything collected so far.
    pub fn drain(&self) -> Vec<DispatchEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: DispatchEvent) {
        self.events.lock().push(event);
    }
}
