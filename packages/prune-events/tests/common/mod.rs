//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use prune_events::{
    Coalescer, Emitter, EventSource, ManualTicker, RawEvent, RawListener, Suppression,
};

// ============================================================================
// Events
// ============================================================================

/// A pointer event that records the suppressions applied to it.
#[derive(Clone, Debug, Default)]
pub struct PointerEvent {
    pub x: i32,
    pub applied: Arc<Mutex<Vec<Suppression>>>,
}

impl PointerEvent {
    pub fn at(x: i32) -> Self { Self { x, ..Self::default() } }

    pub fn applied(&self) -> Vec<Suppression> { self.applied.lock().clone() }
}

impl RawEvent for PointerEvent {
    fn prevent_default(&self) { self.applied.lock().push(Suppression::PreventDefault); }

    fn stop_propagation(&self) { self.applied.lock().push(Suppression::StopPropagation); }

    fn stop_immediate_propagation(&self) {
        self.applied.lock().push(Suppression::StopImmediatePropagation);
    }
}

// ============================================================================
// Sources
// ============================================================================

/// A call the coalescer made on a [`RecordingSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceCall {
    Add(String),
    Remove(String),
}

/// An [`Emitter`] that logs every attach and detach it receives.
#[derive(Default)]
pub struct RecordingSource {
    emitter: Emitter<PointerEvent>,
    calls: Mutex<Vec<SourceCall>>,
}

impl RecordingSource {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn emit(&self, event_type: &str, event: &PointerEvent) -> usize {
        self.emitter.emit(event_type, event)
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.emitter.listener_count(event_type)
    }

    pub fn calls(&self) -> Vec<SourceCall> { self.calls.lock().clone() }
}

impl EventSource<PointerEvent> for RecordingSource {
    fn add_listener(&self, event_type: &str, listener: RawListener<PointerEvent>) {
        self.calls.lock().push(SourceCall::Add(event_type.to_string()));
        self.emitter.add_listener(event_type, listener);
    }

    fn remove_listener(&self, event_type: &str, listener: &RawListener<PointerEvent>) {
        self.calls.lock().push(SourceCall::Remove(event_type.to_string()));
        self.emitter.remove_listener(event_type, listener);
    }
}

// ============================================================================
// Setup
// ============================================================================

/// Installs a test-friendly tracing subscriber once per test binary.
///
/// Set `RUST_LOG=prune_events=trace` to see scheduling decisions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A coalescer driven by a manual ticker.
pub fn manual_coalescer() -> (Coalescer<PointerEvent>, Arc<ManualTicker>) {
    init_tracing();
    let ticker = Arc::new(ManualTicker::new());
    (Coalescer::new(ticker.clone()), ticker)
}

/// A thread-safe log shared between a test and its handlers.
pub fn shared_log<T>() -> Arc<Mutex<Vec<T>>> { Arc::new(Mutex::new(Vec::new())) }
