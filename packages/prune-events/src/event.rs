//! Flush-time event view and per-handler derived data.
//!
//! # Deferred suppression
//!
//! By the time a coalesced event is dispatched, the raw occurrence it came
//! from has usually left the host's event loop, so suppressing it would have
//! no effect. [`FrameEvent`] therefore redirects `prevent_default`,
//! `stop_propagation` and `stop_immediate_propagation` to flags shared with
//! the channel. The channel applies the real suppression to the *next* raw
//! occurrence, before buffering it. The flags are reset at the start of each
//! flush.
//!
//! This costs one frame of latency: the occurrence that was flushed is never
//! suppressed, only the ones that follow it.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::source::{RawEvent, SourceId};

// ============================================================================
// Suppression
// ============================================================================

/// A suppression action that can be requested on a frame event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suppression {
    /// Prevent the default action.
    PreventDefault,
    /// Stop propagation.
    StopPropagation,
    /// Stop immediate propagation.
    StopImmediatePropagation,
}

/// Suppression requests recorded during a flush, applied on the next raw event.
#[derive(Debug, Default)]
pub struct SuppressionFlags {
    prevent_default: AtomicBool,
    stop_propagation: AtomicBool,
    stop_immediate_propagation: AtomicBool,
}

impl SuppressionFlags {
    /// Creates a set of cleared flags.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    const fn flag(&self, kind: Suppression) -> &AtomicBool {
        match kind {
            Suppression::PreventDefault => &self.prevent_default,
            Suppression::StopPropagation => &self.stop_propagation,
            Suppression::StopImmediatePropagation => &self.stop_immediate_propagation,
        }
    }

    /// Records a suppression request.
    pub fn set(&self, kind: Suppression) { self.flag(kind).store(true, Ordering::SeqCst); }

    /// Returns `true` if `kind` has been requested since the last reset.
    #[must_use]
    pub fn is_set(&self, kind: Suppression) -> bool { self.flag(kind).load(Ordering::SeqCst) }

    /// Returns `true` if any suppression has been requested.
    #[must_use]
    pub fn any(&self) -> bool {
        self.is_set(Suppression::PreventDefault)
            || self.is_set(Suppression::StopPropagation)
            || self.is_set(Suppression::StopImmediatePropagation)
    }

    /// Clears every flag.
    pub fn reset(&self) {
        self.prevent_default.store(false, Ordering::SeqCst);
        self.stop_propagation.store(false, Ordering::SeqCst);
        self.stop_immediate_propagation.store(false, Ordering::SeqCst);
    }

    /// Applies the requested suppressions to a raw event.
    ///
    /// Flags are left set: every raw occurrence until the next flush is
    /// suppressed the same way.
    pub fn apply_to<E: RawEvent>(&self, event: &E) {
        if self.is_set(Suppression::PreventDefault) {
            event.prevent_default();
        }
        if self.is_set(Suppression::StopPropagation) {
            event.stop_propagation();
        }
        if self.is_set(Suppression::StopImmediatePropagation) {
            event.stop_immediate_propagation();
        }
    }
}

// ============================================================================
// FrameEvent
// ============================================================================

/// The coalesced event handed to handlers at flush time.
///
/// Dereferences to the latest raw event. The suppression methods here shadow
/// the ones on the raw event and only record the request (see the module
/// docs).
pub struct FrameEvent<E> {
    event: E,
    source_id: SourceId,
    event_type: Arc<str>,
    flags: Arc<SuppressionFlags>,
}

impl<E: RawEvent> FrameEvent<E> {
    pub(crate) const fn new(
        event: E,
        source_id: SourceId,
        event_type: Arc<str>,
        flags: Arc<SuppressionFlags>,
    ) -> Self {
        Self { event, source_id, event_type, flags }
    }

    /// The latest raw event seen before this flush.
    #[must_use]
    pub const fn event(&self) -> &E { &self.event }

    /// Identity of the source this event came from.
    #[must_use]
    pub const fn source_id(&self) -> SourceId { self.source_id }

    /// The event type this event was registered under.
    #[must_use]
    pub fn event_type(&self) -> &str { &self.event_type }

    /// Requests that the default action of the next raw occurrence be prevented.
    pub fn prevent_default(&self) { self.flags.set(Suppression::PreventDefault); }

    /// Requests that the next raw occurrence stop propagating.
    pub fn stop_propagation(&self) { self.flags.set(Suppression::StopPropagation); }

    /// Requests immediate propagation stop on the next raw occurrence.
    pub fn stop_immediate_propagation(&self) {
        self.flags.set(Suppression::StopImmediatePropagation);
    }

    /// Returns `true` if a handler called [`FrameEvent::prevent_default`].
    #[must_use]
    pub fn is_default_prevented(&self) -> bool { self.flags.is_set(Suppression::PreventDefault) }

    /// Returns `true` if a handler called [`FrameEvent::stop_propagation`].
    #[must_use]
    pub fn is_propagation_stopped(&self) -> bool {
        self.flags.is_set(Suppression::StopPropagation)
    }

    /// Returns `true` if a handler called [`FrameEvent::stop_immediate_propagation`].
    #[must_use]
    pub fn is_immediate_propagation_stopped(&self) -> bool {
        self.flags.is_set(Suppression::StopImmediatePropagation)
    }
}

impl<E> Deref for FrameEvent<E> {
    type Target = E;

    fn deref(&self) -> &E { &self.event }
}

impl<E: fmt::Debug> fmt::Debug for FrameEvent<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEvent")
            .field("event", &self.event)
            .field("source_id", &self.source_id)
            .field("event_type", &self.event_type)
            .field("flags", &self.flags)
            .finish()
    }
}

// ============================================================================
// DerivedData
// ============================================================================

/// A type-erased value computed by a data handler from a raw event.
///
/// Cheap to clone. Use [`DerivedData::downcast_ref`] to read it back.
#[derive(Clone)]
pub struct DerivedData(Arc<dyn Any + Send + Sync>);

impl DerivedData {
    /// Wraps a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self { Self(Arc::new(value)) }

    /// Returns the value if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> { self.0.downcast_ref::<T>() }

    /// Returns `true` if the value is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool { self.0.is::<T>() }
}

impl fmt::Debug for DerivedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedData").finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
