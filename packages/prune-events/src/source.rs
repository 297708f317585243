//! Event source capability.
//!
//! The engine never owns an event source. It only needs something that can
//! attach and detach a raw listener for a named event type, and a raw event
//! value that optionally supports the three suppression operations.
//!
//! [`Emitter`] is a plain in-process source for applications that do not sit
//! on top of a host toolkit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

// ============================================================================
// Types
// ============================================================================

/// A raw event value delivered by a source.
///
/// The suppression operations are optional: the defaults do nothing, which
/// is the right behavior for sources whose events cannot be suppressed.
pub trait RawEvent: Clone + Send + Sync + 'static {
    /// Suppresses the default action of the underlying interaction.
    fn prevent_default(&self) {}

    /// Stops the event from propagating further.
    fn stop_propagation(&self) {}

    /// Stops propagation and prevents remaining listeners on the same target.
    fn stop_immediate_propagation(&self) {}
}

/// A raw listener attached to a source. Compared by pointer identity.
pub type RawListener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Something that can deliver raw events of type `E` for named event types.
pub trait EventSource<E: RawEvent>: Send + Sync {
    /// Attaches `listener` for `event_type`.
    fn add_listener(&self, event_type: &str, listener: RawListener<E>);

    /// Detaches `listener` from `event_type`. Unknown listeners are ignored.
    fn remove_listener(&self, event_type: &str, listener: &RawListener<E>);
}

/// Stable identity of a registered source, allocated by the coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Creates a source identity from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self { Self(raw) }

    /// Returns the raw identity value.
    #[must_use]
    pub const fn get(self) -> u64 { self.0 }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// Address of a source allocation, used as the key of the identity map.
pub(crate) fn source_address<S: ?Sized>(source: &Arc<S>) -> usize {
    Arc::as_ptr(source).cast::<()>() as usize
}

// ============================================================================
// Emitter
// ============================================================================

/// A minimal in-process event source.
///
/// Listeners are stored per event type in attachment order. [`Emitter::emit`]
/// snapshots the listeners and calls them without holding the lock, so a
/// listener may attach or detach listeners while it runs.
pub struct Emitter<E> {
    listeners: Mutex<HashMap<String, SmallVec<[RawListener<E>; 2]>>>,
}

impl<E: RawEvent> Emitter<E> {
    /// Creates an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self { Self { listeners: Mutex::new(HashMap::new()) } }

    /// Delivers `event` to every listener attached for `event_type`.
    ///
    /// Returns the number of listeners called.
    pub fn emit(&self, event_type: &str, event: &E) -> usize {
        let listeners: SmallVec<[RawListener<E>; 2]> =
            self.listeners.lock().get(event_type).cloned().unwrap_or_default();

        for listener in &listeners {
            listener(event);
        }

        listeners.len()
    }

    /// Returns the number of listeners attached for `event_type`.
    #[must_use]
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners.lock().get(event_type).map_or(0, SmallVec::len)
    }

    /// Returns `true` if no listener is attached for any event type.
    #[must_use]
    pub fn is_idle(&self) -> bool { self.listeners.lock().is_empty() }
}

impl<E: RawEvent> Default for Emitter<E> {
    fn default() -> Self { Self::new() }
}

impl<E: RawEvent> EventSource<E> for Emitter<E> {
    fn add_listener(&self, event_type: &str, listener: RawListener<E>) {
        self.listeners.lock().entry(event_type.to_string()).or_default().push(listener);
    }

    fn remove_listener(&self, event_type: &str, listener: &RawListener<E>) {
        let mut listeners = self.listeners.lock();

        if let Some(attached) = listeners.get_mut(event_type) {
            attached.retain(|candidate| !Arc::ptr_eq(candidate, listener));
            if attached.is_empty() {
                listeners.remove(event_type);
            }
        }
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let mut types: Vec<(&str, usize)> =
            listeners.iter().map(|(name, attached)| (name.as_str(), attached.len())).collect();
        types.sort_unstable();
        f.debug_struct("Emitter").field("listeners", &types).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
