//! Handler types and the per-channel handler record.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::event::{DerivedData, FrameEvent};

/// Called once per frame with the coalesced event and the handler's derived data.
///
/// Handlers are compared by pointer identity, so keep the `Arc` around to
/// unregister it later.
pub type EventHandler<E> = Arc<dyn Fn(&FrameEvent<E>, Option<&DerivedData>) + Send + Sync>;

/// Computes derived data from every raw occurrence, ahead of the flush.
pub type DataHandler<E> = Arc<dyn Fn(&E) -> DerivedData + Send + Sync>;

/// Wraps a closure as an [`EventHandler`].
pub fn event_handler<E, F>(handler: F) -> EventHandler<E>
where F: Fn(&FrameEvent<E>, Option<&DerivedData>) + Send + Sync + 'static {
    Arc::new(handler)
}

/// Wraps a typed extraction function as a [`DataHandler`].
pub fn data_handler<E, T, F>(extract: F) -> DataHandler<E>
where
    T: Any + Send + Sync,
    F: Fn(&E) -> T + Send + Sync + 'static,
{
    Arc::new(move |event: &E| DerivedData::new(extract(event)))
}

/// A registered handler and the data it derived from the latest raw event.
pub(crate) struct HandlerRecord<E> {
    /// Channel-local identifier, stable while the record is registered.
    pub(crate) id: u64,
    pub(crate) event_handler: EventHandler<E>,
    pub(crate) data_handler: Option<DataHandler<E>>,
    /// Last derived value; overwritten on every raw occurrence.
    pub(crate) data: Option<DerivedData>,
}

impl<E> HandlerRecord<E> {
    pub(crate) const fn new(
        id: u64,
        event_handler: EventHandler<E>,
        data_handler: Option<DataHandler<E>>,
    ) -> Self {
        Self { id, event_handler, data_handler, data: None }
    }

    /// Returns `true` if this record was registered with `handler`.
    pub(crate) fn matches(&self, handler: &EventHandler<E>) -> bool {
        Arc::ptr_eq(&self.event_handler, handler)
    }
}

impl<E> fmt::Debug for HandlerRecord<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRecord")
            .field("id", &self.id)
            .field("has_data_handler", &self.data_handler.is_some())
            .field("data", &self.data)
            .finish()
    }
}
