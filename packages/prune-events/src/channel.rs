//! Per-(source, event type) buffering and dispatch.
//!
//! A [`Channel`] owns exactly one raw listener on its source. Every raw
//! occurrence overwrites the buffered event (latest wins) and asks the host
//! for a flush. When the host flushes, every handler runs once, in
//! registration order, with the same [`FrameEvent`].
//!
//! # Locking
//!
//! Channel state sits behind a `parking_lot::Mutex` that is never held while
//! user code runs (handlers, data handlers, source calls). Handlers may
//! therefore register or unregister handlers, including on their own channel,
//! while a flush is in progress.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{PruneError, panic_message};
use crate::event::{DerivedData, FrameEvent, SuppressionFlags};
use crate::handler::{DataHandler, EventHandler, HandlerRecord};
use crate::source::{EventSource, RawEvent, RawListener, SourceId};

/// What a channel needs from the component that schedules its flushes.
pub(crate) trait ChannelHost: Send + Sync {
    /// Asks for a flush before the next rendering pass. Must be idempotent.
    fn request_flush(&self);

    /// Receives an isolated handler failure.
    fn report_failure(&self, error: &PruneError);
}

/// Result of flushing one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ChannelFlush {
    pub(crate) invocations: usize,
    pub(crate) failures: usize,
}

struct ChannelState<E> {
    handlers: SmallVec<[HandlerRecord<E>; 2]>,
    pending: Option<E>,
    next_handler_id: u64,
}

/// The buffering/dispatch unit bound to one (source, event type) pair.
pub(crate) struct Channel<E: RawEvent> {
    source_id: SourceId,
    event_type: Arc<str>,
    source: Weak<dyn EventSource<E>>,
    host: Weak<dyn ChannelHost>,
    listener: RawListener<E>,
    flags: Arc<SuppressionFlags>,
    attached: AtomicBool,
    state: Mutex<ChannelState<E>>,
}

impl<E: RawEvent> Channel<E> {
    /// Creates a detached channel. Call [`Channel::attach`] once registered.
    pub(crate) fn new(
        source_id: SourceId,
        event_type: &str,
        source: Weak<dyn EventSource<E>>,
        host: Weak<dyn ChannelHost>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me = me.clone();
            let listener: RawListener<E> = Arc::new(move |event: &E| {
                if let Some(channel) = me.upgrade() {
                    channel.on_raw_event(event);
                }
            });

            Self {
                source_id,
                event_type: Arc::from(event_type),
                source,
                host,
                listener,
                flags: Arc::new(SuppressionFlags::new()),
                attached: AtomicBool::new(false),
                state: Mutex::new(ChannelState {
                    handlers: SmallVec::new(),
                    pending: None,
                    next_handler_id: 0,
                }),
            }
        })
    }

    pub(crate) const fn source_id(&self) -> SourceId { self.source_id }

    pub(crate) fn event_type(&self) -> &str { &self.event_type }

    /// Attaches the raw listener to the source.
    ///
    /// Returns `false` if the source has already been dropped.
    pub(crate) fn attach(&self) -> bool {
        let Some(source) = self.source.upgrade() else {
            return false;
        };
        if self.attached.swap(true, Ordering::SeqCst) {
            return true;
        }

        source.add_listener(&self.event_type, Arc::clone(&self.listener));
        tracing::debug!(
            source = %self.source_id,
            event_type = %self.event_type,
            "channel attached"
        );
        true
    }

    /// Detaches the raw listener and discards any unflushed event.
    pub(crate) fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if !self.attached.swap(false, Ordering::SeqCst) {
                return;
            }
            state.pending = None;
        }

        if let Some(source) = self.source.upgrade() {
            source.remove_listener(&self.event_type, &self.listener);
        }
        tracing::debug!(
            source = %self.source_id,
            event_type = %self.event_type,
            "channel destroyed"
        );
    }

    pub(crate) fn is_attached(&self) -> bool { self.attached.load(Ordering::SeqCst) }

    pub(crate) fn has_pending(&self) -> bool { self.state.lock().pending.is_some() }

    pub(crate) fn handler_count(&self) -> usize { self.state.lock().handlers.len() }

    /// Appends a handler record in registration order.
    pub(crate) fn add_handler(
        &self,
        event_handler: EventHandler<E>,
        data_handler: Option<DataHandler<E>>,
    ) {
        let mut state = self.state.lock();
        let id = state.next_handler_id;
        state.next_handler_id += 1;
        state.handlers.push(HandlerRecord::new(id, event_handler, data_handler));
    }

    /// Removes every record registered with `handler`.
    ///
    /// Returns the number of records removed and whether the channel is now empty.
    pub(crate) fn remove_handler(&self, handler: &EventHandler<E>) -> (usize, bool) {
        let mut state = self.state.lock();
        let before = state.handlers.len();
        state.handlers.retain(|record| !record.matches(handler));
        (before - state.handlers.len(), state.handlers.is_empty())
    }

    /// Handles one raw occurrence delivered by the source.
    pub(crate) fn on_raw_event(&self, event: &E) {
        if !self.is_attached() {
            return;
        }

        // Suppression requested while the previous frame was dispatched.
        self.flags.apply_to(event);

        let extractors: SmallVec<[(u64, DataHandler<E>); 2]> = self
            .state
            .lock()
            .handlers
            .iter()
            .filter_map(|record| record.data_handler.clone().map(|extract| (record.id, extract)))
            .collect();

        let derived: SmallVec<[(u64, Option<DerivedData>); 2]> = extractors
            .into_iter()
            .map(|(id, extract)| (id, self.derive(&extract, event)))
            .collect();

        {
            let mut state = self.state.lock();
            if !self.is_attached() {
                return;
            }
            for (id, data) in derived {
                if let Some(record) = state.handlers.iter_mut().find(|record| record.id == id) {
                    record.data = data;
                }
            }
            state.pending = Some(event.clone());
        }

        if let Some(host) = self.host.upgrade() {
            host.request_flush();
        }
    }

    /// Dispatches the buffered event to every handler.
    ///
    /// Returns `None` if nothing was buffered.
    pub(crate) fn flush(&self) -> Option<ChannelFlush> {
        let (event, calls) = {
            let mut state = self.state.lock();
            let event = state.pending.take()?;
            let calls: SmallVec<[(EventHandler<E>, Option<DerivedData>); 2]> = state
                .handlers
                .iter()
                .map(|record| (Arc::clone(&record.event_handler), record.data.clone()))
                .collect();
            (event, calls)
        };

        self.flags.reset();
        let frame =
            FrameEvent::new(event, self.source_id, Arc::clone(&self.event_type), Arc::clone(&self.flags));

        let mut outcome = ChannelFlush::default();
        for (handler, data) in calls {
            outcome.invocations += 1;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(&frame, data.as_ref()))) {
                outcome.failures += 1;
                self.report(PruneError::HandlerPanicked {
                    source_id: self.source_id,
                    event_type: self.event_type.to_string(),
                    message: panic_message(payload.as_ref()),
                });
            }
        }

        Some(outcome)
    }

    fn derive(&self, extract: &DataHandler<E>, event: &E) -> Option<DerivedData> {
        match catch_unwind(AssertUnwindSafe(|| extract(event))) {
            Ok(data) => Some(data),
            Err(payload) => {
                self.report(PruneError::DataHandlerPanicked {
                    source_id: self.source_id,
                    event_type: self.event_type.to_string(),
                    message: panic_message(payload.as_ref()),
                });
                None
            }
        }
    }

    fn report(&self, error: PruneError) {
        match self.host.upgrade() {
            Some(host) => host.report_failure(&error),
            None => tracing::error!(error = %error, "handler failed on an orphaned channel"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::event::Suppression;
    use crate::handler::{data_handler, event_handler};
    use crate::source::Emitter;

    #[derive(Clone, Debug, Default)]
    struct Move {
        x: i32,
        applied: Arc<Mutex<Vec<Suppression>>>,
    }

    impl Move {
        fn at(x: i32) -> Self { Self { x, ..Self::default() } }
    }

    impl RawEvent for Move {
        fn prevent_default(&self) { self.applied.lock().push(Suppression::PreventDefault); }
    }

    #[derive(Default)]
    struct CountingHost {
        requests: AtomicUsize,
        failures: Mutex<Vec<String>>,
    }

    impl ChannelHost for CountingHost {
        fn request_flush(&self) { self.requests.fetch_add(1, Ordering::SeqCst); }

        fn report_failure(&self, error: &PruneError) { self.failures.lock().push(error.to_string()); }
    }

    fn channel(
        source: &Arc<Emitter<Move>>,
        host: &Arc<CountingHost>,
    ) -> Arc<Channel<Move>> {
        let source: Arc<dyn EventSource<Move>> = Arc::clone(source) as Arc<dyn EventSource<Move>>;
        let host: Arc<dyn ChannelHost> = Arc::clone(host) as Arc<dyn ChannelHost>;
        let channel =
            Channel::new(SourceId::new(1), "move", Arc::downgrade(&source), Arc::downgrade(&host));
        assert!(channel.attach());
        channel
    }

    #[test]
    fn test_attach_registers_single_listener() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);

        assert!(channel.attach());
        assert_eq!(source.listener_count("move"), 1);
        assert_eq!(channel.event_type(), "move");
    }

    #[test]
    fn test_raw_events_keep_latest_and_request_flush() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.add_handler(event_handler(move |event: &FrameEvent<Move>, _| sink.lock().push(event.x)), None);

        source.emit("move", &Move::at(1));
        source.emit("move", &Move::at(2));
        assert!(channel.has_pending());
        assert_eq!(host.requests.load(Ordering::SeqCst), 2);

        let outcome = channel.flush();
        assert_eq!(outcome, Some(ChannelFlush { invocations: 1, failures: 0 }));
        assert_eq!(*seen.lock(), vec![2]);
        assert!(!channel.has_pending());
    }

    #[test]
    fn test_flush_without_pending_is_none() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);
        channel.add_handler(event_handler(|_, _| {}), None);

        assert!(channel.flush().is_none());
    }

    #[test]
    fn test_data_handler_runs_per_raw_event() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);

        channel.add_handler(
            event_handler(move |_, data| {
                *sink.lock() = data.and_then(|d| d.downcast_ref::<i32>().copied());
            }),
            Some(data_handler(move |event: &Move| {
                counter.fetch_add(1, Ordering::SeqCst);
                event.x * 10
            })),
        );

        source.emit("move", &Move::at(1));
        source.emit("move", &Move::at(4));
        channel.flush();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock(), Some(40));
    }

    #[test]
    fn test_suppression_applies_to_next_raw_event() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);
        channel.add_handler(event_handler(|event: &FrameEvent<Move>, _| event.prevent_default()), None);

        let first = Move::at(1);
        source.emit("move", &first);
        channel.flush();
        assert!(first.applied.lock().is_empty());

        let second = Move::at(2);
        source.emit("move", &second);
        assert_eq!(*second.applied.lock(), vec![Suppression::PreventDefault]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        channel.add_handler(event_handler(|_, _| panic!("handler exploded")), None);
        channel.add_handler(
            event_handler(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );

        source.emit("move", &Move::at(1));
        let outcome = channel.flush();

        assert_eq!(outcome, Some(ChannelFlush { invocations: 2, failures: 1 }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!channel.has_pending());
        assert!(host.failures.lock()[0].contains("handler exploded"));
    }

    #[test]
    fn test_panicking_data_handler_yields_no_data() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);

        let saw_data = Arc::new(Mutex::new(Some(true)));
        let sink = Arc::clone(&saw_data);
        channel.add_handler(
            event_handler(move |_, data| *sink.lock() = Some(data.is_some())),
            Some(data_handler(|_event: &Move| -> i32 { panic!("cannot derive") })),
        );

        source.emit("move", &Move::at(1));
        channel.flush();

        assert_eq!(*saw_data.lock(), Some(false));
        assert_eq!(host.failures.lock().len(), 1);
    }

    #[test]
    fn test_remove_handler_removes_all_matches() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);

        let duplicate = event_handler(|_, _| {});
        let other = event_handler(|_, _| {});
        channel.add_handler(Arc::clone(&duplicate), None);
        channel.add_handler(Arc::clone(&other), None);
        channel.add_handler(Arc::clone(&duplicate), None);

        assert_eq!(channel.remove_handler(&duplicate), (2, false));
        assert_eq!(channel.handler_count(), 1);
        assert_eq!(channel.remove_handler(&other), (1, true));
    }

    #[test]
    fn test_destroy_detaches_and_discards_pending() {
        let source = Arc::new(Emitter::new());
        let host = Arc::new(CountingHost::default());
        let channel = channel(&source, &host);
        channel.add_handler(event_handler(|_, _| {}), None);

        source.emit("move", &Move::at(1));
        channel.destroy();

        assert!(!channel.is_attached());
        assert!(!channel.has_pending());
        assert_eq!(source.listener_count("move"), 0);
        assert_eq!(source.emit("move", &Move::at(2)), 0);
        assert!(channel.flush().is_none());
    }

    #[test]
    fn test_attach_fails_for_dropped_source() {
        let host = Arc::new(CountingHost::default());
        let source: Arc<dyn EventSource<Move>> = Arc::new(Emitter::<Move>::new());
        let weak = Arc::downgrade(&source);
        drop(source);

        let host: Arc<dyn ChannelHost> = host;
        let channel = Channel::new(SourceId::new(9), "move", weak, Arc::downgrade(&host));

        assert!(!channel.attach());
        assert!(!channel.is_attached());
    }
}
