//! Registry and frame scheduler.
//!
//! The [`Coalescer`] maps each source to its active channels by event type,
//! keeps a single outstanding tick, and flushes every channel when that tick
//! fires.
//!
//! # How It Works
//!
//! ```text
//! raw event ──► Channel::on_raw_event ──► Coalescer::request_flush
//!                                               │ (once per frame)
//!                                               ▼
//!                                       Ticker::schedule_once
//!                                               │
//!                                               ▼
//!                      flush_all ──► Channel::flush (creation order) ──► handlers
//! ```
//!
//! # Source identity
//!
//! Sources are never tagged or owned. The registry keys a `Weak` reference by
//! the source's allocation address and hands out a [`SourceId`]. The `Weak`
//! keeps the allocation reserved, so an address maps to one source for as long
//! as the entry exists. Entries of dropped sources stay until their last
//! channel is removed or [`Coalescer::prune_dropped_sources`] runs.
//!
//! # Ticks
//!
//! Each scheduled tick carries a generation number. [`Coalescer::trigger_events`]
//! flushes immediately and clears the pending flag, so a tick that was already
//! handed to the ticker becomes stale and is ignored when it fires.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::channel::{Channel, ChannelHost};
use crate::config::CoalescerConfig;
use crate::error::{PruneError, PruneResult, panic_message};
use crate::handler::{DataHandler, EventHandler};
use crate::source::{EventSource, RawEvent, SourceId, source_address};
use crate::ticker::{FrameTicker, Ticker};

/// Receives isolated handler failures.
pub type ErrorHook = Arc<dyn Fn(&PruneError) + Send + Sync>;

/// Summary of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Channels that had a buffered event and were dispatched.
    pub channels: usize,
    /// Handler invocations, including failed ones.
    pub invocations: usize,
    /// Handler invocations that panicked.
    pub failures: usize,
}

// ============================================================================
// Registry
// ============================================================================

/// Monotonic channel identifier; iteration order of the registry.
type ChannelId = u64;

struct SourceEntry<E: RawEvent> {
    id: SourceId,
    source: Weak<dyn EventSource<E>>,
}

struct ChannelSlot<E: RawEvent> {
    id: ChannelId,
    channel: Arc<Channel<E>>,
}

struct Registry<E: RawEvent> {
    /// Source allocation address → identity.
    sources: HashMap<usize, SourceEntry<E>>,
    /// Source identity → event type → channel.
    channels: HashMap<SourceId, HashMap<String, ChannelSlot<E>>>,
    /// Creation-ordered view used for flushing.
    order: BTreeMap<ChannelId, Arc<Channel<E>>>,
    next_source_id: u64,
    next_channel_id: ChannelId,
}

impl<E: RawEvent> Registry<E> {
    fn new() -> Self {
        Self {
            sources: HashMap::new(),
            channels: HashMap::new(),
            order: BTreeMap::new(),
            next_source_id: 1,
            next_channel_id: 0,
        }
    }

    fn identity(&self, address: usize) -> Option<SourceId> {
        self.sources.get(&address).map(|entry| entry.id)
    }

    fn allocate_identity(&mut self, address: usize, source: Weak<dyn EventSource<E>>) -> SourceId {
        let id = SourceId::new(self.next_source_id);
        self.next_source_id += 1;
        self.sources.insert(address, SourceEntry { id, source });
        id
    }

    fn channel(&self, source_id: SourceId, event_type: &str) -> Option<&Arc<Channel<E>>> {
        self.channels.get(&source_id)?.get(event_type).map(|slot| &slot.channel)
    }

    fn insert_channel(&mut self, channel: Arc<Channel<E>>) {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        self.order.insert(id, Arc::clone(&channel));
        self.channels
            .entry(channel.source_id())
            .or_default()
            .insert(channel.event_type().to_string(), ChannelSlot { id, channel });
    }

    /// Removes one channel. Forgets the source once its last channel is gone.
    fn remove_channel(&mut self, source_id: SourceId, event_type: &str) -> Option<Arc<Channel<E>>> {
        let types = self.channels.get_mut(&source_id)?;
        let slot = types.remove(event_type)?;
        if types.is_empty() {
            self.channels.remove(&source_id);
            self.sources.retain(|_, entry| entry.id != source_id);
        }
        self.order.remove(&slot.id);
        Some(slot.channel)
    }

    /// Removes every channel of a source. The caller destroys them.
    fn evict_source(&mut self, source_id: SourceId) -> Vec<Arc<Channel<E>>> {
        let Some(types) = self.channels.remove(&source_id) else {
            return Vec::new();
        };
        types
            .into_values()
            .map(|slot| {
                self.order.remove(&slot.id);
                slot.channel
            })
            .collect()
    }

    fn ordered_channels(&self) -> Vec<Arc<Channel<E>>> { self.order.values().cloned().collect() }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Default)]
struct TickState {
    pending: bool,
    generation: u64,
}

/// Clears the pending flag when a flush pass ends, even by unwinding.
struct PendingReset<'a>(&'a Mutex<TickState>);

impl Drop for PendingReset<'_> {
    fn drop(&mut self) { self.0.lock().pending = false; }
}

struct Shared<E: RawEvent> {
    registry: Mutex<Registry<E>>,
    tick: Mutex<TickState>,
    ticker: RwLock<Arc<dyn Ticker>>,
    error_hook: RwLock<Option<ErrorHook>>,
    /// Serializes flush passes; re-entrant so a handler may force a nested flush.
    flush_lock: ReentrantMutex<()>,
    me: Weak<Self>,
}

impl<E: RawEvent> Shared<E> {
    fn schedule_flush(&self) {
        let generation = {
            let mut tick = self.tick.lock();
            if tick.pending {
                return;
            }
            tick.pending = true;
            tick.generation += 1;
            tick.generation
        };

        let ticker = self.ticker.read().clone();
        let me = self.me.clone();
        tracing::trace!(generation, "scheduling flush for next frame");
        ticker.schedule_once(Box::new(move || {
            if let Some(shared) = me.upgrade() {
                shared.on_tick(generation);
            }
        }));
    }

    fn on_tick(&self, generation: u64) {
        let current = {
            let tick = self.tick.lock();
            tick.pending && tick.generation == generation
        };
        if !current {
            tracing::trace!(generation, "ignoring superseded tick");
            return;
        }
        self.flush_all();
    }

    fn flush_all(&self) -> FlushStats {
        let _serial = self.flush_lock.lock();

        let stats = {
            let _reset = PendingReset(&self.tick);
            let channels = self.registry.lock().ordered_channels();

            let mut stats = FlushStats::default();
            for channel in &channels {
                // Destroyed by a handler earlier in this pass.
                if !channel.is_attached() {
                    continue;
                }
                if let Some(outcome) = channel.flush() {
                    stats.channels += 1;
                    stats.invocations += outcome.invocations;
                    stats.failures += outcome.failures;
                }
            }
            stats
        };

        // Raw events delivered re-entrantly, including on channels created
        // during the pass.
        let live = self.registry.lock().ordered_channels();
        if live.iter().any(|channel| channel.is_attached() && channel.has_pending()) {
            self.schedule_flush();
        }

        tracing::trace!(
            channels = stats.channels,
            invocations = stats.invocations,
            failures = stats.failures,
            "flushed frame"
        );
        stats
    }
}

impl<E: RawEvent> ChannelHost for Shared<E> {
    fn request_flush(&self) { self.schedule_flush(); }

    fn report_failure(&self, error: &PruneError) {
        let hook = self.error_hook.read().clone();
        let Some(hook) = hook else {
            tracing::error!(error = %error, "event handler failed; dispatch continues");
            return;
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(error))) {
            tracing::error!(
                error = %error,
                hook_panic = %panic_message(payload.as_ref()),
                "error hook panicked; dispatch continues"
            );
        }
    }
}

// ============================================================================
// Coalescer
// ============================================================================

/// Coalesces raw events so each handler runs at most once per frame.
///
/// `Coalescer` is a cheap handle: clone it and pass it to whatever needs to
/// register handlers. All clones share one registry and one tick.
pub struct Coalescer<E: RawEvent> {
    shared: Arc<Shared<E>>,
}

impl<E: RawEvent> Coalescer<E> {
    /// Creates a coalescer that schedules its flushes on `ticker`.
    #[must_use]
    pub fn new(ticker: Arc<dyn Ticker>) -> Self {
        let shared = Arc::new_cyclic(|me: &Weak<Shared<E>>| Shared {
            registry: Mutex::new(Registry::new()),
            tick: Mutex::new(TickState::default()),
            ticker: RwLock::new(ticker),
            error_hook: RwLock::new(None),
            flush_lock: ReentrantMutex::new(()),
            me: me.clone(),
        });
        Self { shared }
    }

    /// Creates a coalescer driven by a [`FrameTicker`] at the configured refresh rate.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no tokio runtime
    /// is running on the current thread.
    pub fn from_config(config: &CoalescerConfig) -> PruneResult<Self> {
        config.validate()?;
        let ticker = FrameTicker::start(config)?;
        Ok(Self::new(Arc::new(ticker)))
    }

    /// Registers `handler` for `event_type` events from `source`.
    ///
    /// The first registration for a (source, type) pair attaches one raw
    /// listener to the source. Registering the same handler twice makes it
    /// run twice per frame.
    pub fn on<S>(&self, source: &Arc<S>, event_type: &str, handler: &EventHandler<E>)
    where S: EventSource<E> + 'static {
        self.register(source, event_type, Arc::clone(handler), None);
    }

    /// Registers `handler` together with a data handler.
    ///
    /// `data_handler` runs on every raw occurrence; `handler` receives the
    /// value derived from the latest one.
    pub fn on_with_data<S>(
        &self,
        source: &Arc<S>,
        event_type: &str,
        handler: &EventHandler<E>,
        data_handler: &DataHandler<E>,
    ) where
        S: EventSource<E> + 'static,
    {
        self.register(source, event_type, Arc::clone(handler), Some(Arc::clone(data_handler)));
    }

    fn register<S>(
        &self,
        source: &Arc<S>,
        event_type: &str,
        handler: EventHandler<E>,
        data_handler: Option<DataHandler<E>>,
    ) where
        S: EventSource<E> + 'static,
    {
        let address = source_address(source);
        let (channel, created) = {
            let mut registry = self.shared.registry.lock();
            let source_id = registry.identity(address).unwrap_or_else(|| {
                let dyn_source: Arc<dyn EventSource<E>> = Arc::clone(source) as Arc<dyn EventSource<E>>;
                registry.allocate_identity(address, Arc::downgrade(&dyn_source))
            });

            let (channel, created) = match registry.channel(source_id, event_type) {
                Some(channel) => (Arc::clone(channel), false),
                None => {
                    let dyn_source: Arc<dyn EventSource<E>> = Arc::clone(source) as Arc<dyn EventSource<E>>;
                    let host: Weak<dyn ChannelHost> = self.shared.me.clone() as Weak<dyn ChannelHost>;
                    let channel = Channel::new(source_id, event_type, Arc::downgrade(&dyn_source), host);
                    registry.insert_channel(Arc::clone(&channel));
                    (channel, true)
                }
            };
            channel.add_handler(handler, data_handler);
            (channel, created)
        };

        if created {
            let attached = channel.attach();
            debug_assert!(attached, "source is alive while it is being registered");
        }
    }

    /// Unregisters every registration of `handler` for `event_type` on `source`.
    ///
    /// Duplicate registrations of the same handler are all removed. When the
    /// last handler goes, the raw listener is detached and any buffered event
    /// is discarded. Unknown pairs are ignored.
    ///
    /// Returns the number of registrations removed.
    pub fn off<S>(&self, source: &Arc<S>, event_type: &str, handler: &EventHandler<E>) -> usize
    where S: EventSource<E> + ?Sized {
        let address = source_address(source);
        let (removed, emptied) = {
            let mut registry = self.shared.registry.lock();
            let Some(source_id) = registry.identity(address) else {
                return 0;
            };
            let Some(channel) = registry.channel(source_id, event_type).cloned() else {
                return 0;
            };

            let (removed, empty) = channel.remove_handler(handler);
            let emptied = if empty { registry.remove_channel(source_id, event_type) } else { None };
            (removed, emptied)
        };

        if let Some(channel) = emptied {
            channel.destroy();
        }
        removed
    }

    /// Requests a flush before the next rendering pass.
    ///
    /// Only one flush is ever outstanding; further requests are no-ops until
    /// it runs.
    pub fn request_flush(&self) { self.shared.schedule_flush(); }

    /// Flushes every channel right now, independent of any pending tick.
    pub fn trigger_events(&self) -> FlushStats { self.shared.flush_all() }

    /// Returns `true` while a flush is scheduled and has not run yet.
    #[must_use]
    pub fn is_tick_pending(&self) -> bool { self.shared.tick.lock().pending }

    /// Replaces the tick provider used for future flush requests.
    pub fn set_ticker(&self, ticker: Arc<dyn Ticker>) { *self.shared.ticker.write() = ticker; }

    /// Installs a hook that receives every isolated handler failure.
    pub fn set_error_hook(&self, hook: ErrorHook) { *self.shared.error_hook.write() = Some(hook); }

    /// Removes the error hook; failures are logged instead.
    pub fn clear_error_hook(&self) { *self.shared.error_hook.write() = None; }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize { self.shared.registry.lock().order.len() }

    /// Number of handler registrations for `event_type` on `source`.
    #[must_use]
    pub fn handler_count<S>(&self, source: &Arc<S>, event_type: &str) -> usize
    where S: EventSource<E> + ?Sized {
        self.with_channel(source, event_type, |channel| channel.handler_count()).unwrap_or(0)
    }

    /// Returns `true` if at least one handler is registered for the pair.
    #[must_use]
    pub fn is_registered<S>(&self, source: &Arc<S>, event_type: &str) -> bool
    where S: EventSource<E> + ?Sized {
        self.with_channel(source, event_type, |_| ()).is_some()
    }

    /// Identity assigned to `source`, if it has any live registration.
    #[must_use]
    pub fn source_id<S>(&self, source: &Arc<S>) -> Option<SourceId>
    where S: EventSource<E> + ?Sized {
        self.shared.registry.lock().identity(source_address(source))
    }

    /// Destroys every channel whose source was dropped without unregistering.
    ///
    /// Returns the number of channels removed.
    pub fn prune_dropped_sources(&self) -> usize {
        let evicted: Vec<Arc<Channel<E>>> = {
            let mut registry = self.shared.registry.lock();
            let dead: Vec<(usize, SourceId)> = registry
                .sources
                .iter()
                .filter(|(_, entry)| entry.source.strong_count() == 0)
                .map(|(address, entry)| (*address, entry.id))
                .collect();

            dead.into_iter()
                .flat_map(|(address, id)| {
                    registry.sources.remove(&address);
                    registry.evict_source(id)
                })
                .collect()
        };

        if !evicted.is_empty() {
            tracing::warn!(channels = evicted.len(), "pruned channels of dropped sources");
        }
        destroy_all(&evicted);
        evicted.len()
    }

    fn with_channel<S, R>(
        &self,
        source: &Arc<S>,
        event_type: &str,
        f: impl FnOnce(&Channel<E>) -> R,
    ) -> Option<R>
    where
        S: EventSource<E> + ?Sized,
    {
        let source_id = self.source_id(source)?;
        let channel = self.shared.registry.lock().channel(source_id, event_type).cloned()?;
        Some(f(&channel))
    }
}

impl<E: RawEvent> Clone for Coalescer<E> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<E: RawEvent> fmt::Debug for Coalescer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("channels", &self.channel_count())
            .field("tick", &*self.shared.tick.lock())
            .finish_non_exhaustive()
    }
}

fn destroy_all<E: RawEvent>(channels: &[Arc<Channel<E>>]) {
    for channel in channels {
        channel.destroy();
    }
}

// ============================================================================
// Tests
// ============================================================================
