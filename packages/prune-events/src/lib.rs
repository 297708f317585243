//! prune-events - Frame-aligned coalescing of high-frequency events.
//!
//! Mouse moves, scrolls, resizes and touch moves can fire many times between
//! two rendered frames. This crate sits between an event source and its
//! handlers: raw occurrences are buffered per (source, event type), and every
//! handler runs at most once per frame with the latest occurrence.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use prune_events::{Coalescer, Emitter, ManualTicker, event_handler};
//!
//! let ticker = Arc::new(ManualTicker::new());
//! let coalescer = Coalescer::new(ticker.clone());
//! let window = Arc::new(Emitter::new());
//!
//! let on_resize = event_handler(|event: &FrameEvent<Resize>, _| redraw(event.width));
//! coalescer.on(&window, "resize", &on_resize);
//!
//! window.emit("resize", &Resize { width: 800 });
//! window.emit("resize", &Resize { width: 810 });
//! ticker.advance(); // redraw(810), once
//! ```

// Core modules
pub mod coalescer;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod handler;
pub mod source;
pub mod ticker;

mod channel;

pub use coalescer::{Coalescer, ErrorHook, FlushStats};
pub use config::CoalescerConfig;
pub use error::{ConfigError, PruneError, PruneResult};
pub use event::{DerivedData, FrameEvent, Suppression, SuppressionFlags};
pub use handler::{DataHandler, EventHandler, data_handler, event_handler};
pub use source::{Emitter, EventSource, RawEvent, RawListener, SourceId};
pub use ticker::{FrameTicker, ManualTicker, TickCallback, Ticker};
