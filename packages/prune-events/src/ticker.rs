//! Tick providers.
//!
//! A [`Ticker`] runs a callback once, before the next rendering pass. The
//! coalescer never assumes which thread or loop that is; embedders plug in
//! their own render loop through [`ManualTicker`] or a custom implementation.
//!
//! [`FrameTicker`] is a self-driving ticker for applications without a render
//! loop: a tokio task that aligns callbacks to frame boundaries derived from
//! the configured refresh rate.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::CoalescerConfig;
use crate::error::{PruneError, PruneResult};

/// Callback run once on the next tick.
pub type TickCallback = Box<dyn FnOnce() + Send>;

/// Schedules callbacks for the next rendering pass.
pub trait Ticker: Send + Sync {
    /// Runs `callback` exactly once, asynchronously, before the next rendering pass.
    fn schedule_once(&self, callback: TickCallback);
}

// ============================================================================
// ManualTicker
// ============================================================================

/// A ticker advanced by its owner, one frame per [`ManualTicker::advance`].
#[derive(Default)]
pub struct ManualTicker {
    queue: Mutex<VecDeque<TickCallback>>,
    frames: AtomicU64,
}

impl ManualTicker {
    /// Creates an idle ticker.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Runs every callback scheduled before this call.
    ///
    /// Callbacks scheduled while advancing wait for the next frame. Returns
    /// the number of callbacks run.
    pub fn advance(&self) -> usize {
        let due: Vec<TickCallback> = self.queue.lock().drain(..).collect();
        self.frames.fetch_add(1, Ordering::SeqCst);

        let count = due.len();
        for callback in due {
            callback();
        }
        count
    }

    /// Number of callbacks waiting for the next frame.
    #[must_use]
    pub fn pending(&self) -> usize { self.queue.lock().len() }

    /// Number of frames advanced so far.
    #[must_use]
    pub fn frames(&self) -> u64 { self.frames.load(Ordering::SeqCst) }
}

impl Ticker for ManualTicker {
    fn schedule_once(&self, callback: TickCallback) { self.queue.lock().push_back(callback); }
}

impl fmt::Debug for ManualTicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTicker")
            .field("pending", &self.pending())
            .field("frames", &self.frames())
            .finish()
    }
}

// ============================================================================
// FrameTicker
// ============================================================================

/// A ticker that fires at frame boundaries on a tokio runtime.
///
/// The driving task sleeps until something is scheduled, waits for the next
/// frame boundary (missed frames are skipped, not replayed), then runs every
/// queued callback. Dropping the ticker stops the task.
pub struct FrameTicker {
    sender: mpsc::UnboundedSender<TickCallback>,
    interval: Duration,
}

impl FrameTicker {
    /// Starts a frame ticker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PruneError::RuntimeUnavailable`] when called outside a runtime.
    pub fn start(config: &CoalescerConfig) -> PruneResult<Self> {
        let handle = Handle::try_current().map_err(|_| PruneError::RuntimeUnavailable)?;
        Ok(Self::start_on(&handle, config))
    }

    /// Starts a frame ticker on the given runtime.
    #[must_use]
    pub fn start_on(handle: &Handle, config: &CoalescerConfig) -> Self {
        let interval = config.frame_interval();
        let (sender, receiver) = mpsc::unbounded_channel();
        handle.spawn(run_frames(receiver, interval));

        tracing::debug!(
            refresh_rate = config.effective_refresh_rate(),
            ?interval,
            "frame ticker started"
        );
        Self { sender, interval }
    }

    /// Time between two frames.
    #[must_use]
    pub const fn frame_interval(&self) -> Duration { self.interval }
}

impl Ticker for FrameTicker {
    fn schedule_once(&self, callback: TickCallback) {
        if self.sender.send(callback).is_err() {
            tracing::warn!("frame ticker has stopped; dropping scheduled flush");
        }
    }
}

impl fmt::Debug for FrameTicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTicker").field("interval", &self.interval).finish_non_exhaustive()
    }
}

async fn run_frames(mut receiver: mpsc::UnboundedReceiver<TickCallback>, interval: Duration) {
    let mut frames = tokio::time::interval(interval);
    frames.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while let Some(first) = receiver.recv().await {
        frames.tick().await;

        let mut due = vec![first];
        while let Ok(callback) = receiver.try_recv() {
            due.push(callback);
        }
        for callback in due {
            callback();
        }
    }

    tracing::debug!("frame ticker stopped");
}

// ============================================================================
// Tests
// ============================================================================
