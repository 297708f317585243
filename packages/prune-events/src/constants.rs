//! Internal constants for frame scheduling.
//!
//! Constants are grouped by functionality:
//! - `timing` - Refresh rates and the frame intervals derived from them

/// Frame timing constants.
pub mod timing {
    /// Refresh rate used when none is configured (Hz).
    pub const DEFAULT_REFRESH_RATE: f64 = 60.0;

    /// Minimum refresh rate to prevent too-slow frames (Hz).
    pub const MIN_REFRESH_RATE: f64 = 30.0;

    /// Maximum refresh rate to prevent too-fast frames (Hz).
    pub const MAX_REFRESH_RATE: f64 = 360.0;
}
