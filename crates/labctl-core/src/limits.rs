//! Shared timing constants and range clamping.
//!
//! Instrument setters never reject an out-of-range value. They clamp it into
//! the documented legal interval with [`clamp_with_warning`], log what they
//! did, and send the clamped value.

use std::time::Duration;
use tracing::warn;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Quiet period used to discard stale input after a device is opened.
pub const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Upper bound for the length of a multi-line text reply.
///
/// A controller that never sends its terminator line must not keep a
/// text-mode read alive forever.
pub const MAX_TEXT_LINES: usize = 256;

/// Shortest accepted polling interval for background readers.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Clamping
// =============================================================================

/// Clamp `value` into `[min, max]`, logging a warning when it moves.
///
/// NaN clamps to `min`.
pub fn clamp_with_warning<T>(name: &str, value: T, min: T, max: T) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    let clamped = if value < min || value.partial_cmp(&value).is_none() {
        min
    } else if value > max {
        max
    } else {
        return value;
    };

    warn!(
        property = name,
        requested = %value,
        applied = %clamped,
        "Value outside [{}, {}], clamped",
        min,
        max
    );
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range_is_untouched() {
        assert_eq!(clamp_with_warning("speed", 50, 1, 100), 50);
        assert_eq!(clamp_with_warning("speed", 1, 1, 100), 1);
        assert_eq!(clamp_with_warning("speed", 100, 1, 100), 100);
    }

    #[test]
    fn test_clamps_to_nearest_bound() {
        assert_eq!(clamp_with_warning("speed", 0, 1, 100), 1);
        assert_eq!(clamp_with_warning("speed", -5, 1, 100), 1);
        assert_eq!(clamp_with_warning("speed", 250, 1, 100), 100);
        assert_eq!(clamp_with_warning("current", 120.5, 10.0, 100.0), 100.0);
    }

    #[test]
    fn test_nan_clamps_to_min() {
        assert_eq!(clamp_with_warning("current", f64::NAN, 10.0, 100.0), 10.0);
    }
}
