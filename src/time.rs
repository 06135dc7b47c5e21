//! Monotonic time source abstraction.
//!
//! All internal timestamps are nanoseconds since an arbitrary per-ticker
//! epoch.  `u64::MAX` is the sentinel for "never expires" throughout the
//! crate, so a ticker must never return it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Nanosecond deadline meaning "never".
pub(crate) const NEVER: u64 = u64::MAX;

/// A monotonic nanosecond clock.
///
/// The cache reads the ticker on every operation that touches expiration,
/// refresh, or load timing.  Supplying a manual ticker makes time-dependent
/// behavior fully deterministic in tests.
pub trait Ticker: Send + Sync + 'static {
    /// Nanoseconds elapsed since this ticker's epoch.
    fn now_nanos(&self) -> u64;
}

impl<T: Ticker + ?Sized> Ticker for std::sync::Arc<T> {
    #[inline]
    fn now_nanos(&self) -> u64 {
        (**self).now_nanos()
    }
}

/// The default ticker, backed by [`Instant`].
pub struct SystemTicker {
    epoch: Instant,
}

impl SystemTicker {
    pub fn new() -> Self {
        SystemTicker {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    #[inline]
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// A ticker that only moves when told to.
///
/// # Example
/// ```
/// use cortado::time::{ManualTicker, Ticker};
/// use std::time::Duration;
///
/// let ticker = ManualTicker::new();
/// assert_eq!(ticker.now_nanos(), 0);
/// ticker.advance(Duration::from_millis(100));
/// assert_eq!(ticker.now_nanos(), 100_000_000);
/// ```
pub struct ManualTicker {
    nanos: AtomicU64,
}

impl ManualTicker {
    pub fn new() -> Self {
        ManualTicker {
            nanos: AtomicU64::new(0),
        }
    }

    /// Moves the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.nanos.fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for ManualTicker {
    #[inline]
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Converts a duration to nanos, saturating just below the `NEVER` sentinel.
#[inline]
pub(crate) fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(NEVER - 1).min(NEVER - 1)
}

/// Absolute deadline for an event at `now` lasting `duration_nanos`.
#[inline]
pub(crate) fn saturating_deadline(now: u64, duration_nanos: u64) -> u64 {
    match now.checked_add(duration_nanos) {
        Some(d) if d < NEVER => d,
        _ => NEVER - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_ticker_is_monotonic() {
        let t = SystemTicker::new();
        let a = t.now_nanos();
        let b = t.now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn manual_ticker_advances_exactly() {
        let t = ManualTicker::new();
        t.advance(Duration::from_secs(1));
        t.advance(Duration::from_nanos(5));
        assert_eq!(t.now_nanos(), 1_000_000_005);
    }

    #[test]
    fn deadline_saturates_below_never() {
        assert_eq!(saturating_deadline(u64::MAX - 1, 10), NEVER - 1);
        assert_eq!(saturating_deadline(100, 50), 150);
    }
}
