use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond time source for frame timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Epoch milliseconds that never go backwards.
///
/// The wall clock is read once at construction; afterwards time advances with a
/// monotonic [`instant::Instant`], so adjusting the system clock while a game is
/// running cannot produce negative deltas.
pub struct SystemClock {
    origin_millis: u64,
    origin: instant::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let origin_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            origin_millis,
            origin: instant::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.origin_millis + self.origin.elapsed().as_millis() as u64
    }
}

/// Timestamps of the current and previous tick.
///
/// Cloning yields another handle onto the same timestamps, so a game can keep
/// one and read [`FrameClock::now`] from inside `update`.
#[derive(Clone, Default)]
pub struct FrameClock {
    inner: Arc<FrameTimes>,
}

#[derive(Default)]
struct FrameTimes {
    now: AtomicU64,
    last_frame_time: AtomicU64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start time of the current tick in milliseconds. Zero before the first tick.
    pub fn now(&self) -> u64 {
        self.inner.now.load(Ordering::Acquire)
    }

    pub fn last_frame_time(&self) -> u64 {
        self.inner.last_frame_time.load(Ordering::Acquire)
    }

    /// Called on start so the first delta only covers the wait for the first tick.
    pub(crate) fn reset(&self, now: u64) {
        self.inner.last_frame_time.store(now, Ordering::Release);
    }

    /// Records the start of a tick and returns its delta.
    ///
    /// The delta is taken against the previous timestamp before it is replaced.
    pub(crate) fn begin_frame(&self, now: u64) -> u64 {
        self.inner.now.store(now, Ordering::Release);
        let last = self.inner.last_frame_time.swap(now, Ordering::AcqRel);
        now.saturating_sub(last)
    }
}
