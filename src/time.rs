//! Clocks, deadlines and retransmission alarms
//!
//! Built on `tokio::time` so that tests can pause and advance time.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Monotonic microsecond clock relative to the creation of a connection.
///
/// uTP timestamps are 32 bits and wrap roughly every 71 minutes; only
/// differences between them are meaningful.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds since the clock started, truncated to 32 bits
    pub fn timestamp_us(&self) -> u32 {
        (self.origin.elapsed().as_micros() & 0xFFFF_FFFF) as u32
    }
}

/// An optional point in time after which an operation fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn new(at: Option<Instant>) -> Self {
        Self(at)
    }

    pub fn set(&mut self, at: Option<Instant>) {
        self.0 = at;
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// A deadline is exceeded from the instant it names onwards
    pub fn exceeded(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

/// Wait for `event` or until `deadline`, whichever comes first.
///
/// Returns without telling which one happened: callers re-check their
/// predicate after every wake-up.
pub async fn wait_or_deadline<F: Future<Output = ()>>(event: F, deadline: Option<Instant>) {
    match deadline {
        Some(at) => {
            tokio::select! {
                _ = event => {}
                _ = tokio::time::sleep_until(at) => {}
            }
        }
        None => event.await,
    }
}

/// `base` shifted by a uniformly random offset in `[-jitter, +jitter)`
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let span = jitter.as_micros() as u64 * 2;
    let offset = rand::rng().random_range(0..span);
    (base + Duration::from_micros(offset)).saturating_sub(jitter)
}

/// Retransmission delay after `resends` previous attempts: doubling from
/// `initial`, capped at `max`, then jittered
pub fn backoff(initial: Duration, jitter: Duration, max: Duration, resends: u32) -> Duration {
    let factor = 1u32.checked_shl(resends.min(16)).unwrap_or(u32::MAX);
    let delay = initial.saturating_mul(factor).min(max);
    jittered(delay, jitter)
}

/// A cancellable one-shot timer.
///
/// Arming spawns a task that sleeps and then invokes the callback with the
/// epoch it was armed under. Disarming or re-arming bumps the epoch, so a
/// callback that was already past its sleep when it got cancelled can tell
/// it is stale by calling [`Alarm::is_current`] under the owner's lock.
#[derive(Debug, Default)]
pub struct Alarm {
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

impl Alarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re-)arm the alarm. Must be called from within a tokio runtime.
    pub fn arm<F>(&mut self, delay: Duration, fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.disarm();
        let epoch = self.epoch;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(epoch);
        }));
    }

    /// Cancel the alarm; a pending callback becomes stale
    pub fn disarm(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether a callback carrying `epoch` is still the live one
    pub fn is_current(&self, epoch: u64) -> bool {
        self.task.is_some() && self.epoch == epoch
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(3);
        let jitter = Duration::from_secs(1);
        for _ in 0..200 {
            let d = jittered(base, jitter);
            assert!(d >= Duration::from_secs(2));
            assert!(d < Duration::from_secs(4));
        }
        assert_eq!(jittered(base, Duration::ZERO), base);
    }

    #[test]
    fn test_backoff_caps() {
        let initial = Duration::from_secs(3);
        let max = Duration::from_secs(12);
        assert_eq!(backoff(initial, Duration::ZERO, max, 0), initial);
        assert_eq!(backoff(initial, Duration::ZERO, max, 1), Duration::from_secs(6));
        assert_eq!(backoff(initial, Duration::ZERO, max, 2), max);
        assert_eq!(backoff(initial, Duration::ZERO, max, 40), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let mut deadline = Deadline::default();
        assert!(!deadline.exceeded());

        deadline.set(Some(Instant::now() + Duration::from_millis(5)));
        assert!(!deadline.exceeded());
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(deadline.exceeded());

        deadline.set(None);
        assert!(!deadline.exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_fires_with_epoch() {
        let fired = Arc::new(AtomicU64::new(u64::MAX));
        let mut alarm = Alarm::new();

        let f = fired.clone();
        alarm.arm(Duration::from_millis(10), move |epoch| {
            f.store(epoch, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let epoch = fired.load(Ordering::SeqCst);
        assert!(alarm.is_current(epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_alarm_does_not_fire() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut alarm = Alarm::new();

        let f = fired.clone();
        alarm.arm(Duration::from_millis(10), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        alarm.disarm();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!alarm.is_armed());
    }
}
