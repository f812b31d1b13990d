//! Clock abstractions used by circuits, retries, caches and the health monitor.
//!
//! Everything time-dependent in this crate reads time through [`Clock::now_millis`] and waits
//! through [`Clock::after`], so tests can swap wall time for virtual time:
//!
//! - [`TokioClock`] follows tokio's clock, which means `#[tokio::test(start_paused = true)]`
//!   gives deterministic, auto-advancing time for free.
//! - [`ManualClock`] only moves when [`ManualClock::advance`] is called.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since a fixed, clock-specific origin. Never goes backwards.
    fn now_millis(&self) -> u64;

    /// A future that completes once `duration` has elapsed on this clock.
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_millis(&self) -> u64 {
        (**self).now_millis()
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        (**self).after(duration)
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Monotonic clock backed by tokio's time driver.
///
/// Notes: resets when the process restarts. Under a paused tokio runtime both `now_millis`
/// and `after` follow the virtual clock.
#[derive(Debug, Clone)]
pub struct TokioClock {
    start: tokio::time::Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self { start: tokio::time::Instant::now() }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        millis(self.start.elapsed())
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: u64,
    timers: Vec<(u64, oneshot::Sender<()>)>,
    requested: Vec<Duration>,
}

/// Virtual clock that only advances when told to.
///
/// Timers created through [`Clock::after`] fire during the [`advance`](Self::advance) call
/// that moves time past their deadline. Every requested wait is recorded, so tests can assert
/// on backoff schedules without sleeping.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock at `millis` instead of zero.
    pub fn starting_at(millis: u64) -> Self {
        let clock = Self::default();
        clock.lock().now = millis;
        clock
    }

    /// Move virtual time forward and fire every timer that is now due.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut state = self.lock();
            state.now = state.now.saturating_add(millis(duration));
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) =
                state.timers.drain(..).partition(|(deadline, _)| *deadline <= now);
            state.timers = pending;
            due
        };
        for (_, tx) in due {
            let _ = tx.send(());
        }
    }

    /// Durations passed to [`Clock::after`], in call order.
    pub fn requested(&self) -> Vec<Duration> {
        self.lock().requested.clone()
    }

    /// Number of timers still waiting for their deadline.
    pub fn pending_timers(&self) -> usize {
        let mut state = self.lock();
        state.timers.retain(|(_, tx)| !tx.is_closed());
        state.timers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.lock().now
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let mut state = self.lock();
        state.requested.push(duration);
        if duration.is_zero() {
            return Box::pin(async {});
        }
        state.timers.retain(|(_, tx)| !tx.is_closed());
        let deadline = state.now.saturating_add(millis(duration));
        let (tx, rx) = oneshot::channel();
        state.timers.push((deadline, tx));
        Box::pin(async move {
            // A dropped clock releases its waiters instead of hanging them.
            let _ = rx.await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn manual_clock_starts_at_zero_and_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_millis(), 0);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 250);

        let offset = ManualClock::starting_at(1_000);
        assert_eq!(offset.now_millis(), 1_000);
    }

    #[test]
    fn manual_timer_fires_only_after_deadline() {
        let clock = ManualClock::new();
        let mut timer = clock.after(Duration::from_millis(100));

        assert!(timer.as_mut().now_or_never().is_none());
        clock.advance(Duration::from_millis(99));
        assert!(timer.as_mut().now_or_never().is_none());
        clock.advance(Duration::from_millis(1));
        assert!(timer.as_mut().now_or_never().is_some());
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn zero_duration_completes_immediately() {
        let clock = ManualClock::new();
        assert!(clock.after(Duration::ZERO).now_or_never().is_some());
        assert_eq!(clock.requested(), vec![Duration::ZERO]);
    }

    #[test]
    fn dropped_timers_are_not_counted() {
        let clock = ManualClock::new();
        let timer = clock.after(Duration::from_secs(5));
        assert_eq!(clock.pending_timers(), 1);
        drop(timer);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::default();
        assert_eq!(clock.now_millis(), 0);
        clock.after(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_millis(), 1_500);
    }
}
