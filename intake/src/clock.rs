//! Time sources for intake's timer-driven components.
//!
//! Every periodic behaviour in intake is expressed as a [`Periodic`] deadline
//! polled against a [`Clock`]. The deadline arithmetic is pure and so can be
//! driven by a virtual clock in tests; only the `Clock` implementation touches
//! real time.

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::time::{Duration, Instant, sleep};

#[async_trait]
/// The `Clock` used by every timer task. A tick is one millisecond.
pub trait Clock {
    /// The number of ticks elapsed since the clock was created
    fn ticks_elapsed(&self) -> u64;
    /// Wait for `ticks` amount of time
    async fn wait(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    #[allow(clippy::cast_possible_truncation)]
    fn ticks_elapsed(&self) -> u64 {
        // u64 milliseconds covers ~584 million years of uptime.
        Instant::now().duration_since(self.start).as_millis() as u64
    }

    async fn wait(&self, ticks: u64) {
        sleep(Duration::from_millis(ticks)).await;
    }
}

/// A repeating deadline measured in clock ticks.
///
/// `poll` fires at most once per call. If the clock has jumped past several
/// deadlines, as when the process is suspended, those are collapsed into a
/// single firing and the next deadline is the first one strictly after `now`.
/// Missed periods are never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Periodic {
    period: u64,
    next: u64,
}

impl Periodic {
    /// Create a deadline that first fires one `period` after `now`. A zero
    /// period is treated as one tick.
    #[must_use]
    pub fn new(period: u64, now: u64) -> Self {
        let period = period.max(1);
        Self {
            period,
            next: now.saturating_add(period),
        }
    }

    /// Create a deadline from a `Duration`, truncated to whole ticks.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_duration(period: Duration, now: u64) -> Self {
        Self::new(period.as_millis() as u64, now)
    }

    /// Returns true if the deadline has passed, advancing it.
    pub fn poll(&mut self, now: u64) -> bool {
        if now < self.next {
            return false;
        }
        let missed = (now - self.next) / self.period;
        self.next = self
            .next
            .saturating_add(missed.saturating_add(1).saturating_mul(self.period));
        true
    }

    /// Ticks remaining until the next firing.
    #[must_use]
    pub fn until_next(&self, now: u64) -> u64 {
        self.next.saturating_sub(now)
    }

    /// The tick at which this deadline next fires.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.next
    }

    /// The period of this deadline in ticks.
    #[must_use]
    pub fn period(&self) -> u64 {
        self.period
    }
}

/// The current wall-clock time in UTC.
#[must_use]
pub fn utc_now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::Clock;

    /// A clock that only moves when told to.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct ManualClock {
        now: Arc<AtomicU64>,
        notify: Arc<Notify>,
    }

    impl ManualClock {
        pub(crate) fn advance(&self, ticks: u64) {
            self.now.fetch_add(ticks, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn ticks_elapsed(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        async fn wait(&self, ticks: u64) {
            let target = self.ticks_elapsed().saturating_add(ticks);
            loop {
                let notified = self.notify.notified();
                if self.ticks_elapsed() >= target {
                    return;
                }
                notified.await;
            }
        }
    }
}
