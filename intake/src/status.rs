//! Cascading time-windowed counters for operational visibility.
//!
//! Each named metric keeps four windows at decreasing resolution: the last 60
//! seconds, the last 60 minutes, the last 24 hours and the last 360 days. The
//! ingestion layer adds to a metric's in-progress second; everything else is
//! driven by four independent tier ticks.
//!
//! # Semantics
//!
//! A tick of tier T shifts T's window by one slot. The slot pushed in is the
//! 'carry' of the next finer tier, the running total of values that tier has
//! evicted since T last ticked. The slot evicted from T accumulates into T's
//! own carry, waiting for the next coarser tier to tick. The seconds tier
//! pushes the in-progress value instead of a carry; the days tier drops its
//! evicted slot, 360 days being the retention horizon.
//!
//! ```text
//! current --second--> [60 s] --evict--> seconds_carry
//! seconds_carry --minute--> [60 m] --evict--> minutes_carry
//! minutes_carry --hour--> [24 h] --evict--> hours_carry
//! hours_carry --day--> [360 d] --evict--> (dropped)
//! ```
//!
//! The newest slot of a coarser window is therefore the exact sum of the
//! finer activity flushed into it. Nothing is approximated and nothing is lost
//! across a tier boundary, only delayed.
//!
//! Ticks are not compensated for drift. If the process stalls past several
//! deadlines each tier ticks once when it resumes, see
//! [`crate::clock::Periodic`].

use std::{
    collections::VecDeque,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use metrics::gauge;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::{Clock, Periodic};

const SECONDS_IN_MINUTE: usize = 60;
const MINUTES_IN_HOUR: usize = 60;
const HOURS_IN_DAY: usize = 24;
const DAYS_OF_HISTORY: usize = 360;

/// Errors produced by this module.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The timeframe code does not name a tier.
    #[error("Unknown timeframe: {0}")]
    UnknownTier(String),
}

/// A resolution level of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// One slot per second, 60 slots.
    Seconds,
    /// One slot per minute, 60 slots.
    Minutes,
    /// One slot per hour, 24 slots.
    Hours,
    /// One slot per day, 360 slots.
    Days,
}

impl Tier {
    /// All tiers, finest first. Ticks due at the same instant apply in this
    /// order.
    pub const ALL: [Tier; 4] = [Tier::Seconds, Tier::Minutes, Tier::Hours, Tier::Days];

    /// Number of slots in this tier's window.
    #[must_use]
    pub fn len(self) -> usize {
        match self {
            Tier::Seconds => SECONDS_IN_MINUTE,
            Tier::Minutes => MINUTES_IN_HOUR,
            Tier::Hours => HOURS_IN_DAY,
            Tier::Days => DAYS_OF_HISTORY,
        }
    }

    /// Real time covered by one slot.
    #[must_use]
    pub fn period(self) -> Duration {
        const SECOND: u64 = 1;
        const MINUTE: u64 = SECOND * SECONDS_IN_MINUTE as u64;
        const HOUR: u64 = MINUTE * MINUTES_IN_HOUR as u64;
        const DAY: u64 = HOUR * HOURS_IN_DAY as u64;

        Duration::from_secs(match self {
            Tier::Seconds => SECOND,
            Tier::Minutes => MINUTE,
            Tier::Hours => HOUR,
            Tier::Days => DAY,
        })
    }

    fn idx(self) -> usize {
        match self {
            Tier::Seconds => 0,
            Tier::Minutes => 1,
            Tier::Hours => 2,
            Tier::Days => 3,
        }
    }
}

impl FromStr for Tier {
    type Err = Error;

    /// Parses the status API timeframe codes `ss`, `mm`, `hh` and `dd`, and
    /// the tier names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ss" | "seconds" => Ok(Tier::Seconds),
            "mm" | "minutes" => Ok(Tier::Minutes),
            "hh" | "hours" => Ok(Tier::Hours),
            "dd" | "days" => Ok(Tier::Days),
            other => Err(Error::UnknownTier(other.to_string())),
        }
    }
}

/// Remove the oldest slot, push `value` as the newest, return the evicted
/// value.
fn shift(window: &mut VecDeque<u64>, value: u64) -> u64 {
    let evicted = window.pop_front().unwrap_or(0);
    window.push_back(value);
    evicted
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Metric {
    current: u64,
    seconds: VecDeque<u64>,
    seconds_carry: u64,
    minutes: VecDeque<u64>,
    minutes_carry: u64,
    hours: VecDeque<u64>,
    hours_carry: u64,
    days: VecDeque<u64>,
}

impl Metric {
    fn new() -> Self {
        let zeroed = |tier: Tier| VecDeque::from(vec![0; tier.len()]);
        Self {
            current: 0,
            seconds: zeroed(Tier::Seconds),
            seconds_carry: 0,
            minutes: zeroed(Tier::Minutes),
            minutes_carry: 0,
            hours: zeroed(Tier::Hours),
            hours_carry: 0,
            days: zeroed(Tier::Days),
        }
    }

    fn window(&self, tier: Tier) -> &VecDeque<u64> {
        match tier {
            Tier::Seconds => &self.seconds,
            Tier::Minutes => &self.minutes,
            Tier::Hours => &self.hours,
            Tier::Days => &self.days,
        }
    }

    fn tick(&mut self, tier: Tier) {
        match tier {
            Tier::Seconds => {
                let evicted = shift(&mut self.seconds, self.current);
                self.current = 0;
                self.seconds_carry = self.seconds_carry.saturating_add(evicted);
            }
            Tier::Minutes => {
                let evicted = shift(&mut self.minutes, self.seconds_carry);
                self.seconds_carry = 0;
                self.minutes_carry = self.minutes_carry.saturating_add(evicted);
            }
            Tier::Hours => {
                let evicted = shift(&mut self.hours, self.minutes_carry);
                self.minutes_carry = 0;
                self.hours_carry = self.hours_carry.saturating_add(evicted);
            }
            Tier::Days => {
                shift(&mut self.days, self.hours_carry);
                self.hours_carry = 0;
            }
        }
    }
}

/// The set of all named metrics.
#[derive(Debug, Default)]
pub struct Aggregator {
    metrics: FxHashMap<String, Metric>,
}

impl Aggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to the in-progress second of `key`, creating the metric
    /// with zeroed windows if this is its first use.
    pub fn increment(&mut self, key: &str, amount: u64) {
        if !self.metrics.contains_key(key) {
            self.metrics.insert(key.to_string(), Metric::new());
        }
        if let Some(metric) = self.metrics.get_mut(key) {
            metric.current = metric.current.saturating_add(amount);
        }
    }

    /// Snapshot `tier`'s window for every known metric, oldest slot first.
    #[must_use]
    pub fn window(&self, tier: Tier) -> FxHashMap<String, Vec<u64>> {
        self.metrics
            .iter()
            .map(|(key, metric)| (key.clone(), metric.window(tier).iter().copied().collect()))
            .collect()
    }

    /// Apply one tick of `tier` to every metric.
    pub fn tick(&mut self, tier: Tier) {
        for metric in self.metrics.values_mut() {
            metric.tick(tier);
        }
    }

    /// Drop every metric.
    pub fn reset(&mut self) {
        self.metrics.clear();
    }

    /// Number of known metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether no metric has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Tracks the four tier deadlines independently.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    deadlines: [Periodic; 4],
}

impl Schedule {
    /// Arm all four tiers relative to `now`, in clock ticks.
    #[must_use]
    pub fn new(now: u64) -> Self {
        Self {
            deadlines: Tier::ALL.map(|tier| Periodic::from_duration(tier.period(), now)),
        }
    }

    /// Return the tiers due at `now`, finest first, each at most once.
    pub fn advance_to(&mut self, now: u64) -> Vec<Tier> {
        Tier::ALL
            .into_iter()
            .filter(|tier| self.deadlines[tier.idx()].poll(now))
            .collect()
    }

    /// Ticks until the earliest tier deadline.
    #[must_use]
    pub fn until_next(&self, now: u64) -> u64 {
        self.deadlines
            .iter()
            .map(|d| d.until_next(now))
            .min()
            .unwrap_or(0)
    }
}

/// Shared handle onto an [`Aggregator`].
///
/// All mutation happens under one lock; no operation holds it across an
/// await point.
#[derive(Debug, Clone, Default)]
pub struct Handle {
    inner: Arc<Mutex<Aggregator>>,
}

impl Handle {
    /// Create a handle onto an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Aggregator> {
        // Aggregator updates are plain arithmetic; a panic mid-update cannot
        // leave it in a state worth refusing to read.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [`Aggregator::increment`].
    pub fn increment(&self, key: &str, amount: u64) {
        self.lock().increment(key, amount);
    }

    /// See [`Aggregator::window`].
    #[must_use]
    pub fn window(&self, tier: Tier) -> FxHashMap<String, Vec<u64>> {
        self.lock().window(tier)
    }

    /// See [`Aggregator::reset`].
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Apply each tier in `tiers`, in order.
    pub fn tick(&self, tiers: &[Tier]) {
        if tiers.is_empty() {
            return;
        }
        let mut aggregator = self.lock();
        for tier in tiers {
            aggregator.tick(*tier);
        }
        #[allow(clippy::cast_precision_loss)]
        gauge!("status_metrics").set(aggregator.len() as f64);
    }
}

/// Drives the tier ticks of a [`Handle`] from a [`Clock`].
#[derive(Debug)]
pub struct Server<C> {
    handle: Handle,
    clock: C,
    schedule: Schedule,
    shutdown: intake_signal::Watcher,
}

impl<C> Server<C>
where
    C: Clock + Send + Sync,
{
    /// Create a new [`Server`]. Tier deadlines are armed relative to the
    /// clock's current reading.
    pub fn new(handle: Handle, clock: C, shutdown: intake_signal::Watcher) -> Self {
        let schedule = Schedule::new(clock.ticks_elapsed());
        Self {
            handle,
            clock,
            schedule,
            shutdown,
        }
    }

    /// Run the tier timers until the shutdown signal is received. All four
    /// timers stop with this task.
    pub async fn spin(self) {
        let Self {
            handle,
            clock,
            mut schedule,
            shutdown,
        } = self;

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            let wait = schedule.until_next(clock.ticks_elapsed());
            tokio::select! {
                () = clock.wait(wait) => {
                    let due = schedule.advance_to(clock.ticks_elapsed());
                    if !due.is_empty() {
                        debug!(?due, "status tiers ticked");
                    }
                    handle.tick(&due);
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            }
        }
    }
}
