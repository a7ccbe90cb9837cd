//! A single-shot expiration alarm that tolerates clock drift and late timers
//!
//! Platform timers cannot be trusted to fire on time: a suspended process or a
//! sleeping device will deliver them late, and a client's wall clock may disagree
//! with the authority that issued a token. Rather than waiting once for the whole
//! duration, a [`Timer`] stores the absolute expiration and polls its
//! [`ClockSource`] on a short period, firing on the first check at or after the
//! expiration, however late that check is.

use std::{
    borrow::Cow,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokwatch_clock::{ClockSource, DurationSecs, UnixTime};

use crate::event::{Event, SharedHandler, Subscription};

/// The longest period between two expiration checks
pub const MAX_CHECK_INTERVAL: DurationSecs = DurationSecs(5);

struct Schedule {
    generation: u64,
    period: DurationSecs,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    expiration: UnixTime,
    generation: u64,
    schedule: Option<Schedule>,
}

impl State {
    fn is_current(&self, generation: u64) -> bool {
        self.schedule
            .as_ref()
            .map_or(false, |s| s.generation == generation)
    }
}

struct Inner<C> {
    name: Cow<'static, str>,
    clock: Arc<C>,
    event: Event,
    state: Mutex<State>,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(schedule) = self.state.get_mut().schedule.take() {
            schedule.task.abort();
        }
    }
}

/// A drift-tolerant, single-shot expiration timer
///
/// Cloning a `Timer` produces another handle to the same timer. Arming a timer
/// spawns a polling task onto the current tokio runtime; the task ends when the
/// timer fires, is cancelled, or every handle has been dropped.
pub struct Timer<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Timer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for Timer<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Timer")
            .field("name", &self.inner.name)
            .field("expiration", &state.expiration)
            .field("armed", &state.schedule.is_some())
            .field("event", &self.inner.event)
            .finish()
    }
}

impl<C> Timer<C> {
    /// The timer's diagnostic name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The time at which the timer fires
    ///
    /// Only meaningful while the timer [is armed][Timer::is_armed]; zero if the
    /// timer has never been armed.
    pub fn expiration(&self) -> UnixTime {
        self.inner.state.lock().expiration
    }

    /// Whether the timer currently has a pending schedule
    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().schedule.is_some()
    }

    /// How often the pending schedule re-checks the clock, if armed
    pub fn check_period(&self) -> Option<DurationSecs> {
        self.inner.state.lock().schedule.as_ref().map(|s| s.period)
    }

    /// Registers a handler to be notified when the timer fires
    pub fn add_handler(&self, handler: SharedHandler) -> Subscription {
        self.inner.event.add_handler(handler)
    }

    /// Removes the first registration of `handler`
    pub fn remove_handler(&self, handler: &SharedHandler) -> bool {
        self.inner.event.remove_handler(handler)
    }

    /// Disarms the timer
    ///
    /// Safe to call when the timer is not armed. Registered handlers are kept.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        if let Some(schedule) = state.schedule.take() {
            tracing::debug!(
                timer = %self.inner.name,
                expiration = state.expiration.0,
                "canceling timer"
            );
            schedule.task.abort();
        }
    }
}

impl<C: ClockSource + 'static> Timer<C> {
    /// Constructs an unarmed timer reading time from `clock`
    pub fn new(name: impl Into<Cow<'static, str>>, clock: C) -> Self {
        Self::with_shared_clock(name, Arc::new(clock))
    }

    /// Constructs an unarmed timer reading time from a clock shared with other timers
    pub fn with_shared_clock(name: impl Into<Cow<'static, str>>, clock: Arc<C>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                event: Event::new(name.clone()),
                name,
                clock,
                state: Mutex::default(),
            }),
        }
    }

    /// Arms the timer to fire `duration_secs` seconds from now
    ///
    /// Durations below one second are treated as one second. If the timer is already
    /// armed for the same expiration, the existing schedule is left alone; otherwise
    /// any existing schedule is replaced.
    ///
    /// If the clock cannot be read, the error is returned and the timer is left as it was.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a tokio runtime.
    pub async fn init(&self, duration_secs: i64) -> Result<(), C::Error> {
        let duration = DurationSecs(duration_secs.max(1).unsigned_abs());
        let now = self.inner.clock.epoch_time().await?;
        let expiration = now + duration;

        let mut state = self.inner.state.lock();
        if state.schedule.is_some() && state.expiration == expiration {
            tracing::debug!(
                timer = %self.inner.name,
                expiration = expiration.0,
                "skipping since already initialized for expiration"
            );
            return Ok(());
        }

        if let Some(previous) = state.schedule.take() {
            tracing::debug!(
                timer = %self.inner.name,
                expiration = state.expiration.0,
                "canceling timer"
            );
            previous.task.abort();
        }

        let period = duration.min(MAX_CHECK_INTERVAL);
        state.expiration = expiration;
        state.generation += 1;
        let generation = state.generation;

        tracing::debug!(
            timer = %self.inner.name,
            duration = duration.0,
            expiration = expiration.0,
            period = period.0,
            "using duration"
        );

        let task = tokio::spawn(poll_expiration(
            Arc::downgrade(&self.inner),
            generation,
            Instant::now(),
            period.into(),
        ));

        state.schedule = Some(Schedule {
            generation,
            period,
            task,
        });

        Ok(())
    }
}

async fn poll_expiration<C>(
    inner: Weak<Inner<C>>,
    generation: u64,
    armed_at: Instant,
    period: Duration,
) where
    C: ClockSource + 'static,
{
    let mut interval = time::interval_at(armed_at + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };

        if inner.check_expiration(generation).await {
            return;
        }
    }
}

impl<C: ClockSource> Inner<C> {
    /// Returns `true` once this schedule is finished, either because it fired or
    /// because it was superseded
    async fn check_expiration(&self, generation: u64) -> bool {
        let now = match self.clock.epoch_time().await {
            Ok(now) => now,
            Err(error) => {
                tracing::warn!(
                    timer = %self.name,
                    error = (&error as &dyn std::error::Error),
                    "unable to read clock, will check again"
                );
                return false;
            }
        };

        {
            let mut state = self.state.lock();
            if !state.is_current(generation) {
                return true;
            }

            let expiration = state.expiration;
            tracing::trace!(
                timer = %self.name,
                remaining = (expiration - now).0,
                "checking timer"
            );

            if now < expiration {
                return false;
            }

            // Detached rather than aborted; the broadcast below runs on this task.
            state.schedule = None;
            tracing::debug!(
                timer = %self.name,
                expiration = expiration.0,
                now = now.0,
                "timer expired, raising event"
            );
        }

        self.event.raise().await;
        true
    }
}
