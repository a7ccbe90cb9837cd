//! Clock sources for token expiration timers
//!
//! A client's wall clock is not always trustworthy. Daylight saving and timezone
//! misconfiguration, or a user flipping AM and PM, all leave the client with a clock that is
//! "correct" to the user but skewed relative to the token authority. The types here let a
//! consumer decide where "now" comes from: the local system clock, a clock corrected against a
//! server-trusted reading, an asynchronous time service, or a manually driven clock in tests.
//!
//! All readings are whole seconds since the Unix epoch.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    convert::Infallible,
    error, fmt, ops,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Unix time
///
/// Unix time as represented by the number of seconds elapsed since the
/// beginning of the Unix epoch on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
#[repr(transparent)]
pub struct UnixTime(pub u64);

impl From<SystemTime> for UnixTime {
    /// Converts a system time, flooring to whole seconds
    ///
    /// Times before the Unix epoch saturate to the epoch itself.
    #[inline]
    fn from(t: SystemTime) -> Self {
        let time = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        UnixTime(time)
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A span of whole seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
#[repr(transparent)]
pub struct DurationSecs(pub u64);

impl fmt::Display for DurationSecs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

impl From<DurationSecs> for Duration {
    #[inline]
    fn from(d: DurationSecs) -> Self {
        Duration::from_secs(d.0)
    }
}

impl ops::Add<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        UnixTime(self.0.saturating_add(rhs.0))
    }
}

impl ops::AddAssign<DurationSecs> for UnixTime {
    #[inline]
    fn add_assign(&mut self, rhs: DurationSecs) {
        *self = *self + rhs;
    }
}

impl ops::Sub<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: DurationSecs) -> Self::Output {
        UnixTime(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Sub for UnixTime {
    type Output = DurationSecs;

    /// The span between two times, saturating at zero
    #[inline]
    fn sub(self, rhs: UnixTime) -> Self::Output {
        DurationSecs(self.0.saturating_sub(rhs.0))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTime;
}

/// A source of the current time which may need to suspend or fail
///
/// This is the capability consumed by expiration timers. Remote time services
/// (for example, a server endpoint reporting trusted time) implement this directly.
/// Any synchronous [`Clock`] is also a `ClockSource` that never fails.
#[async_trait]
pub trait ClockSource: Send + Sync {
    /// The error returned when the current time cannot be determined
    type Error: error::Error + Send + Sync + 'static;

    /// Gets the current time in seconds since the Unix epoch
    async fn epoch_time(&self) -> Result<UnixTime, Self::Error>;
}

#[async_trait]
impl<C> ClockSource for C
where
    C: Clock + Send + Sync,
{
    type Error = Infallible;

    #[inline]
    async fn epoch_time(&self) -> Result<UnixTime, Self::Error> {
        Ok(self.now())
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime::from(SystemTime::now())
    }
}

/// A clock corrected by a fixed offset
///
/// Used to bring a skewed local clock in line with a trusted reference, such
/// as the time reported by the token authority.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkewedClock<C = System> {
    inner: C,
    offset_secs: i64,
}

impl<C> SkewedClock<C> {
    /// Wraps `inner`, shifting every reading by `offset_secs`
    pub const fn new(inner: C, offset_secs: i64) -> Self {
        Self { inner, offset_secs }
    }

    /// The offset applied to the inner clock's readings
    pub const fn offset_secs(&self) -> i64 {
        self.offset_secs
    }
}

impl<C: Clock> SkewedClock<C> {
    /// Derives the offset from a reference time observed at the same moment
    /// as the inner clock's current reading
    pub fn from_reference(inner: C, reference: UnixTime) -> Self {
        let local = inner.now();
        let offset_secs = if reference >= local {
            i64::try_from((reference - local).0).unwrap_or(i64::MAX)
        } else {
            i64::try_from((local - reference).0)
                .map(|d| -d)
                .unwrap_or(i64::MIN)
        };

        Self { inner, offset_secs }
    }
}

impl<C: Clock> Clock for SkewedClock<C> {
    fn now(&self) -> UnixTime {
        let local = self.inner.now();
        let magnitude = DurationSecs(self.offset_secs.unsigned_abs());
        if self.offset_secs >= 0 {
            local + magnitude
        } else {
            local - magnitude
        }
    }
}

/// Error returned by a [`TestClock`] configured to fail its reads
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("clock is unavailable")]
pub struct ClockUnavailable;

/// A test clock which maintains the current time as internal state
///
/// Clones share the same underlying time, so a handle kept by a test can drive
/// a clock that has been moved into a timer.
#[derive(Clone, Debug, Default)]
pub struct TestClock {
    time: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl TestClock {
    /// Creates a new test clock with the specified time
    pub fn new(time: UnixTime) -> Self {
        Self {
            time: Arc::new(AtomicU64::new(time.0)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Gets the clock's current time
    pub fn now(&self) -> UnixTime {
        UnixTime(self.time.load(Ordering::SeqCst))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixTime) {
        self.time.store(val.0, Ordering::SeqCst);
    }

    /// Increments the clock's current time by `inc` seconds
    pub fn inc(&self, inc: u64) {
        self.time.fetch_add(inc, Ordering::SeqCst);
    }

    /// When `fail` is set, reads through [`ClockSource`] return [`ClockUnavailable`]
    pub fn fail_reads(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClockSource for TestClock {
    type Error = ClockUnavailable;

    async fn epoch_time(&self) -> Result<UnixTime, Self::Error> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ClockUnavailable)
        } else {
            Ok(self.now())
        }
    }
}
