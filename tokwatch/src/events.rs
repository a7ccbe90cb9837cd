//! "Expiring" and "expired" notifications derived from an access token's remaining lifetime

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokwatch_clock::{ClockSource, DurationSecs, System};

use crate::{
    event::{SharedHandler, Subscription},
    timer::Timer,
    token::TokenContainer,
};

/// Configuration for access token expiration notifications
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessTokenEventsConfig {
    /// How long before the access token expires that the "expiring" event is raised
    pub expiring_notification_time: DurationSecs,
}

impl Default for AccessTokenEventsConfig {
    /// Default notification configuration
    ///
    /// Raises the "expiring" event 60 seconds before the access token expires.
    fn default() -> Self {
        Self {
            expiring_notification_time: DurationSecs(60),
        }
    }
}

impl AccessTokenEventsConfig {
    /// Constructs a configuration raising the "expiring" event `expiring_notification_time`
    /// before the access token expires
    pub const fn new(expiring_notification_time: DurationSecs) -> Self {
        Self {
            expiring_notification_time,
        }
    }

    /// Replaces the lead time for the "expiring" event
    pub const fn with_expiring_notification_time(
        mut self,
        expiring_notification_time: DurationSecs,
    ) -> Self {
        self.expiring_notification_time = expiring_notification_time;
        self
    }
}

/// Notifications raised as an access token approaches and passes its expiration
///
/// Two timers back these notifications: one raised `expiring_notification_time`
/// before the token expires, and one raised a second after it has expired. Loading
/// a new token re-arms both; subscriptions survive loads and unloads.
#[derive(Debug)]
pub struct AccessTokenEvents<C = System> {
    expiring: Timer<C>,
    expired: Timer<C>,
    expiring_notification_time: DurationSecs,
}

impl AccessTokenEvents {
    /// Constructs notifications driven by the system clock
    pub fn new(config: AccessTokenEventsConfig) -> Self {
        Self::with_clock(config, System)
    }
}

impl<C: ClockSource + 'static> AccessTokenEvents<C> {
    /// Constructs notifications driven by the given clock
    pub fn with_clock(config: AccessTokenEventsConfig, clock: C) -> Self {
        let clock = Arc::new(clock);
        Self {
            expiring: Timer::with_shared_clock("access token expiring", Arc::clone(&clock)),
            expired: Timer::with_shared_clock("access token expired", clock),
            expiring_notification_time: config.expiring_notification_time,
        }
    }

    /// Schedules notifications for the access token held by `container`
    ///
    /// If the container holds no access token or its lifetime is unknown, any
    /// pending notifications are cancelled. A token that has already expired
    /// only schedules the "expired" notification.
    ///
    /// If the clock cannot be read, the error is returned; timers already
    /// re-armed by this call stay armed.
    pub async fn load<T>(&self, container: &T) -> Result<(), C::Error>
    where
        T: TokenContainer + ?Sized,
    {
        let has_token = container
            .access_token()
            .map_or(false, |t| !t.as_str().is_empty());

        let duration = match container.expires_in() {
            Some(duration) if has_token => duration,
            _ => {
                tracing::debug!("no access token with a known lifetime, canceling timers");
                self.expiring.cancel();
                self.expired.cancel();
                return Ok(());
            }
        };

        tracing::debug!(duration, "access token present, remaining duration");

        if duration > 0 {
            let lead = i64::try_from(self.expiring_notification_time.0).unwrap_or(i64::MAX);
            let mut expiring = duration.saturating_sub(lead);
            if expiring <= 0 {
                expiring = 1;
            }

            tracing::debug!(expiring, "registering expiring timer");
            self.expiring.init(expiring).await?;
        } else {
            tracing::debug!("canceling expiring timer because the token is past expiration");
            self.expiring.cancel();
        }

        // Still fires when the token is already past expiration.
        let expired = duration.saturating_add(1);
        tracing::debug!(expired, "registering expired timer");
        self.expired.init(expired).await
    }
}

impl<C> AccessTokenEvents<C> {
    /// Cancels any pending notifications
    ///
    /// Subscriptions are kept for the next [`load`][AccessTokenEvents::load].
    pub fn unload(&self) {
        tracing::debug!("unload: canceling access token timers");
        self.expiring.cancel();
        self.expired.cancel();
    }

    /// The lead time before expiration at which the "expiring" event is raised
    pub fn expiring_notification_time(&self) -> DurationSecs {
        self.expiring_notification_time
    }

    /// Subscribes to the event raised shortly before the access token expires
    pub fn add_access_token_expiring(&self, handler: SharedHandler) -> Subscription {
        self.expiring.add_handler(handler)
    }

    /// Removes the first subscription of `handler` to the "expiring" event
    pub fn remove_access_token_expiring(&self, handler: &SharedHandler) -> bool {
        self.expiring.remove_handler(handler)
    }

    /// Subscribes to the event raised after the access token has expired
    pub fn add_access_token_expired(&self, handler: SharedHandler) -> Subscription {
        self.expired.add_handler(handler)
    }

    /// Removes the first subscription of `handler` to the "expired" event
    pub fn remove_access_token_expired(&self, handler: &SharedHandler) -> bool {
        self.expired.remove_handler(handler)
    }

    /// The timer backing the "expiring" event
    pub fn expiring_timer(&self) -> &Timer<C> {
        &self.expiring
    }

    /// The timer backing the "expired" event
    pub fn expired_timer(&self) -> &Timer<C> {
        &self.expired
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use color_eyre::Result;
    use parking_lot::Mutex;
    use tokwatch_clock::{ClockUnavailable, TestClock, UnixTime};

    use super::*;
    use crate::{
        event::handler_fn,
        token::{AccessToken, TokenState},
    };

    fn setup(lead: u64) -> (TestClock, AccessTokenEvents<TestClock>) {
        let clock = TestClock::new(UnixTime(1_000));
        let events = AccessTokenEvents::with_clock(
            AccessTokenEventsConfig::new(DurationSecs(lead)),
            clock.clone(),
        );
        (clock, events)
    }

    fn token(expires_in: i64) -> TokenState {
        TokenState::new(AccessToken::from_static("access"), expires_in)
    }

    fn counting(count: &Arc<AtomicUsize>) -> SharedHandler {
        let count = Arc::clone(count);
        Arc::new(handler_fn(move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> SharedHandler {
        let log = Arc::clone(log);
        Arc::new(handler_fn(move || {
            log.lock().push(label);
            Ok(())
        }))
    }

    async fn run_for(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs) + Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn load_arms_both_timers() -> Result<()> {
        let (_, events) = setup(5);

        events.load(&token(10)).await?;

        assert!(events.expiring_timer().is_armed());
        assert_eq!(events.expiring_timer().expiration(), UnixTime(1_005));
        assert!(events.expired_timer().is_armed());
        assert_eq!(events.expired_timer().expiration(), UnixTime(1_011));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lead_time_longer_than_lifetime_clamps_expiring() -> Result<()> {
        let (_, events) = setup(5);

        events.load(&token(2)).await?;

        assert_eq!(events.expiring_timer().expiration(), UnixTime(1_001));
        assert_eq!(events.expired_timer().expiration(), UnixTime(1_003));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lead_time_equal_to_lifetime_clamps_expiring() -> Result<()> {
        let (_, events) = setup(5);

        events.load(&token(5)).await?;

        assert_eq!(events.expiring_timer().expiration(), UnixTime(1_001));
        assert_eq!(events.expired_timer().expiration(), UnixTime(1_006));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_only_arms_expired() -> Result<()> {
        let (_, events) = setup(5);

        events.load(&token(10)).await?;
        events.load(&token(-1)).await?;

        assert!(!events.expiring_timer().is_armed());
        assert!(events.expired_timer().is_armed());
        assert_eq!(events.expired_timer().expiration(), UnixTime(1_001));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn zero_lifetime_only_arms_expired() -> Result<()> {
        let (_, events) = setup(5);

        events.load(&token(0)).await?;

        assert!(!events.expiring_timer().is_armed());
        assert_eq!(events.expired_timer().expiration(), UnixTime(1_001));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_notifies_after_one_second() -> Result<()> {
        let (clock, events) = setup(5);
        let expiring = Arc::new(AtomicUsize::new(0));
        let expired = Arc::new(AtomicUsize::new(0));
        events.add_access_token_expiring(counting(&expiring));
        events.add_access_token_expired(counting(&expired));

        events.load(&token(-1)).await?;

        run_for(1).await;
        assert_eq!(expired.load(Ordering::SeqCst), 0);

        clock.inc(1);
        run_for(1).await;
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert_eq!(expiring.load(Ordering::SeqCst), 0);
        assert!(!events.expired_timer().is_armed());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_cancels_both_timers() -> Result<()> {
        let (_, events) = setup(5);

        events.load(&token(10)).await?;
        events
            .load(&TokenState {
                access_token: None,
                expires_in: Some(10),
            })
            .await?;

        assert!(!events.expiring_timer().is_armed());
        assert!(!events.expired_timer().is_armed());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn empty_token_cancels_both_timers() -> Result<()> {
        let (_, events) = setup(5);

        events.load(&token(10)).await?;
        events
            .load(&TokenState::new(AccessToken::from_static(""), 10))
            .await?;

        assert!(!events.expiring_timer().is_armed());
        assert!(!events.expired_timer().is_armed());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_lifetime_cancels_both_timers() -> Result<()> {
        let (_, events) = setup(5);

        events.load(&token(10)).await?;
        events
            .load(&TokenState {
                access_token: Some(AccessToken::from_static("access")),
                expires_in: None,
            })
            .await?;

        assert!(!events.expiring_timer().is_armed());
        assert!(!events.expired_timer().is_armed());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_fire_in_order() -> Result<()> {
        let (clock, events) = setup(5);
        let log = Arc::new(Mutex::new(Vec::new()));
        events.add_access_token_expiring(recording(&log, "expiring"));
        events.add_access_token_expired(recording(&log, "expired"));

        events.load(&token(10)).await?;

        clock.inc(5);
        run_for(5).await;
        assert_eq!(*log.lock(), ["expiring"]);

        clock.inc(6);
        run_for(6).await;
        assert_eq!(*log.lock(), ["expiring", "expired"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unload_keeps_subscriptions() -> Result<()> {
        let (clock, events) = setup(5);
        let count = Arc::new(AtomicUsize::new(0));
        events.add_access_token_expired(counting(&count));

        events.load(&token(10)).await?;
        events.unload();
        assert!(!events.expiring_timer().is_armed());
        assert!(!events.expired_timer().is_armed());

        clock.inc(20);
        run_for(20).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        events.load(&token(3)).await?;
        clock.inc(4);
        run_for(4).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn removed_subscribers_are_not_notified() -> Result<()> {
        let (clock, events) = setup(5);
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting(&count);

        events.add_access_token_expiring(Arc::clone(&handler));
        let subscription = events.add_access_token_expired(Arc::clone(&handler));
        assert!(events.remove_access_token_expiring(&handler));
        assert!(subscription.dispose());
        assert!(!events.remove_access_token_expired(&handler));

        events.load(&token(2)).await?;
        clock.inc(10);
        run_for(10).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn clock_failure_is_reported_by_load() {
        let (clock, events) = setup(5);
        clock.fail_reads(true);

        let result = events.load(&token(10)).await;

        assert_eq!(result, Err(ClockUnavailable));
        assert!(!events.expiring_timer().is_armed());
        assert!(!events.expired_timer().is_armed());
    }

    #[test]
    fn config_deserializes_with_defaults() -> Result<()> {
        let config: AccessTokenEventsConfig = serde_json::from_str("{}")?;
        assert_eq!(config, AccessTokenEventsConfig::default());

        let config: AccessTokenEventsConfig =
            serde_json::from_str(r#"{ "expiring_notification_time": 30 }"#)?;
        assert_eq!(config.expiring_notification_time, DurationSecs(30));
        Ok(())
    }
}
