//! Notifications for expiring and expired access tokens
//!
//! Clients holding an access token usually want to know shortly before it expires, so
//! that it can be renewed in the background, and again once it has expired, so that it
//! stops being used. Getting those notifications right is harder than arming a single
//! timer for the token's lifetime:
//!
//! * timers are delivered late when a process is suspended or a device sleeps, and
//! * the client's wall clock may be skewed relative to the authority that issued the token.
//!
//! This crate stores absolute expiration times and re-checks them against a pluggable
//! [`ClockSource`] on a short period, so a notification fires on the first check at or
//! after the expiration, however late that check happens to be.
//!
//! # General Flow
//!
//! ```
//! use std::sync::Arc;
//!
//! use tokwatch::{handler_fn, AccessToken, AccessTokenEvents, AccessTokenEventsConfig, TokenState};
//! use tokwatch_clock::DurationSecs;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let events = AccessTokenEvents::new(AccessTokenEventsConfig::new(DurationSecs(60)));
//!
//! events.add_access_token_expiring(Arc::new(handler_fn(|| {
//!     tracing::info!("access token expiring soon, time to renew");
//!     Ok(())
//! })));
//!
//! events.add_access_token_expired(Arc::new(|| async {
//!     tracing::warn!("access token expired");
//!     Ok::<_, tokwatch::HandlerError>(())
//! }));
//!
//! let token = TokenState::new(AccessToken::from_static("eyJhbGciOi…"), 3_600);
//! # let _: Result<(), std::convert::Infallible> =
//! events.load(&token).await;
//!
//! // When the token is discarded, pending notifications are cancelled.
//! events.unload();
//! # }
//! ```
//!
//! Notifications rely on tasks spawned onto the current tokio runtime.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod event;
mod events;
pub mod timer;
mod token;

pub use event::{
    handler_fn, Event, Handler, HandlerError, RaiseSummary, SharedHandler, Subscription,
};
pub use events::{AccessTokenEvents, AccessTokenEventsConfig};
pub use timer::Timer;
pub use token::{AccessToken, AccessTokenRef, TokenContainer, TokenState};
pub use tokwatch_clock::{Clock, ClockSource, DurationSecs, System, UnixTime};
