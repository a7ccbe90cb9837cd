//! A minimal observer registry
//!
//! An [`Event`] holds an ordered list of [`Handler`]s and broadcasts a notification to
//! each of them in turn. A failing handler, whether it returns an error or panics, is
//! logged and skipped; the rest of the handlers are still notified.

use std::{
    borrow::Cow,
    error, fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;

/// The error a handler may report when it fails
pub type HandlerError = Box<dyn error::Error + Send + Sync + 'static>;

/// A registered handler
///
/// The identity of a handler is its allocation: the same `SharedHandler` may be
/// registered more than once, and removal matches on the pointer rather than on
/// the handler's behavior.
pub type SharedHandler = Arc<dyn Handler>;

/// A subscriber to an [`Event`]
///
/// Any `Fn() -> impl Future<Output = Result<(), HandlerError>>` closure is a handler.
/// Synchronous closures can be adapted with [`handler_fn`].
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handles a single notification
    async fn handle(&self) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self) -> Result<(), HandlerError> {
        self().await
    }
}

/// A handler backed by a synchronous closure
///
/// Constructed with [`handler_fn`].
#[derive(Clone, Copy)]
pub struct FnHandler<F>(F);

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Adapts a synchronous closure into a [`Handler`]
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn() -> Result<(), HandlerError> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn() -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self) -> Result<(), HandlerError> {
        (self.0)()
    }
}

/// The outcome of broadcasting to all handlers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RaiseSummary {
    /// Handlers that completed successfully
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

struct Registration {
    id: u64,
    handler: SharedHandler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Registration>,
}

impl Registry {
    fn remove_id(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|r| r.id == id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }
}

fn same_handler(a: &SharedHandler, b: &SharedHandler) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// A named list of handlers that can be notified together
pub struct Event {
    name: Cow<'static, str>,
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl Event {
    /// Constructs an event with no handlers
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            registry: Arc::default(),
        }
    }

    /// The event's diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of current registrations
    pub fn handler_count(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Registers a handler
    ///
    /// Registering the same handler twice yields two independent registrations, each
    /// notified once per broadcast. The returned [`Subscription`] removes only the
    /// registration created by this call.
    pub fn add_handler(&self, handler: SharedHandler) -> Subscription {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push(Registration { id, handler });

        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Removes the first registration of `handler`
    ///
    /// Returns `false` if the handler was not registered.
    pub fn remove_handler(&self, handler: &SharedHandler) -> bool {
        let mut registry = self.registry.lock();
        match registry
            .entries
            .iter()
            .position(|r| same_handler(&r.handler, handler))
        {
            Some(idx) => {
                registry.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Notifies every registered handler in registration order
    ///
    /// Each handler is awaited before the next is started. Handlers registered or
    /// removed while the broadcast is in progress take effect from the next broadcast.
    pub async fn raise(&self) -> RaiseSummary {
        let handlers: Vec<SharedHandler> = self
            .registry
            .lock()
            .entries
            .iter()
            .map(|r| Arc::clone(&r.handler))
            .collect();

        tracing::debug!(event = %self.name, handlers = handlers.len(), "raising event");

        let mut summary = RaiseSummary::default();
        for handler in handlers {
            let outcome = AssertUnwindSafe(async { handler.handle().await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => summary.delivered += 1,
                Ok(Err(error)) => {
                    tracing::warn!(
                        event = %self.name,
                        error = (&*error as &(dyn error::Error + 'static)),
                        "event handler failed"
                    );
                    summary.failed += 1;
                }
                Err(_) => {
                    tracing::error!(event = %self.name, "event handler panicked");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

/// Removes a single registration from an [`Event`] when disposed
///
/// Dropping a subscription without calling [`dispose`][Subscription::dispose] leaves
/// the handler registered.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Subscription {
    /// Removes the registration this subscription was created for
    ///
    /// Returns `false` if it had already been removed or the event no longer exists.
    pub fn dispose(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().remove_id(self.id),
            None => false,
        }
    }
}
