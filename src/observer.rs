//! Observer seam between event producers and whoever records them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::scheduler::ActionHandle;

/// Receives notifications from a producer.
///
/// Producers deliver `on_subscribe` first, then any number of `on_next`,
/// then at most one of `on_error`/`on_complete`. Observers must not rely on
/// that last rule; a misbehaving producer may terminate more than once.
pub trait Observer<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Subscription);
    fn on_next(&self, value: T);
    fn on_error(&self, error: anyhow::Error);
    fn on_complete(&self);
}

impl<T, O: Observer<T> + ?Sized> Observer<T> for Arc<O> {
    fn on_subscribe(&self, subscription: Subscription) {
        self.as_ref().on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.as_ref().on_next(value);
    }

    fn on_error(&self, error: anyhow::Error) {
        self.as_ref().on_error(error);
    }

    fn on_complete(&self) {
        self.as_ref().on_complete();
    }
}

#[derive(Default)]
struct SubscriptionInner {
    disposed: AtomicBool,
    pending: Mutex<Option<ActionHandle>>,
}

/// Handle to a producer's resources.
///
/// Disposing cancels whatever the producer has scheduled and stops further
/// deliveries. Clones share the same state.
#[derive(Clone, Default)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the producer's resources. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = pending {
            handle.cancel();
        }
        tracing::trace!(event = "subscription.dispose", "Subscription disposed");
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Track the producer's next scheduled action so disposal can cancel it.
    ///
    /// If the subscription is already disposed the action is cancelled at once.
    pub fn set_pending(&self, handle: ActionHandle) {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_disposed() {
            handle.cancel();
            return;
        }
        *pending = Some(handle);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
