//! Subscription handles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use regionwatch_core::RegistrationHandle;

/// Shared between a [`Subscription`] and the observer feeding it.
pub(crate) struct SubscriptionState {
    handle: Mutex<Option<RegistrationHandle>>,
    terminated: AtomicBool,
}

impl SubscriptionState {
    pub(crate) fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    /// Take ownership of the registration. A subscription that already
    /// ended removes it right away.
    pub(crate) fn attach(&self, handle: RegistrationHandle) {
        if self.is_terminated() {
            handle.remove();
            return;
        }
        *self.handle.lock() = Some(handle);
    }

    /// End the subscription and unregister its observer.
    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.remove();
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// A running subscription.
///
/// Dropping the subscription cancels it.
#[must_use = "the subscription is cancelled when dropped"]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn new(state: Arc<SubscriptionState>) -> Self {
        Self { state }
    }

    /// Stop receiving notifications.
    ///
    /// If a notification is being delivered on another thread, this waits
    /// for it to finish. No notification is delivered once this returns.
    /// Calling this more than once has no effect.
    pub fn cancel(&self) {
        if !self.state.is_terminated() {
            tracing::debug!("subscription cancelled");
        }
        self.state.terminate();
    }

    /// Returns `true` until the subscription is cancelled or ends with an
    /// error.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminated()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
