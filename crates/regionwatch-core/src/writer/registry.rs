//! Observer registrations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::WriterShared;
use crate::observer::TransactionObserver;

/// A registered observer.
pub(crate) struct ObserverEntry {
    id: u64,
    active: AtomicBool,
    observer: Mutex<Box<dyn TransactionObserver>>,
}

impl ObserverEntry {
    pub(crate) fn new(id: u64, observer: Box<dyn TransactionObserver>) -> Self {
        Self {
            id,
            active: AtomicBool::new(true),
            observer: Mutex::new(observer),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Run `f` against the observer.
    ///
    /// Returns `None` without calling `f` if the observer was removed, or if
    /// it is already running further up the stack (a transaction performed
    /// from its own callback).
    pub(crate) fn with_observer<R>(
        &self,
        f: impl FnOnce(&mut dyn TransactionObserver) -> R,
    ) -> Option<R> {
        if !self.active.load(Ordering::SeqCst) {
            return None;
        }
        let mut observer = self.observer.try_lock()?;
        Some(f(&mut **observer))
    }
}

/// Keeps an observer registered with a writer.
///
/// The observer is unregistered by [`remove`](RegistrationHandle::remove) or
/// when the handle is dropped. Removal waits for a write in flight on
/// another thread, so once it returns the observer receives no further
/// calls.
#[must_use = "the observer is removed when the handle is dropped"]
pub struct RegistrationHandle {
    id: u64,
    writer: Weak<WriterShared>,
    removed: AtomicBool,
}

impl RegistrationHandle {
    pub(crate) fn new(id: u64, writer: Weak<WriterShared>) -> Self {
        Self {
            id,
            writer,
            removed: AtomicBool::new(false),
        }
    }

    /// Registration id, unique per writer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unregister the observer. Calling this more than once has no effect.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(writer) = self.writer.upgrade() {
            writer.remove_observer(self.id);
        }
    }

    /// Returns `true` once [`remove`](RegistrationHandle::remove) was called.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("id", &self.id)
            .field("removed", &self.is_removed())
            .finish()
    }
}
