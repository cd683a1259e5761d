//! Transaction observers.
//!
//! A [`TransactionObserver`] is registered with a [`Writer`] and is driven by
//! the writer at fixed points of the transaction lifecycle:
//!
//! ```text
//! BEGIN ──► transaction_did_start
//!   statement ──► database_did_change (once per changed row)
//!   statement ──► database_did_change
//! COMMIT ──► transaction_did_commit ──► database_did_commit(db)
//! ROLLBACK ──► database_did_rollback
//! ```
//!
//! Every call happens inside the writer's serialized context, so observers
//! are never called concurrently with each other or with a write. A slow
//! `database_did_commit` delays every later write: the writer's throughput
//! bounds how fast changes can be observed.
//!
//! [`Writer`]: crate::writer::Writer

use crate::event::ChangeEvent;
use crate::region::Region;
use crate::tracker::RegionTracker;
use crate::writer::Db;

/// Hook object invoked by the writer during transactions.
pub trait TransactionObserver: Send {
    /// A write transaction started. The same restrictions as for
    /// [`database_did_change`] apply.
    ///
    /// [`database_did_change`]: TransactionObserver::database_did_change
    fn transaction_did_start(&mut self) {}

    /// A statement changed the database.
    ///
    /// Called from inside SQLite's hooks: implementations must not use the
    /// database or the writer here.
    fn database_did_change(&mut self, event: &ChangeEvent<'_>);

    /// The transaction committed.
    ///
    /// Returns `true` to receive [`database_did_commit`] once every observer
    /// has seen the commit.
    ///
    /// [`database_did_commit`]: TransactionObserver::database_did_commit
    fn transaction_did_commit(&mut self) -> bool;

    /// Deliver the commit notification.
    ///
    /// `db` is only valid for the duration of the call. Writing through
    /// `Writer::write` from here fails with `Error::ReentrantWrite`; use
    /// `reentrant_write` instead. Transactions performed from here are not
    /// reported back to this observer.
    fn database_did_commit(&mut self, db: &Db<'_>);

    /// The transaction rolled back.
    fn database_did_rollback(&mut self);

    /// The writer was closed. No further calls follow.
    fn writer_did_close(&mut self) {}
}

/// Lifecycle of a [`RegionObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    /// No transaction in flight.
    Idle,
    /// A transaction is in flight and has not touched the region yet.
    Armed,
    /// A transaction is in flight and has touched the region.
    Touched,
}

/// Observer that fires a callback once per committed transaction touching
/// its region.
pub struct RegionObserver<F> {
    tracker: RegionTracker,
    state: ObserverState,
    on_change: F,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<F> RegionObserver<F>
where
    F: FnMut(&Db<'_>) + Send,
{
    /// Create an observer for a region.
    pub fn new(region: Region, on_change: F) -> Self {
        Self {
            tracker: RegionTracker::new(region),
            state: ObserverState::Idle,
            on_change,
            on_close: None,
        }
    }

    /// Run `on_close` when the writer is closed.
    pub fn with_close_handler(mut self, on_close: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(on_close));
        self
    }

    /// The observed region.
    pub fn region(&self) -> &Region {
        self.tracker.region()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ObserverState {
        self.state
    }
}

impl<F> TransactionObserver for RegionObserver<F>
where
    F: FnMut(&Db<'_>) + Send,
{
    fn transaction_did_start(&mut self) {
        self.state = ObserverState::Armed;
    }

    fn database_did_change(&mut self, event: &ChangeEvent<'_>) {
        if self.state == ObserverState::Armed && self.tracker.touches(event) {
            tracing::trace!(
                region = %self.tracker.region(),
                table = event.table(),
                "transaction touched observed region"
            );
            self.state = ObserverState::Touched;
        }
    }

    fn transaction_did_commit(&mut self) -> bool {
        let touched = self.state == ObserverState::Touched;
        self.state = ObserverState::Idle;
        touched
    }

    fn database_did_commit(&mut self, db: &Db<'_>) {
        (self.on_change)(db);
    }

    fn database_did_rollback(&mut self) {
        self.state = ObserverState::Idle;
    }

    fn writer_did_close(&mut self) {
        self.state = ObserverState::Idle;
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}
