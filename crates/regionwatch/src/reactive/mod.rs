//! Push-based subscriptions over region observations.
//!
//! [`observe`] relays the notifications of a [`RegionObservation`] into a
//! [`Sink`]. [`values`] builds on it to expose a `futures` stream of values
//! fetched on each notification.
//!
//! A subscription ends when it is cancelled or dropped, when its sink fails,
//! or when the writer is closed. Apart from cancellation, every ending is
//! reported to the sink with one final `on_error`.

mod stream;
mod subscription;

use std::sync::Arc;

use parking_lot::Mutex;
use regionwatch_core::{Db, Error, Result, Writer};

use crate::observation::RegionObservation;

pub use self::stream::{values, ValueStream};
pub use self::subscription::Subscription;
use self::subscription::SubscriptionState;

/// Receiver of subscription events.
pub trait Sink: Send + 'static {
    /// The observed region changed, or the initial emission is due.
    ///
    /// `db` is only valid for the duration of the call. Returning an error
    /// ends the subscription with `Error::Callback`.
    fn on_next(&mut self, db: &Db<'_>) -> Result<()>;

    /// The subscription ended with an error. No further calls follow.
    fn on_error(&mut self, error: Error);
}

/// A [`Sink`] made of two closures.
pub struct CallbackSink<N, E> {
    on_next: N,
    on_error: E,
}

impl<N, E> CallbackSink<N, E>
where
    N: FnMut(&Db<'_>) -> Result<()> + Send + 'static,
    E: FnMut(Error) + Send + 'static,
{
    /// Create a sink.
    pub fn new(on_next: N, on_error: E) -> Self {
        Self { on_next, on_error }
    }
}

impl<N, E> Sink for CallbackSink<N, E>
where
    N: FnMut(&Db<'_>) -> Result<()> + Send + 'static,
    E: FnMut(Error) + Send + 'static,
{
    fn on_next(&mut self, db: &Db<'_>) -> Result<()> {
        (self.on_next)(db)
    }

    fn on_error(&mut self, error: Error) {
        (self.on_error)(error)
    }
}

/// Options for [`observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveOptions {
    /// Emit once at subscription time, before any later write.
    pub start_immediately: bool,
}

impl Default for ObserveOptions {
    fn default() -> Self {
        Self {
            start_immediately: true,
        }
    }
}

impl ObserveOptions {
    /// Options that only emit on changes.
    pub fn changes_only() -> Self {
        Self {
            start_immediately: false,
        }
    }

    /// Set whether to emit at subscription time.
    pub fn with_start_immediately(mut self, start_immediately: bool) -> Self {
        self.start_immediately = start_immediately;
        self
    }
}

/// The sink of a subscription. Emptied when the subscription ends.
type SinkSlot<S> = Arc<Mutex<Option<S>>>;

/// Subscribe a sink to an observation.
///
/// The observer is registered and, if `options.start_immediately` is set,
/// the initial emission is delivered, all while the writer is locked: no
/// write can commit between the two, and every later write that touches the
/// region is delivered.
///
/// Registration failures are reported to the sink as `Error::Registration`
/// and leave nothing registered.
pub fn observe<S: Sink>(
    observation: &RegionObservation,
    writer: &Writer,
    options: ObserveOptions,
    sink: S,
) -> Subscription {
    let slot: SinkSlot<S> = Arc::new(Mutex::new(Some(sink)));
    let state = Arc::new(SubscriptionState::new());

    let result = writer.serialized(|db| {
        let on_change = {
            let slot = Arc::clone(&slot);
            let state = Arc::clone(&state);
            move |db: &Db<'_>| emit(&slot, &state, db)
        };
        let on_close = {
            let slot = Arc::clone(&slot);
            let state = Arc::clone(&state);
            move || fail(&slot, &state, Error::Closed)
        };

        let observer = observation
            .observer(db, on_change)?
            .with_close_handler(on_close);
        let handle = db.writer().add_observer(observer)?;
        tracing::debug!(
            observer_id = handle.id(),
            start_immediately = options.start_immediately,
            "subscription started"
        );
        state.attach(handle);

        if options.start_immediately {
            emit(&slot, &state, db);
        }
        Ok(())
    });

    if let Err(err) = result {
        tracing::debug!(error = %err, "subscription failed to start");
        fail(&slot, &state, Error::Registration(Box::new(err)));
    }

    Subscription::new(state)
}

fn emit<S: Sink>(slot: &Mutex<Option<S>>, state: &SubscriptionState, db: &Db<'_>) {
    // Busy when the sink's own `on_next` wrote to the database.
    let Some(mut guard) = slot.try_lock() else {
        tracing::trace!("sink busy, skipping emission");
        return;
    };
    let Some(sink) = guard.as_mut() else {
        return;
    };

    if let Err(err) = sink.on_next(db) {
        tracing::debug!(error = %err, "sink failed, ending subscription");
        sink.on_error(Error::Callback(Box::new(err)));
        *guard = None;
        drop(guard);
        state.terminate();
    }
}

fn fail<S: Sink>(slot: &Mutex<Option<S>>, state: &SubscriptionState, error: Error) {
    let sink = slot.lock().take();
    if let Some(mut sink) = sink {
        sink.on_error(error);
    }
    state.terminate();
}
