//! Value streams.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use regionwatch_core::{Db, Error, Result, Writer};
use tokio::sync::mpsc;

use super::{observe, ObserveOptions, Sink, Subscription};
use crate::observation::RegionObservation;

/// Sink running a fetch on each notification and sending the result down a
/// channel.
struct FetchSink<T, F> {
    tx: mpsc::UnboundedSender<Result<T>>,
    fetch: F,
}

impl<T, F> Sink for FetchSink<T, F>
where
    T: Send + 'static,
    F: FnMut(&Db<'_>) -> Result<T> + Send + 'static,
{
    fn on_next(&mut self, db: &Db<'_>) -> Result<()> {
        let value = (self.fetch)(db)?;
        self.tx.send(Ok(value)).map_err(|_| Error::Disconnected)
    }

    fn on_error(&mut self, error: Error) {
        // The receiver may be gone already.
        let _ = self.tx.send(Err(error));
    }
}

/// A stream of values fetched after each change to an observed region.
///
/// Ends after yielding an error, or once the subscription is cancelled.
/// Dropping the stream cancels the subscription.
pub struct ValueStream<T> {
    rx: mpsc::UnboundedReceiver<Result<T>>,
    subscription: Subscription,
}

impl<T> ValueStream<T> {
    /// Receive the next value, waiting for one.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }

    /// Receive the next value, blocking the current thread.
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<Result<T>> {
        self.rx.blocking_recv()
    }

    /// Take the next value if one is ready.
    pub fn try_next(&mut self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }

    /// The underlying subscription.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Stop the subscription. Values already fetched can still be received.
    pub fn cancel(&self) {
        self.subscription.cancel();
    }
}

impl<T> Stream for ValueStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Stream the result of `fetch` after each change to the observed region.
///
/// With `options.start_immediately`, the first value is fetched before this
/// returns. An error from `fetch` is yielded as `Error::Callback` and ends
/// the stream.
pub fn values<T, F>(
    observation: &RegionObservation,
    writer: &Writer,
    options: ObserveOptions,
    fetch: F,
) -> ValueStream<T>
where
    T: Send + 'static,
    F: FnMut(&Db<'_>) -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = observe(observation, writer, options, FetchSink { tx, fetch });
    ValueStream { rx, subscription }
}
